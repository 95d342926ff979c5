//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;
use wf_repl::enums::DomainOperation;
use wf_repl::task::{
    DomainTaskAttributes, FailoverMarkerAttributes, HistoryTaskV2Attributes, TaskPayload,
};
use wf_repl::types::{DataBlob, VersionHistoryItem};
use wf_repl::{ReplConfig, ReplicationNode, ReplicationTask};

/// Domain id used by every history fixture.
pub const DOMAIN: &str = "orders";

/// A node with fast polling and no apply retries.
pub fn node(name: &str, shards: u32) -> ReplicationNode {
    let mut config = ReplConfig::default();
    config.cluster.local_cluster_name = name.to_string();
    config.cluster.shard_count = shards;
    config.source.page_size = 3;
    config.processor.poll_interval_ms = 10;
    config.retry.max_attempts = 1;
    ReplicationNode::in_memory(config)
}

/// Run key string the in-memory applier records for a history fixture.
pub fn run_target(run_id: &str) -> String {
    format!("{}/checkout/{}", DOMAIN, run_id)
}

pub fn history(id: i64, run_id: &str, version: i64) -> ReplicationTask {
    ReplicationTask::new(
        id,
        TaskPayload::HistoryV2(HistoryTaskV2Attributes {
            domain_id: DOMAIN.to_string(),
            workflow_id: "checkout".to_string(),
            run_id: run_id.to_string(),
            version_history_items: vec![VersionHistoryItem::new(id * 10, version)],
            events: Some(DataBlob::default()),
            new_run_events: None,
        }),
    )
}

pub fn domain_update(id: i64, domain_id: &str, failover_version: i64) -> ReplicationTask {
    ReplicationTask::new(
        id,
        TaskPayload::Domain(DomainTaskAttributes {
            domain_operation: DomainOperation::Update,
            id: domain_id.to_string(),
            failover_version,
            ..Default::default()
        }),
    )
}

pub fn marker(id: i64, domain_id: &str, version: i64, creation_time: i64) -> ReplicationTask {
    ReplicationTask::new(
        id,
        TaskPayload::FailoverMarker(FailoverMarkerAttributes::new(
            domain_id,
            version,
            Some(creation_time),
        )),
    )
}

/// Let spawned processors run for `ms` of (paused) tokio time.
pub async fn run_for(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
