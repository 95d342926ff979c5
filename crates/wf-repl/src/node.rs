//! One cluster's replication stack wired over in-memory collaborators.
//!
//! A [`ReplicationNode`] owns both sides of the cursor protocol: the
//! [`ReplicationSource`] other clusters pull from, and the engine that pulls
//! from the clusters it has been connected to.

use crate::applier::MemoryApplier;
use crate::client::LocalReplicationClient;
use crate::config::ReplConfig;
use crate::cursor::MemoryCursorStore;
use crate::dispatcher::TaskDispatcher;
use crate::dlq::DlqManager;
use crate::dlq_store::MemoryDlqStore;
use crate::engine::{EngineState, ReplicationEngine};
use crate::failover_marker::FailoverMarkerTracker;
use crate::metrics::ReplMetrics;
use crate::source::ReplicationSource;
use crate::task_store::MemoryTaskLog;
use crate::types::ShardId;
use std::sync::Arc;
use tracing::info;

/// A cluster's replication stack.
pub struct ReplicationNode {
    config: ReplConfig,
    /// Per-shard task log served to other clusters.
    pub task_log: Arc<MemoryTaskLog>,
    /// Domain task log served to other clusters.
    pub domain_log: Arc<MemoryTaskLog>,
    /// Serving side of the cursor protocol.
    pub source: Arc<ReplicationSource>,
    /// Local state replicated tasks are applied to.
    pub applier: Arc<MemoryApplier>,
    /// Parked tasks.
    pub dlq_store: Arc<MemoryDlqStore>,
    /// Persisted pull positions.
    pub cursors: Arc<MemoryCursorStore>,
    /// Operator surface over the DLQ.
    pub dlq: Arc<DlqManager>,
    /// Pulling side of the cursor protocol.
    pub engine: Arc<ReplicationEngine>,
}

impl ReplicationNode {
    /// Build a node from `config` with every collaborator in memory.
    pub fn in_memory(config: ReplConfig) -> Self {
        let task_log = Arc::new(MemoryTaskLog::new());
        let domain_log = Arc::new(MemoryTaskLog::new());
        let source = Arc::new(ReplicationSource::new(
            config.cluster.local_cluster_name.clone(),
            task_log.clone(),
            domain_log.clone(),
            config.source.clone(),
        ));
        let applier = Arc::new(MemoryApplier::new());
        let dlq_store = Arc::new(MemoryDlqStore::new());
        let tracker = Arc::new(FailoverMarkerTracker::new(
            (0..config.cluster.shard_count as i32).map(ShardId::new),
        ));
        let dispatcher = Arc::new(
            TaskDispatcher::new(
                applier.clone(),
                tracker,
                dlq_store.clone(),
                config.retry.clone(),
                config.dispatcher.dedupe_capacity,
            )
            .with_run_capacity(config.dispatcher.run_capacity),
        );
        let dlq = Arc::new(DlqManager::new(
            dlq_store.clone(),
            dispatcher.clone(),
            config.dlq.clone(),
        ));
        let cursors = Arc::new(MemoryCursorStore::new());
        let engine = Arc::new(ReplicationEngine::new(
            config.clone(),
            dispatcher,
            cursors.clone(),
        ));
        Self {
            config,
            task_log,
            domain_log,
            source,
            applier,
            dlq_store,
            cursors,
            dlq,
            engine,
        }
    }

    /// Name of this cluster.
    pub fn cluster_name(&self) -> &str {
        &self.config.cluster.local_cluster_name
    }

    /// The dispatcher shared by the engine and the DLQ manager.
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        self.engine.dispatcher()
    }

    /// Pull replication tasks from `other`.
    pub async fn connect_to(&self, other: &ReplicationNode) {
        let client = Arc::new(LocalReplicationClient::new(other.source.clone()));
        self.engine.add_source(client.clone()).await;
        self.dlq.add_source(client).await;
        info!(
            cluster = %self.cluster_name(),
            source_cluster = %other.cluster_name(),
            "connected replication source"
        );
    }

    /// Current counters across the dispatcher, DLQ and every stream.
    pub async fn metrics(&self) -> ReplMetrics {
        let mut metrics = ReplMetrics::new(self.cluster_name());
        metrics.update_from_dispatch(&self.dispatcher().stats());
        metrics.update_from_dlq(&self.dlq.stats());
        metrics.update_from_streams(&self.engine.stream_status().await);
        metrics.pending_failovers = self.dispatcher().tracker().pending_domains().await.len() as u64;
        metrics.engine_running = if self.engine.state().await == EngineState::Running {
            1.0
        } else {
            0.0
        };
        metrics
    }
}
