//! Pulling-side view of a remote source cluster.
//!
//! The RPC transport is an external collaborator. [`ReplicationClient`] is the
//! seam the processor and DLQ manager call through; [`LocalReplicationClient`]
//! wires a destination directly to an in-process [`ReplicationSource`], passing
//! every response through bincode so it sees what a remote peer would send.

use crate::error::{ReplError, Result};
use crate::messages::{
    GetDlqReplicationMessagesRequest, GetDlqReplicationMessagesResponse,
    GetDomainReplicationMessagesRequest, GetDomainReplicationMessagesResponse,
    GetReplicationMessagesRequest, GetReplicationMessagesResponse,
};
use crate::source::ReplicationSource;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Calls a source cluster's replication endpoints.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Name of the cluster on the other end.
    fn source_cluster(&self) -> &str;

    /// Fetch per-shard pages.
    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> Result<GetReplicationMessagesResponse>;

    /// Fetch a page of the domain stream.
    async fn get_domain_replication_messages(
        &self,
        request: GetDomainReplicationMessagesRequest,
    ) -> Result<GetDomainReplicationMessagesResponse>;

    /// Resolve DLQ identity keys to tasks.
    async fn get_dlq_replication_messages(
        &self,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<GetDlqReplicationMessagesResponse>;
}

#[derive(Debug, Default)]
struct ClientStatsInner {
    requests: AtomicU64,
    tasks_received: AtomicU64,
    errors: AtomicU64,
    bytes_received: AtomicU64,
}

/// Counters for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Requests issued.
    pub requests: u64,
    /// Tasks received across all responses.
    pub tasks_received: u64,
    /// Requests that failed.
    pub errors: u64,
    /// Encoded response bytes received.
    pub bytes_received: u64,
}

/// In-process client bound to a [`ReplicationSource`].
pub struct LocalReplicationClient {
    source: Arc<ReplicationSource>,
    disconnected: AtomicBool,
    stats: ClientStatsInner,
}

impl LocalReplicationClient {
    /// Connect to a source.
    pub fn new(source: Arc<ReplicationSource>) -> Self {
        Self {
            source,
            disconnected: AtomicBool::new(false),
            stats: ClientStatsInner::default(),
        }
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Snapshot of the client counters.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            requests: self.stats.requests.load(Ordering::Relaxed),
            tasks_received: self.stats.tasks_received.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn begin(&self) -> Result<()> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if self.disconnected.load(Ordering::SeqCst) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(ReplError::NetworkError {
                msg: format!("{} unreachable", self.source.cluster_name()),
            });
        }
        Ok(())
    }

    fn finish<T: Serialize + DeserializeOwned>(&self, result: Result<T>, tasks: u64) -> Result<T> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let bytes = bincode::serialize(&response)?;
        self.stats
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.stats.tasks_received.fetch_add(tasks, Ordering::Relaxed);
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait]
impl ReplicationClient for LocalReplicationClient {
    fn source_cluster(&self) -> &str {
        self.source.cluster_name()
    }

    async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> Result<GetReplicationMessagesResponse> {
        self.begin()?;
        let result = self.source.get_replication_messages(request).await;
        let tasks = result.as_ref().map_or(0, |r| {
            r.messages_by_shard
                .values()
                .map(|m| m.replication_tasks.len() as u64)
                .sum()
        });
        self.finish(result, tasks)
    }

    async fn get_domain_replication_messages(
        &self,
        request: GetDomainReplicationMessagesRequest,
    ) -> Result<GetDomainReplicationMessagesResponse> {
        self.begin()?;
        let result = self.source.get_domain_replication_messages(request).await;
        let tasks = result
            .as_ref()
            .map_or(0, |r| r.messages.replication_tasks.len() as u64);
        self.finish(result, tasks)
    }

    async fn get_dlq_replication_messages(
        &self,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<GetDlqReplicationMessagesResponse> {
        self.begin()?;
        let result = self.source.get_dlq_replication_messages(request).await;
        let tasks = result
            .as_ref()
            .map_or(0, |r| r.replication_tasks.len() as u64);
        self.finish(result, tasks)
    }
}
