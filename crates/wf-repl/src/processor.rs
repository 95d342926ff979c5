//! Pulling side of the replication cursor protocol.
//!
//! One [`ReplicationProcessor`] runs per (source cluster, stream). Each round
//! loads the persisted cursor, fetches the next page, dispatches every task in
//! order and only then persists the advanced cursor. A failure or cancellation
//! anywhere in the round leaves the cursor where it was, so the page is
//! fetched and applied again on the next round; redelivered tasks are
//! suppressed by the dispatcher.

use crate::client::ReplicationClient;
use crate::config::ProcessorConfig;
use crate::cursor::{CursorStore, ReplicationStream, StreamCursor};
use crate::dispatcher::{DispatchOptions, DispatchOutcome, TaskDispatcher};
use crate::error::{ReplError, Result};
use crate::messages::{
    GetDomainReplicationMessagesRequest, GetReplicationMessagesRequest, ReplicationMessages,
};
use crate::task_store::DOMAIN_STREAM_SHARD;
use crate::types::{now_nanos, ShardId};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a processor is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Between rounds.
    Idle,
    /// Waiting for a page from the source.
    Fetching,
    /// Dispatching the tasks of a page.
    Applying,
}

impl ProcessorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProcessorState::Fetching,
            2 => ProcessorState::Applying,
            _ => ProcessorState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ProcessorState::Idle => 0,
            ProcessorState::Fetching => 1,
            ProcessorState::Applying => 2,
        }
    }
}

/// Result of one fetch/apply round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Tasks in the page.
    pub tasks: usize,
    /// Tasks that ended up in the DLQ.
    pub dead_lettered: usize,
    /// Source reported more tasks after this page.
    pub has_more: bool,
    /// Cursor position after the round.
    pub last_processed_message_id: i64,
}

#[derive(Debug, Default)]
struct ProcessorStatsInner {
    rounds: AtomicU64,
    tasks_processed: AtomicU64,
    fetch_errors: AtomicU64,
    apply_errors: AtomicU64,
    cursor_saves: AtomicU64,
    last_processed: AtomicI64,
}

/// Counters for one processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Completed rounds.
    pub rounds: u64,
    /// Tasks dispatched in completed rounds.
    pub tasks_processed: u64,
    /// Failed or timed out fetches.
    pub fetch_errors: u64,
    /// Rounds aborted while applying.
    pub apply_errors: u64,
    /// Cursor writes.
    pub cursor_saves: u64,
    /// Last persisted position.
    pub last_processed_message_id: i64,
}

/// Fetch/apply loop for one stream of one source cluster.
pub struct ReplicationProcessor {
    local_cluster: String,
    stream: ReplicationStream,
    client: Arc<dyn ReplicationClient>,
    dispatcher: Arc<TaskDispatcher>,
    cursors: Arc<dyn CursorStore>,
    config: ProcessorConfig,
    state: AtomicU8,
    stats: ProcessorStatsInner,
}

impl ReplicationProcessor {
    /// Create a processor.
    pub fn new(
        local_cluster: impl Into<String>,
        stream: ReplicationStream,
        client: Arc<dyn ReplicationClient>,
        dispatcher: Arc<TaskDispatcher>,
        cursors: Arc<dyn CursorStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            local_cluster: local_cluster.into(),
            stream,
            client,
            dispatcher,
            cursors,
            config,
            state: AtomicU8::new(ProcessorState::Idle.as_u8()),
            stats: ProcessorStatsInner::default(),
        }
    }

    /// Cluster being pulled from.
    pub fn source_cluster(&self) -> &str {
        self.client.source_cluster()
    }

    /// Stream being pulled.
    pub fn stream(&self) -> ReplicationStream {
        self.stream
    }

    /// Current state.
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn dlq_shard(&self) -> ShardId {
        match self.stream {
            ReplicationStream::Shard(shard_id) => shard_id,
            ReplicationStream::Domain => DOMAIN_STREAM_SHARD,
        }
    }

    /// Run a single fetch/apply round.
    pub async fn process_once(&self, cancel: &CancellationToken) -> Result<RoundReport> {
        let result = self.round(cancel).await;
        self.set_state(ProcessorState::Idle);
        result
    }

    async fn round(&self, cancel: &CancellationToken) -> Result<RoundReport> {
        let cursor = self
            .cursors
            .load(self.source_cluster(), self.stream)
            .await?;

        self.set_state(ProcessorState::Fetching);
        let page = match self
            .cancellable(cancel, self.config.fetch_timeout_ms, self.fetch(&cursor))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                if !matches!(e, ReplError::Cancelled) {
                    self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        self.set_state(ProcessorState::Applying);
        let mut report = RoundReport {
            tasks: page.replication_tasks.len(),
            has_more: page.has_more,
            ..Default::default()
        };
        for task in &page.replication_tasks {
            if cancel.is_cancelled() {
                return Err(ReplError::Cancelled);
            }
            let dispatch = self.dispatcher.dispatch(
                self.dlq_shard(),
                self.source_cluster(),
                task,
                DispatchOptions::default(),
            );
            match self
                .cancellable(cancel, self.config.apply_timeout_ms, dispatch)
                .await
            {
                Ok(DispatchOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                Ok(_) => {}
                Err(ReplError::Cancelled) => return Err(ReplError::Cancelled),
                Err(e) => {
                    self.stats.apply_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        source_cluster = %self.source_cluster(),
                        stream = %self.stream,
                        task_id = task.source_task_id,
                        error = %e,
                        "aborting round, cursor not advanced"
                    );
                    return Err(e);
                }
            }
        }

        if let (ReplicationStream::Shard(shard_id), false, Some(status)) =
            (self.stream, page.has_more, page.sync_shard_status)
        {
            if let Some(ts) = status.timestamp {
                self.dispatcher
                    .tracker()
                    .record_shard_status(self.source_cluster(), shard_id, ts)
                    .await;
            }
        }

        let advanced = StreamCursor {
            last_retrieved_message_id: page.last_retrieved_message_id,
            last_processed_message_id: page.last_retrieved_message_id,
            ..cursor.clone()
        };
        if advanced != cursor {
            self.cursors.save(&advanced, now_nanos()).await?;
            self.stats.cursor_saves.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .last_processed
            .store(advanced.last_processed_message_id, Ordering::Relaxed);
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tasks_processed
            .fetch_add(report.tasks as u64, Ordering::Relaxed);
        report.last_processed_message_id = advanced.last_processed_message_id;
        if report.tasks > 0 {
            debug!(
                source_cluster = %self.source_cluster(),
                stream = %self.stream,
                tasks = report.tasks,
                dead_lettered = report.dead_lettered,
                last_processed = report.last_processed_message_id,
                "round complete"
            );
        }
        Ok(report)
    }

    /// Drive `fut` until it finishes, `cancel` fires or `timeout_ms` passes.
    /// A dropped dispatch leaves the cursor behind the task, so it is
    /// replayed on the next round.
    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        timeout_ms: u64,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ReplError::Cancelled),
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ReplError::Timeout { timeout_ms }),
            },
        }
    }

    async fn fetch(&self, cursor: &StreamCursor) -> Result<ReplicationMessages> {
        match self.stream {
            ReplicationStream::Shard(shard_id) => {
                let request = GetReplicationMessagesRequest {
                    tokens: cursor.token().into_iter().collect(),
                    cluster_name: self.local_cluster.clone(),
                };
                let mut response = self.client.get_replication_messages(request).await?;
                response
                    .messages_by_shard
                    .remove(&shard_id)
                    .ok_or_else(|| ReplError::BadRequest {
                        msg: format!("source rejected cursor for shard {}", shard_id),
                    })
            }
            ReplicationStream::Domain => {
                let request = GetDomainReplicationMessagesRequest {
                    last_retrieved_message_id: Some(cursor.last_retrieved_message_id),
                    last_processed_message_id: Some(cursor.last_processed_message_id),
                    cluster_name: self.local_cluster.clone(),
                };
                Ok(self
                    .client
                    .get_domain_replication_messages(request)
                    .await?
                    .messages)
            }
        }
    }

    fn error_backoff(&self, consecutive_errors: u32) -> Duration {
        let shift = consecutive_errors.saturating_sub(1).min(16);
        let ms = self
            .config
            .poll_interval_ms
            .max(1)
            .saturating_mul(1u64 << shift)
            .min(self.config.max_error_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run rounds until `cancel` fires.
    ///
    /// Pages are pulled back to back while the source reports more; otherwise
    /// the loop waits for the poll interval. Failed rounds back off
    /// exponentially up to the configured ceiling.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            source_cluster = %self.source_cluster(),
            stream = %self.stream,
            "replication processor started"
        );
        let mut consecutive_errors = 0u32;
        loop {
            let wait = match self.process_once(&cancel).await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if report.has_more {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    self.config.poll_interval()
                }
                Err(ReplError::Cancelled) => break,
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self.error_backoff(consecutive_errors);
                    warn!(
                        source_cluster = %self.source_cluster(),
                        stream = %self.stream,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "replication round failed"
                    );
                    backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.set_state(ProcessorState::Idle);
        info!(
            source_cluster = %self.source_cluster(),
            stream = %self.stream,
            "replication processor stopped"
        );
    }

    /// Snapshot of processor counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            rounds: self.stats.rounds.load(Ordering::Relaxed),
            tasks_processed: self.stats.tasks_processed.load(Ordering::Relaxed),
            fetch_errors: self.stats.fetch_errors.load(Ordering::Relaxed),
            apply_errors: self.stats.apply_errors.load(Ordering::Relaxed),
            cursor_saves: self.stats.cursor_saves.load(Ordering::Relaxed),
            last_processed_message_id: self.stats.last_processed.load(Ordering::Relaxed),
        }
    }
}
