//! Destination-side task dispatch.
//!
//! Routes each replicated task to its handler, enforces per-run version
//! ordering, suppresses redelivered tasks, retries transient failures and
//! parks tasks that cannot be applied in the DLQ.
//!
//! Version check, apply and version record of one run happen under that
//! run's lock, so a DLQ merge replaying an old task cannot interleave with the
//! live loop applying a newer one.

use crate::applier::TaskApplier;
use crate::config::DispatcherConfig;
use crate::dlq_store::{DlqEntry, DlqStore};
use crate::enums::{DlqType, ReplicationTaskType};
use crate::error::{ReplError, Result};
use crate::failover_marker::{FailoverMarkerTracker, MarkerStatus};
use crate::messages::DlqKey;
use crate::retry::RetryPolicy;
use crate::task::{ReplicationTask, TaskIdentity, TaskPayload};
use crate::types::{now_nanos, RunKey, ShardId};
use lru::LruCache;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Per-call dispatch flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Apply even if the run already recorded a higher version.
    pub reconcile_overwrite: bool,
}

/// What happened to a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Written to local state.
    Applied,
    /// Already applied recently; nothing done.
    Duplicate,
    /// The run already holds a higher version; dropped.
    VersionStale {
        /// Highest version recorded for the run.
        recorded: i64,
        /// Version carried by the task.
        incoming: i64,
    },
    /// Failover marker handed to the tracker.
    MarkerRecorded(MarkerStatus),
    /// Shard heartbeat handed to the tracker.
    ShardStatusObserved,
    /// Could not be applied; parked in the DLQ.
    DeadLettered {
        /// Why.
        reason: String,
    },
    /// Could not be applied; left where it was (re-application from the DLQ).
    Failed {
        /// Why.
        reason: String,
    },
}

impl DispatchOutcome {
    /// True if the task needs no further attention.
    pub fn is_resolved(&self) -> bool {
        !matches!(
            self,
            DispatchOutcome::DeadLettered { .. } | DispatchOutcome::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    DeadLetter,
    Report,
}

/// Task ids are only unique within one source shard.
type DedupeKey = (String, ShardId, TaskIdentity);

/// Bounded FIFO set of recently applied tasks.
#[derive(Debug)]
struct DedupeWindow {
    capacity: usize,
    order: VecDeque<DedupeKey>,
    members: HashSet<DedupeKey>,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            members: HashSet::new(),
        }
    }

    fn contains(&self, id: &DedupeKey) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: DedupeKey) {
        if self.capacity == 0 || !self.members.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }
}

/// Highest version applied to a run, behind the lock that serializes the run.
type RunGate = Arc<Mutex<Option<i64>>>;

/// Runs with a recorded version, least recently used first out.
///
/// A gate still held by an in-flight dispatch is never evicted, so two
/// deliveries for one run always share a lock.
struct RunTable {
    capacity: usize,
    runs: LruCache<RunKey, RunGate>,
}

impl RunTable {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: LruCache::unbounded(),
        }
    }

    fn gate(&mut self, run: &RunKey) -> RunGate {
        if let Some(gate) = self.runs.get(run) {
            return gate.clone();
        }
        let gate = RunGate::default();
        self.runs.put(run.clone(), gate.clone());
        self.evict_idle();
        gate
    }

    fn evict_idle(&mut self) {
        while self.runs.len() > self.capacity {
            let idle = self
                .runs
                .peek_lru()
                .map(|(_, gate)| Arc::strong_count(gate) == 1)
                .unwrap_or(false);
            if !idle {
                break;
            }
            if let Some((run, _)) = self.runs.pop_lru() {
                debug!(run = %run, "forgetting run version");
            }
        }
    }
}

#[derive(Debug, Default)]
struct DispatchStatsInner {
    applied: AtomicU64,
    duplicates: AtomicU64,
    version_stale: AtomicU64,
    markers_recorded: AtomicU64,
    shard_status_observed: AtomicU64,
    dead_lettered: AtomicU64,
    reapply_failures: AtomicU64,
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Tasks written to local state.
    pub applied: u64,
    /// Redeliveries suppressed.
    pub duplicates: u64,
    /// Tasks dropped for carrying an older version.
    pub version_stale: u64,
    /// Failover markers recorded.
    pub markers_recorded: u64,
    /// Shard heartbeats observed.
    pub shard_status_observed: u64,
    /// Tasks parked in the DLQ.
    pub dead_lettered: u64,
    /// DLQ re-applications that failed again.
    pub reapply_failures: u64,
}

/// Applies replicated tasks.
pub struct TaskDispatcher {
    applier: Arc<dyn TaskApplier>,
    tracker: Arc<FailoverMarkerTracker>,
    dlq: Arc<dyn DlqStore>,
    retry: RetryPolicy,
    runs: Mutex<RunTable>,
    dedupe: Mutex<DedupeWindow>,
    stats: DispatchStatsInner,
}

impl TaskDispatcher {
    /// Create a dispatcher.
    pub fn new(
        applier: Arc<dyn TaskApplier>,
        tracker: Arc<FailoverMarkerTracker>,
        dlq: Arc<dyn DlqStore>,
        retry: RetryPolicy,
        dedupe_capacity: usize,
    ) -> Self {
        Self {
            applier,
            tracker,
            dlq,
            retry,
            runs: Mutex::new(RunTable::new(DispatcherConfig::default().run_capacity)),
            dedupe: Mutex::new(DedupeWindow::new(dedupe_capacity)),
            stats: DispatchStatsInner::default(),
        }
    }

    /// Remember the versions of at most `capacity` runs.
    pub fn with_run_capacity(self, capacity: usize) -> Self {
        Self {
            runs: Mutex::new(RunTable::new(capacity)),
            ..self
        }
    }

    /// The failover marker tracker fed by this dispatcher.
    pub fn tracker(&self) -> &Arc<FailoverMarkerTracker> {
        &self.tracker
    }

    /// Apply one task received from `source_cluster` on `shard_id`.
    ///
    /// Tasks that cannot be applied are written to the DLQ and reported as
    /// [`DispatchOutcome::DeadLettered`]. An `Err` means the DLQ write itself
    /// failed and the task was neither applied nor parked.
    pub async fn dispatch(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        task: &ReplicationTask,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        self.dispatch_inner(shard_id, source_cluster, task, options, OnFailure::DeadLetter)
            .await
    }

    /// Re-apply a task taken from the DLQ. Failures are reported as
    /// [`DispatchOutcome::Failed`] and nothing is written to the DLQ.
    pub async fn reapply(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        task: &ReplicationTask,
        options: DispatchOptions,
    ) -> Result<DispatchOutcome> {
        self.dispatch_inner(shard_id, source_cluster, task, options, OnFailure::Report)
            .await
    }

    async fn dispatch_inner(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        task: &ReplicationTask,
        options: DispatchOptions,
        on_failure: OnFailure,
    ) -> Result<DispatchOutcome> {
        let info = task.task_info();
        let payload = match (task.validate().and_then(|()| info.validate()), &task.payload) {
            (Ok(()), Some(payload)) => payload,
            (Err(e), _) => return self.fail(shard_id, source_cluster, task, e, on_failure).await,
            (Ok(()), None) => {
                let e = ReplError::malformed(task.source_task_id, "missing payload");
                return self.fail(shard_id, source_cluster, task, e, on_failure).await;
            }
        };

        let identity = (source_cluster.to_string(), shard_id, info.identity());
        if self.dedupe.lock().await.contains(&identity) {
            debug!(task_id = task.source_task_id, shard_id = %shard_id, "duplicate task");
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::Duplicate);
        }

        let result = match payload {
            TaskPayload::FailoverMarker(marker) => {
                let status = self.tracker.record(source_cluster, shard_id, marker).await;
                self.stats.markers_recorded.fetch_add(1, Ordering::Relaxed);
                self.dedupe.lock().await.insert(identity);
                return Ok(DispatchOutcome::MarkerRecorded(status));
            }
            TaskPayload::SyncShardStatus(status) => {
                if let Some(ts) = status.timestamp {
                    self.tracker
                        .record_shard_status(source_cluster, shard_id, ts)
                        .await;
                }
                self.stats
                    .shard_status_observed
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(DispatchOutcome::ShardStatusObserved);
            }
            TaskPayload::Domain(attr) => {
                self.retry
                    .run("apply_domain", || self.applier.apply_domain(source_cluster, attr))
                    .await
            }
            TaskPayload::HistoryV2(attr) => {
                let run = RunKey::new(&attr.domain_id, &attr.workflow_id, &attr.run_id);
                let apply = || {
                    self.retry
                        .run("apply_history_v2", || self.applier.apply_history_v2(source_cluster, attr))
                };
                match self.apply_versioned(&run, attr.version(), options, apply).await {
                    Ok(Some(stale)) => return Ok(stale),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            TaskPayload::SyncActivity(attr) => {
                let run = RunKey::new(&attr.domain_id, &attr.workflow_id, &attr.run_id);
                let apply = || {
                    self.retry.run("apply_sync_activity", || {
                        self.applier.apply_sync_activity(source_cluster, attr)
                    })
                };
                match self.apply_versioned(&run, attr.version, options, apply).await {
                    Ok(Some(stale)) => return Ok(stale),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                self.dedupe.lock().await.insert(identity);
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                Ok(DispatchOutcome::Applied)
            }
            Err(e) => self.fail(shard_id, source_cluster, task, e, on_failure).await,
        }
    }

    /// Apply a versioned task while holding its run's lock. Returns the
    /// stale outcome instead of applying when the run already recorded a
    /// higher version and the caller did not ask for a reconciling overwrite.
    async fn apply_versioned<F, Fut>(
        &self,
        run: &RunKey,
        incoming: i64,
        options: DispatchOptions,
        apply: F,
    ) -> Result<Option<DispatchOutcome>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let gate = self.runs.lock().await.gate(run);
        let mut recorded = gate.lock().await;
        if let Some(current) = *recorded {
            if !options.reconcile_overwrite && incoming < current {
                warn!(run = %run, recorded = current, incoming, "dropping task with stale version");
                self.stats.version_stale.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(DispatchOutcome::VersionStale {
                    recorded: current,
                    incoming,
                }));
            }
        }
        apply().await?;
        *recorded = Some(match *recorded {
            Some(current) if !options.reconcile_overwrite => current.max(incoming),
            _ => incoming,
        });
        Ok(None)
    }

    /// Highest version applied for a run, if it is still remembered.
    pub async fn recorded_version(&self, run: &RunKey) -> Option<i64> {
        let gate = self.runs.lock().await.runs.peek(run).cloned()?;
        let version = *gate.lock().await;
        version
    }

    /// Number of runs whose version is remembered.
    pub async fn tracked_runs(&self) -> usize {
        self.runs.lock().await.runs.len()
    }

    async fn fail(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        task: &ReplicationTask,
        cause: ReplError,
        on_failure: OnFailure,
    ) -> Result<DispatchOutcome> {
        let reason = if cause.is_retryable() {
            format!("retries exhausted: {}", cause)
        } else {
            cause.to_string()
        };
        if on_failure == OnFailure::Report {
            debug!(task_id = task.source_task_id, reason = %reason, "re-application failed");
            self.stats.reapply_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(DispatchOutcome::Failed { reason });
        }

        let dlq_type = if task.task_type == ReplicationTaskType::Domain {
            DlqType::Domain
        } else {
            DlqType::Replication
        };
        let key = DlqKey::new(dlq_type, shard_id, source_cluster);
        let entry = DlqEntry::new(task.clone(), reason.clone(), now_nanos());
        if let Err(e) = self.dlq.put(&key, entry).await {
            error!(
                task_id = task.source_task_id,
                shard_id = %shard_id,
                source_cluster,
                error = %e,
                "failed to park task in DLQ"
            );
            return Err(e);
        }
        warn!(
            task_id = task.source_task_id,
            task_type = %task.task_type,
            shard_id = %shard_id,
            source_cluster,
            dlq_type = %dlq_type,
            reason = %reason,
            "task parked in DLQ"
        );
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(DispatchOutcome::DeadLettered { reason })
    }

    /// Snapshot of dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            applied: self.stats.applied.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            version_stale: self.stats.version_stale.load(Ordering::Relaxed),
            markers_recorded: self.stats.markers_recorded.load(Ordering::Relaxed),
            shard_status_observed: self.stats.shard_status_observed.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            reapply_failures: self.stats.reapply_failures.load(Ordering::Relaxed),
        }
    }
}
