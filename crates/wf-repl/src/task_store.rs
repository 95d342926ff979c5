//! Source-side replication task log.
//!
//! The durable log is an external collaborator. [`TaskLog`] is the seam the
//! source serves pages from; [`MemoryTaskLog`] backs tests and the loopback
//! binary.

use crate::error::{ReplError, Result};
use crate::task::{ReplicationTask, ReplicationTaskInfo};
use crate::types::ShardId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Shard used by the single, globally ordered domain stream.
pub const DOMAIN_STREAM_SHARD: ShardId = ShardId::new(0);

/// A slice of the task log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskRange {
    /// Tasks in ascending `source_task_id` order.
    pub tasks: Vec<ReplicationTask>,
    /// More tasks exist after the last returned one.
    pub has_more: bool,
}

/// Per-shard ordered log of replication tasks, indexed by `source_task_id`.
#[async_trait]
pub trait TaskLog: Send + Sync {
    /// Append a task. Re-appending an existing id replaces it.
    async fn append(&self, shard_id: ShardId, task: ReplicationTask) -> Result<()>;

    /// Read up to `limit` tasks with id strictly greater than `after_id`.
    async fn read_after(&self, shard_id: ShardId, after_id: i64, limit: usize) -> Result<TaskRange>;

    /// Find the task matching an identity key, searching every shard.
    async fn find(&self, info: &ReplicationTaskInfo) -> Result<Option<ReplicationTask>>;

    /// Drop every task with id <= `through_id`. Returns how many were removed.
    async fn trim_through(&self, shard_id: ShardId, through_id: i64) -> Result<usize>;

    /// Highest task id in a shard, or 0 when empty.
    async fn max_task_id(&self, shard_id: ShardId) -> Result<i64>;
}

/// In-memory task log. Thread-safe via tokio RwLock.
#[derive(Debug, Default)]
pub struct MemoryTaskLog {
    shards: RwLock<HashMap<ShardId, BTreeMap<i64, ReplicationTask>>>,
    unavailable: AtomicBool,
}

impl MemoryTaskLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReplError::StorageUnavailable {
                msg: "task log unavailable".to_string(),
            });
        }
        Ok(())
    }

    /// Number of tasks stored for a shard.
    pub async fn len(&self, shard_id: ShardId) -> usize {
        self.shards
            .read()
            .await
            .get(&shard_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskLog for MemoryTaskLog {
    async fn append(&self, shard_id: ShardId, task: ReplicationTask) -> Result<()> {
        self.check_available()?;
        let mut shards = self.shards.write().await;
        shards
            .entry(shard_id)
            .or_default()
            .insert(task.source_task_id, task);
        Ok(())
    }

    async fn read_after(&self, shard_id: ShardId, after_id: i64, limit: usize) -> Result<TaskRange> {
        self.check_available()?;
        let shards = self.shards.read().await;
        let Some(shard) = shards.get(&shard_id) else {
            return Ok(TaskRange::default());
        };
        let mut iter = shard
            .range((Bound::Excluded(after_id), Bound::Unbounded))
            .map(|(_, task)| task);
        let tasks: Vec<ReplicationTask> = iter.by_ref().take(limit).cloned().collect();
        let has_more = iter.next().is_some();
        Ok(TaskRange { tasks, has_more })
    }

    async fn find(&self, info: &ReplicationTaskInfo) -> Result<Option<ReplicationTask>> {
        self.check_available()?;
        let wanted = info.identity();
        let shards = self.shards.read().await;
        Ok(shards
            .values()
            .filter_map(|shard| shard.get(&info.task_id))
            .find(|task| task.task_info().identity() == wanted)
            .cloned())
    }

    async fn trim_through(&self, shard_id: ShardId, through_id: i64) -> Result<usize> {
        self.check_available()?;
        let mut shards = self.shards.write().await;
        let Some(shard) = shards.get_mut(&shard_id) else {
            return Ok(0);
        };
        let keep = match through_id.checked_add(1) {
            Some(first_kept) => shard.split_off(&first_kept),
            None => BTreeMap::new(),
        };
        let removed = shard.len();
        *shard = keep;
        Ok(removed)
    }

    async fn max_task_id(&self, shard_id: ShardId) -> Result<i64> {
        self.check_available()?;
        let shards = self.shards.read().await;
        Ok(shards
            .get(&shard_id)
            .and_then(|s| s.keys().next_back().copied())
            .unwrap_or(0))
    }
}
