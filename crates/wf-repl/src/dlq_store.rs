//! Destination-side dead-letter storage.
//!
//! One ordered log per [`DlqKey`], indexed by message id (the source task id
//! of the parked task). The durable backend is an external collaborator.

use crate::error::{ReplError, Result};
use crate::messages::DlqKey;
use crate::task::{ReplicationTask, ReplicationTaskInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// A parked task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Position in the queue.
    pub message_id: i64,
    /// Identity key of the task.
    pub task_info: ReplicationTaskInfo,
    /// The task itself.
    pub task: ReplicationTask,
    /// Why it was parked.
    pub reason: String,
    /// When it was parked (nanoseconds).
    pub recorded_at: i64,
}

impl DlqEntry {
    /// Park a task under its own source task id.
    pub fn new(task: ReplicationTask, reason: impl Into<String>, recorded_at: i64) -> Self {
        Self {
            message_id: task.source_task_id,
            task_info: task.task_info(),
            task,
            reason: reason.into(),
            recorded_at,
        }
    }
}

/// A page of DLQ entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DlqRange {
    /// Entries in ascending message id order.
    pub entries: Vec<DlqEntry>,
    /// More matching entries exist after the last returned one.
    pub has_more: bool,
}

/// Storage for DLQ entries.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Write an entry; an existing entry with the same message id is replaced.
    async fn put(&self, key: &DlqKey, entry: DlqEntry) -> Result<()>;

    /// Read up to `limit` entries with `after < message_id <= inclusive_end`.
    async fn range(
        &self,
        key: &DlqKey,
        after: Option<i64>,
        inclusive_end: Option<i64>,
        limit: usize,
    ) -> Result<DlqRange>;

    /// Delete specific entries. Returns how many existed.
    async fn delete(&self, key: &DlqKey, message_ids: &[i64]) -> Result<usize>;

    /// Delete every entry with `message_id <= inclusive_end` (all if unbounded).
    async fn delete_through(&self, key: &DlqKey, inclusive_end: Option<i64>) -> Result<usize>;

    /// Entry counts of every non-empty queue.
    async fn count_all(&self) -> Result<Vec<(DlqKey, i64)>>;
}

/// In-memory DLQ store.
#[derive(Debug, Default)]
pub struct MemoryDlqStore {
    queues: RwLock<HashMap<DlqKey, BTreeMap<i64, DlqEntry>>>,
    unavailable: AtomicBool,
    count_scans: AtomicU64,
}

impl MemoryDlqStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many full count scans have been served.
    pub fn count_scans(&self) -> u64 {
        self.count_scans.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReplError::DlqStore {
                msg: "dlq store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn put(&self, key: &DlqKey, entry: DlqEntry) -> Result<()> {
        self.check_available()?;
        let mut queues = self.queues.write().await;
        queues
            .entry(key.clone())
            .or_default()
            .insert(entry.message_id, entry);
        Ok(())
    }

    async fn range(
        &self,
        key: &DlqKey,
        after: Option<i64>,
        inclusive_end: Option<i64>,
        limit: usize,
    ) -> Result<DlqRange> {
        self.check_available()?;
        let queues = self.queues.read().await;
        let Some(queue) = queues.get(key) else {
            return Ok(DlqRange::default());
        };
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let upper = inclusive_end.map_or(Bound::Unbounded, Bound::Included);
        if let (Some(a), Some(e)) = (after, inclusive_end) {
            if a >= e {
                return Ok(DlqRange::default());
            }
        }
        let mut iter = queue.range((lower, upper)).map(|(_, entry)| entry);
        let entries: Vec<DlqEntry> = iter.by_ref().take(limit).cloned().collect();
        let has_more = iter.next().is_some();
        Ok(DlqRange { entries, has_more })
    }

    async fn delete(&self, key: &DlqKey, message_ids: &[i64]) -> Result<usize> {
        self.check_available()?;
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(key) else {
            return Ok(0);
        };
        let removed = message_ids
            .iter()
            .filter(|id| queue.remove(id).is_some())
            .count();
        if queue.is_empty() {
            queues.remove(key);
        }
        Ok(removed)
    }

    async fn delete_through(&self, key: &DlqKey, inclusive_end: Option<i64>) -> Result<usize> {
        self.check_available()?;
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(key) else {
            return Ok(0);
        };
        let removed = match inclusive_end {
            None => {
                let n = queue.len();
                queue.clear();
                n
            }
            Some(end) => {
                let keep = match end.checked_add(1) {
                    Some(first_kept) => queue.split_off(&first_kept),
                    None => BTreeMap::new(),
                };
                let n = queue.len();
                *queue = keep;
                n
            }
        };
        if queue.is_empty() {
            queues.remove(key);
        }
        Ok(removed)
    }

    async fn count_all(&self) -> Result<Vec<(DlqKey, i64)>> {
        self.check_available()?;
        self.count_scans.fetch_add(1, Ordering::Relaxed);
        let queues = self.queues.read().await;
        let mut counts: Vec<(DlqKey, i64)> = queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, q)| (k.clone(), q.len() as i64))
            .collect();
        counts.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(counts)
    }
}
