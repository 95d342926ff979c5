//! Destination-side cursor persistence.
//!
//! A cursor records, per (source cluster, stream), how far this cluster has
//! durably applied the source's task stream. It is written only after every
//! task of a page has been applied or parked in the DLQ, so after a restart
//! we resume from the last confirmed position and at worst re-apply a page.

use crate::error::{ReplError, Result};
use crate::messages::ReplicationToken;
use crate::types::ShardId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

/// Which source stream a cursor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicationStream {
    /// Per-shard history/activity/marker stream.
    Shard(ShardId),
    /// The single global domain stream.
    Domain,
}

impl fmt::Display for ReplicationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStream::Shard(id) => write!(f, "shard-{}", id),
            ReplicationStream::Domain => write!(f, "domain"),
        }
    }
}

/// Position of one stream from one source cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    /// Cluster we pull from.
    pub source_cluster: String,
    /// Stream being pulled.
    pub stream: ReplicationStream,
    /// Highest message id retrieved.
    pub last_retrieved_message_id: i64,
    /// Highest message id durably applied or parked.
    pub last_processed_message_id: i64,
}

impl StreamCursor {
    /// A cursor at the very beginning of a stream.
    pub fn initial(source_cluster: impl Into<String>, stream: ReplicationStream) -> Self {
        Self {
            source_cluster: source_cluster.into(),
            stream,
            last_retrieved_message_id: 0,
            last_processed_message_id: 0,
        }
    }

    /// Token to send to the source for a shard stream.
    pub fn token(&self) -> Option<ReplicationToken> {
        match self.stream {
            ReplicationStream::Shard(shard_id) => Some(ReplicationToken::new(
                shard_id,
                self.last_retrieved_message_id,
                self.last_processed_message_id,
            )),
            ReplicationStream::Domain => None,
        }
    }
}

/// A record written each time a cursor advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    /// The cursor after this advance.
    pub cursor: StreamCursor,
    /// When the advance was confirmed (nanoseconds since epoch).
    pub persisted_at: i64,
    /// How many message ids this advance covers.
    pub advanced_by: i64,
}

/// Point-in-time copy of every cursor, for persistence and restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    /// When the snapshot was taken (nanoseconds since epoch).
    pub taken_at: i64,
    /// The cursors, sorted by cluster then stream.
    pub cursors: Vec<StreamCursor>,
}

impl CursorSnapshot {
    /// Serialize to bincode bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Durable storage for stream cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load a cursor; unknown streams start at zero.
    async fn load(&self, source_cluster: &str, stream: ReplicationStream) -> Result<StreamCursor>;

    /// Persist a cursor. A cursor never moves backwards through `save`.
    async fn save(&self, cursor: &StreamCursor, persisted_at: i64) -> Result<()>;
}

/// In-memory cursor store with an advance history.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    inner: Mutex<CursorTable>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct CursorTable {
    cursors: HashMap<(String, ReplicationStream), StreamCursor>,
    history: Vec<CursorRecord>,
}

impl MemoryCursorStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Get all cursors (snapshot of current state), sorted by cluster then stream.
    pub async fn all_cursors(&self) -> Vec<StreamCursor> {
        let table = self.inner.lock().await;
        let mut cursors: Vec<_> = table.cursors.values().cloned().collect();
        cursors.sort_by(|a, b| (&a.source_cluster, a.stream).cmp(&(&b.source_cluster, b.stream)));
        cursors
    }

    /// Advance history, most recent last.
    pub async fn history(&self) -> Vec<CursorRecord> {
        self.inner.lock().await.history.clone()
    }

    /// Reset a cursor (used when a source cluster is removed or re-bootstrapped).
    pub async fn reset(&self, source_cluster: &str, stream: ReplicationStream) {
        let mut table = self.inner.lock().await;
        table.cursors.remove(&(source_cluster.to_string(), stream));
    }

    /// Capture every cursor.
    pub async fn snapshot(&self, taken_at: i64) -> CursorSnapshot {
        CursorSnapshot {
            taken_at,
            cursors: self.all_cursors().await,
        }
    }

    /// Replace every cursor with the contents of a snapshot. History is cleared.
    pub async fn restore(&self, snapshot: &CursorSnapshot) {
        let mut table = self.inner.lock().await;
        table.cursors = snapshot
            .cursors
            .iter()
            .map(|c| ((c.source_cluster.clone(), c.stream), c.clone()))
            .collect();
        table.history.clear();
    }

    /// Drop history persisted before `before`, keeping the latest record per cursor.
    pub async fn compact(&self, before: i64) {
        let mut table = self.inner.lock().await;
        let mut latest: HashMap<(String, ReplicationStream), usize> = HashMap::new();
        for (i, record) in table.history.iter().enumerate() {
            latest.insert(
                (record.cursor.source_cluster.clone(), record.cursor.stream),
                i,
            );
        }
        let history = std::mem::take(&mut table.history);
        table.history = history
            .into_iter()
            .enumerate()
            .filter(|(i, record)| {
                record.persisted_at >= before
                    || latest.get(&(record.cursor.source_cluster.clone(), record.cursor.stream))
                        == Some(i)
            })
            .map(|(_, record)| record)
            .collect();
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source_cluster: &str, stream: ReplicationStream) -> Result<StreamCursor> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReplError::StorageUnavailable {
                msg: "cursor store unavailable".to_string(),
            });
        }
        let table = self.inner.lock().await;
        Ok(table
            .cursors
            .get(&(source_cluster.to_string(), stream))
            .cloned()
            .unwrap_or_else(|| StreamCursor::initial(source_cluster, stream)))
    }

    async fn save(&self, cursor: &StreamCursor, persisted_at: i64) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReplError::StorageUnavailable {
                msg: "cursor store unavailable".to_string(),
            });
        }
        if cursor.last_processed_message_id > cursor.last_retrieved_message_id {
            return Err(ReplError::BadRequest {
                msg: format!(
                    "{} cursor processed {} beyond retrieved {}",
                    cursor.stream, cursor.last_processed_message_id, cursor.last_retrieved_message_id
                ),
            });
        }
        let mut table = self.inner.lock().await;
        let key = (cursor.source_cluster.clone(), cursor.stream);
        let previous = table
            .cursors
            .get(&key)
            .map(|c| c.last_processed_message_id)
            .unwrap_or(0);
        if cursor.last_processed_message_id < previous {
            warn!(
                source_cluster = %cursor.source_cluster,
                stream = %cursor.stream,
                previous,
                attempted = cursor.last_processed_message_id,
                "ignoring cursor regression"
            );
            return Ok(());
        }
        table.cursors.insert(key, cursor.clone());
        table.history.push(CursorRecord {
            cursor: cursor.clone(),
            persisted_at,
            advanced_by: cursor.last_processed_message_id - previous,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(cluster: &str, shard: i32, id: i64) -> StreamCursor {
        StreamCursor {
            source_cluster: cluster.to_string(),
            stream: ReplicationStream::Shard(ShardId::new(shard)),
            last_retrieved_message_id: id,
            last_processed_message_id: id,
        }
    }

    #[tokio::test]
    async fn test_unknown_cursor_starts_at_zero() {
        let store = MemoryCursorStore::new();
        let c = store.load("east", ReplicationStream::Domain).await.unwrap();
        assert_eq!(c.last_retrieved_message_id, 0);
        assert_eq!(c.last_processed_message_id, 0);
        assert!(c.token().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 3, 40), 1000).await.unwrap();
        let c = store
            .load("east", ReplicationStream::Shard(ShardId::new(3)))
            .await
            .unwrap();
        assert_eq!(c.last_processed_message_id, 40);
        let token = c.token().unwrap();
        assert_eq!(token.shard_id, ShardId::new(3));
        assert_eq!(token.last_retrieved_message_id, 40);
    }

    #[tokio::test]
    async fn test_clusters_are_independent() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 1, 10), 1).await.unwrap();
        store.save(&cursor("west", 1, 20), 2).await.unwrap();
        let all = store.all_cursors().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source_cluster, "east");
        assert_eq!(all[1].last_processed_message_id, 20);
    }

    #[tokio::test]
    async fn test_regression_is_ignored() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 1, 50), 1).await.unwrap();
        store.save(&cursor("east", 1, 30), 2).await.unwrap();
        let c = store
            .load("east", ReplicationStream::Shard(ShardId::new(1)))
            .await
            .unwrap();
        assert_eq!(c.last_processed_message_id, 50);
        assert_eq!(store.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_processed_beyond_retrieved_is_rejected() {
        let store = MemoryCursorStore::new();
        let mut c = cursor("east", 1, 5);
        c.last_processed_message_id = 9;
        assert!(store.save(&c, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 1, 50), 1).await.unwrap();
        store
            .reset("east", ReplicationStream::Shard(ShardId::new(1)))
            .await;
        let c = store
            .load("east", ReplicationStream::Shard(ShardId::new(1)))
            .await
            .unwrap();
        assert_eq!(c.last_processed_message_id, 0);
    }

    #[tokio::test]
    async fn test_history_advanced_by() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 0, 10), 1).await.unwrap();
        store.save(&cursor("east", 0, 25), 2).await.unwrap();
        let history = store.history().await;
        assert_eq!(history[0].advanced_by, 10);
        assert_eq!(history[1].advanced_by, 15);
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_per_cursor() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 0, 10), 1000).await.unwrap();
        store.save(&cursor("east", 1, 15), 1500).await.unwrap();
        store.save(&cursor("east", 0, 20), 2000).await.unwrap();
        store.save(&cursor("east", 1, 25), 2500).await.unwrap();

        store.compact(3000).await;

        let history = store.history().await;
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .any(|r| r.cursor.stream == ReplicationStream::Shard(ShardId::new(0))
                && r.cursor.last_processed_message_id == 20));
        assert!(history
            .iter()
            .any(|r| r.cursor.stream == ReplicationStream::Shard(ShardId::new(1))
                && r.cursor.last_processed_message_id == 25));
    }

    #[tokio::test]
    async fn test_compaction_keeps_recent() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 0, 10), 1000).await.unwrap();
        store.save(&cursor("east", 0, 20), 2000).await.unwrap();
        store.save(&cursor("east", 0, 30), 3000).await.unwrap();

        store.compact(2500).await;

        let history = store.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cursor.last_processed_message_id, 30);
    }

    #[tokio::test]
    async fn test_snapshot_restore_through_bytes() {
        let store = MemoryCursorStore::new();
        store.save(&cursor("east", 0, 10), 1).await.unwrap();
        store.save(&cursor("west", 2, 7), 2).await.unwrap();
        let bytes = store.snapshot(99).await.to_bytes().unwrap();

        let restored = MemoryCursorStore::new();
        restored
            .restore(&CursorSnapshot::from_bytes(&bytes).unwrap())
            .await;
        assert_eq!(restored.all_cursors().await, store.all_cursors().await);
        assert!(restored.history().await.is_empty());
    }

    #[test]
    fn test_snapshot_from_garbage_fails() {
        assert!(CursorSnapshot::from_bytes(&[0xff]).is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryCursorStore::new();
        store.set_unavailable(true);
        assert!(store
            .load("east", ReplicationStream::Domain)
            .await
            .unwrap_err()
            .is_retryable());
    }
}
