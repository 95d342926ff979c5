//! Cursor tokens, message pages and the request/response shapes of the
//! replication and DLQ RPC surface.
//!
//! The transport that carries these is out of scope; they only need to be
//! serde-serializable.

use crate::enums::DlqType;
use crate::error::{ReplError, Result};
use crate::task::{ReplicationTask, ReplicationTaskInfo};
use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-shard pull cursor sent by a destination cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationToken {
    /// Shard the cursor belongs to.
    pub shard_id: ShardId,
    /// Highest message id handed to the destination.
    pub last_retrieved_message_id: i64,
    /// Highest message id durably applied (or DLQ'd) at the destination.
    pub last_processed_message_id: i64,
}

impl ReplicationToken {
    /// Create a new token.
    pub fn new(shard_id: ShardId, last_retrieved_message_id: i64, last_processed_message_id: i64) -> Self {
        Self {
            shard_id,
            last_retrieved_message_id,
            last_processed_message_id,
        }
    }

    /// Check `last_processed <= last_retrieved`.
    pub fn validate(&self) -> Result<()> {
        if self.last_processed_message_id > self.last_retrieved_message_id {
            return Err(ReplError::BadRequest {
                msg: format!(
                    "shard {}: last_processed {} > last_retrieved {}",
                    self.shard_id, self.last_processed_message_id, self.last_retrieved_message_id
                ),
            });
        }
        Ok(())
    }

    /// How far retrieval is ahead of processing.
    pub fn read_ahead(&self) -> i64 {
        self.last_retrieved_message_id
            .saturating_sub(self.last_processed_message_id)
    }
}

/// Source-side liveness heartbeat attached to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncShardStatus {
    /// Source clock (nanoseconds).
    pub timestamp: Option<i64>,
}

/// A page of tasks for one shard (or for the domain stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicationMessages {
    /// Tasks ordered by ascending `source_task_id`.
    pub replication_tasks: Vec<ReplicationTask>,
    /// Cursor to resume from.
    pub last_retrieved_message_id: i64,
    /// More tasks exist beyond this page.
    pub has_more: bool,
    /// Optional source heartbeat.
    pub sync_shard_status: Option<SyncShardStatus>,
}

impl ReplicationMessages {
    /// An empty page that leaves the cursor where it was.
    pub fn empty(last_retrieved_message_id: i64, has_more: bool) -> Self {
        Self {
            replication_tasks: Vec::new(),
            last_retrieved_message_id,
            has_more,
            sync_shard_status: None,
        }
    }

    /// Returns true if tasks are in non-decreasing `source_task_id` order.
    pub fn is_ordered(&self) -> bool {
        self.replication_tasks
            .windows(2)
            .all(|w| w[0].source_task_id <= w[1].source_task_id)
    }
}

/// Request for per-shard pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetReplicationMessagesRequest {
    /// One token per shard the caller wants to advance.
    pub tokens: Vec<ReplicationToken>,
    /// Calling (destination) cluster.
    pub cluster_name: String,
}

/// Per-shard pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetReplicationMessagesResponse {
    /// Page for each shard that was served.
    pub messages_by_shard: HashMap<ShardId, ReplicationMessages>,
}

/// Request for the single global domain stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetDomainReplicationMessagesRequest {
    /// Highest domain message id already retrieved, if any.
    pub last_retrieved_message_id: Option<i64>,
    /// Highest domain message id already processed, if any.
    pub last_processed_message_id: Option<i64>,
    /// Calling (destination) cluster.
    pub cluster_name: String,
}

/// Page of the domain stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetDomainReplicationMessagesResponse {
    /// The page.
    pub messages: ReplicationMessages,
}

/// Resolve DLQ identity keys back to full tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetDlqReplicationMessagesRequest {
    /// Keys to resolve.
    pub task_infos: Vec<ReplicationTaskInfo>,
}

/// Tasks resolved from identity keys; unknown keys are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetDlqReplicationMessagesResponse {
    /// Resolved tasks.
    pub replication_tasks: Vec<ReplicationTask>,
}

/// Opaque pagination cursor. Callers pass it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(Vec<u8>);

impl PageToken {
    /// Wrap raw token bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        PageToken(bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn encode_position(last_message_id: i64) -> Result<Self> {
        Ok(PageToken(bincode::serialize(&last_message_id)?))
    }

    pub(crate) fn decode_position(&self) -> Result<i64> {
        bincode::deserialize(&self.0).map_err(|e| ReplError::BadRequest {
            msg: format!("invalid page token: {}", e),
        })
    }
}

/// Address of one DLQ: queue type, shard and source cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DlqKey {
    /// Queue type.
    pub dlq_type: DlqType,
    /// Shard the entries came from.
    pub shard_id: ShardId,
    /// Cluster the entries were replicated from.
    pub source_cluster: String,
}

impl DlqKey {
    /// Create a new key.
    pub fn new(dlq_type: DlqType, shard_id: ShardId, source_cluster: impl Into<String>) -> Self {
        Self {
            dlq_type,
            shard_id,
            source_cluster: source_cluster.into(),
        }
    }
}

/// Read a page of DLQ entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDlqMessagesRequest {
    /// Queue type.
    pub dlq_type: DlqType,
    /// Shard.
    pub shard_id: ShardId,
    /// Source cluster.
    pub source_cluster: String,
    /// Only entries with message id <= this bound, if set.
    pub inclusive_end_message_id: Option<i64>,
    /// Page size; `<= 0` means the configured default.
    pub maximum_page_size: i32,
    /// Token from the previous page.
    pub next_page_token: Option<PageToken>,
}

impl ReadDlqMessagesRequest {
    /// First-page request for a queue.
    pub fn new(dlq_type: DlqType, shard_id: ShardId, source_cluster: impl Into<String>) -> Self {
        Self {
            dlq_type,
            shard_id,
            source_cluster: source_cluster.into(),
            inclusive_end_message_id: None,
            maximum_page_size: 0,
            next_page_token: None,
        }
    }

    /// The queue this request addresses.
    pub fn key(&self) -> DlqKey {
        DlqKey::new(self.dlq_type, self.shard_id, self.source_cluster.clone())
    }
}

/// Page of DLQ entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadDlqMessagesResponse {
    /// Queue type that was read.
    pub dlq_type: DlqType,
    /// Parked tasks.
    pub replication_tasks: Vec<ReplicationTask>,
    /// Identity keys of the parked tasks, index-aligned with `replication_tasks`.
    pub replication_tasks_info: Vec<ReplicationTaskInfo>,
    /// Absent exactly on the final page.
    pub next_page_token: Option<PageToken>,
}

/// Merge a page of DLQ entries back into the live stream.
pub type MergeDlqMessagesRequest = ReadDlqMessagesRequest;

/// Result of a merge page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergeDlqMessagesResponse {
    /// Absent exactly on the final page.
    pub next_page_token: Option<PageToken>,
}

/// Delete DLQ entries without re-applying them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeDlqMessagesRequest {
    /// Queue type.
    pub dlq_type: DlqType,
    /// Shard.
    pub shard_id: ShardId,
    /// Source cluster.
    pub source_cluster: String,
    /// Only entries with message id <= this bound, if set.
    pub inclusive_end_message_id: Option<i64>,
}

impl PurgeDlqMessagesRequest {
    /// The queue this request addresses.
    pub fn key(&self) -> DlqKey {
        DlqKey::new(self.dlq_type, self.shard_id, self.source_cluster.clone())
    }
}

/// Composite key for per-shard DLQ counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryDlqCountKey {
    /// Shard.
    pub shard_id: ShardId,
    /// Source cluster.
    pub source_cluster: String,
}

/// DLQ counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CountDlqMessagesResponse {
    /// Replication queue entries per (shard, source cluster).
    pub history: HashMap<HistoryDlqCountKey, i64>,
    /// Domain queue entries.
    pub domain: i64,
}
