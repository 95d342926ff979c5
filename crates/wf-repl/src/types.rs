//! Identifiers and snapshot types carried inside replication payloads.

use crate::enums::EncodingType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A statically partitioned unit of workflow ownership.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ShardId(i32);

impl ShardId {
    /// Creates a new ShardId from a raw i32 value
    pub const fn new(id: i32) -> Self {
        ShardId(id)
    }

    /// Returns the raw i32 value of this shard ID
    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one workflow run across clusters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    /// Domain the run belongs to.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
}

impl RunKey {
    /// Build a run key from its three parts.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// Opaque encoded history events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataBlob {
    /// How `data` is encoded.
    pub encoding_type: EncodingType,
    /// Encoded bytes.
    pub data: Vec<u8>,
}

impl DataBlob {
    /// Create a new blob.
    pub fn new(encoding_type: EncodingType, data: Vec<u8>) -> Self {
        Self {
            encoding_type,
            data,
        }
    }

    /// Returns true if the blob carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One (eventID, version) checkpoint on a history branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Last event id written under `version`.
    pub event_id: i64,
    /// Failover version that wrote the events.
    pub version: i64,
}

impl VersionHistoryItem {
    /// Create a new item.
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// Version history of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionHistory {
    /// Opaque branch token.
    pub branch_token: Vec<u8>,
    /// Checkpoints in ascending event id order.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Returns the last checkpoint, if any.
    pub fn last_item(&self) -> Option<&VersionHistoryItem> {
        self.items.last()
    }
}

/// Domain descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DomainInfo {
    /// Domain name.
    pub name: String,
    /// Registered/deprecated/deleted status code.
    pub status: i32,
    /// Free-form description.
    pub description: String,
    /// Owner contact.
    pub owner_email: String,
    /// Arbitrary key/value data.
    pub data: Vec<(String, String)>,
}

/// Domain behavioural configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DomainConfiguration {
    /// Retention of closed workflow history in days.
    pub workflow_execution_retention_period_in_days: i32,
    /// Whether metrics are emitted for this domain.
    pub emit_metric: bool,
}

/// Replication configuration of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DomainReplicationConfiguration {
    /// Cluster currently active for the domain.
    pub active_cluster_name: String,
    /// All clusters the domain replicates to.
    pub clusters: Vec<String>,
}

/// Get current time in nanoseconds since Unix epoch.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
