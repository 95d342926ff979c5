//! Replication task model.
//!
//! A [`ReplicationTask`] is an envelope around exactly one [`TaskPayload`].
//! The declared [`ReplicationTaskType`] travels next to the payload so that a
//! task from a newer or misbehaving cluster can still be decoded, carried
//! through the pipeline and parked in the DLQ; [`ReplicationTask::validate`]
//! is the single place that decides whether the two agree.

use crate::enums::{DomainOperation, ReplicationTaskType};
use crate::error::{ReplError, Result};
use crate::types::{
    DataBlob, DomainConfiguration, DomainInfo, DomainReplicationConfiguration, RunKey,
    VersionHistory, VersionHistoryItem,
};
use serde::{Deserialize, Serialize};

/// Replicates tenant metadata and failover state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DomainTaskAttributes {
    /// Create or update.
    pub domain_operation: DomainOperation,
    /// Domain id.
    pub id: String,
    /// Descriptive metadata snapshot.
    pub info: Option<DomainInfo>,
    /// Configuration snapshot.
    pub config: Option<DomainConfiguration>,
    /// Replication configuration snapshot.
    pub replication_config: Option<DomainReplicationConfiguration>,
    /// Configuration version at the source.
    pub config_version: i64,
    /// Failover version after this change.
    pub failover_version: i64,
    /// Failover version before this change.
    pub previous_failover_version: i64,
}

/// Replicates a contiguous range of workflow history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HistoryTaskV2Attributes {
    /// Domain id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Ordered branch checkpoints; the last one carries the task version.
    pub version_history_items: Vec<VersionHistoryItem>,
    /// Encoded events.
    pub events: Option<DataBlob>,
    /// Encoded events of the continued-as-new run, if any.
    pub new_run_events: Option<DataBlob>,
}

impl HistoryTaskV2Attributes {
    /// Version of the newest checkpoint, or 0 if there is none.
    pub fn version(&self) -> i64 {
        self.version_history_items
            .last()
            .map(|item| item.version)
            .unwrap_or(0)
    }

    /// Last event id covered by the checkpoints, or 0 if there is none.
    pub fn last_event_id(&self) -> i64 {
        self.version_history_items
            .last()
            .map(|item| item.event_id)
            .unwrap_or(0)
    }

    /// First event id written under the newest checkpoint's version: one past
    /// the previous checkpoint, or 1 when there is only one.
    pub fn first_event_id(&self) -> i64 {
        self.version_history_items
            .iter()
            .rev()
            .nth(1)
            .map(|prev| prev.event_id + 1)
            .unwrap_or(1)
    }
}

/// Point-in-time snapshot of an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncActivityTaskAttributes {
    /// Domain id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Failover version of the write.
    pub version: i64,
    /// Event id of ActivityTaskScheduled.
    pub scheduled_id: i64,
    /// Schedule time (nanoseconds).
    pub scheduled_time: Option<i64>,
    /// Event id of ActivityTaskStarted.
    pub started_id: i64,
    /// Start time (nanoseconds).
    pub started_time: Option<i64>,
    /// Last heartbeat time (nanoseconds).
    pub last_heartbeat_time: Option<i64>,
    /// Heartbeat details.
    pub details: Vec<u8>,
    /// Attempt count.
    pub attempt: i32,
    /// Reason of the last failure.
    pub last_failure_reason: Option<String>,
    /// Identity of the last worker.
    pub last_worker_identity: String,
    /// Details of the last failure.
    pub last_failure_details: Vec<u8>,
    /// Version history of the run at the source.
    pub version_history: Option<VersionHistory>,
}

/// Shard liveness/progress heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncShardStatusTaskAttributes {
    /// Cluster that emitted the heartbeat.
    pub source_cluster: String,
    /// Shard the heartbeat is for.
    pub shard_id: i64,
    /// Source clock (nanoseconds).
    pub timestamp: Option<i64>,
}

/// Domain failover barrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FailoverMarkerAttributes {
    /// Domain that failed over.
    pub domain_id: String,
    /// New failover version.
    pub failover_version: i64,
    /// Creation time at the source (nanoseconds).
    pub creation_time: Option<i64>,
}

impl FailoverMarkerAttributes {
    /// Create a new marker.
    pub fn new(domain_id: impl Into<String>, failover_version: i64, creation_time: Option<i64>) -> Self {
        Self {
            domain_id: domain_id.into(),
            failover_version,
            creation_time,
        }
    }
}

/// A batch of failover markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FailoverMarkers {
    /// The markers.
    pub failover_markers: Vec<FailoverMarkerAttributes>,
}

/// The one payload a replication task carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    /// Domain metadata.
    Domain(DomainTaskAttributes),
    /// Versioned history range.
    HistoryV2(HistoryTaskV2Attributes),
    /// Activity snapshot.
    SyncActivity(SyncActivityTaskAttributes),
    /// Shard heartbeat.
    SyncShardStatus(SyncShardStatusTaskAttributes),
    /// Failover barrier.
    FailoverMarker(FailoverMarkerAttributes),
}

impl TaskPayload {
    /// The task type this payload belongs to.
    pub fn task_type(&self) -> ReplicationTaskType {
        match self {
            TaskPayload::Domain(_) => ReplicationTaskType::Domain,
            TaskPayload::HistoryV2(_) => ReplicationTaskType::HistoryV2,
            TaskPayload::SyncActivity(_) => ReplicationTaskType::SyncActivity,
            TaskPayload::SyncShardStatus(_) => ReplicationTaskType::SyncShardStatus,
            TaskPayload::FailoverMarker(_) => ReplicationTaskType::FailoverMarker,
        }
    }
}

/// Envelope of one replicable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Declared type; must match the payload.
    pub task_type: ReplicationTaskType,
    /// Monotonically increasing per shard at the source.
    pub source_task_id: i64,
    /// Creation time at the source (nanoseconds).
    pub creation_time: Option<i64>,
    /// The payload, absent while the task is being staged.
    pub payload: Option<TaskPayload>,
}

impl ReplicationTask {
    /// Create a task whose declared type is taken from its payload.
    pub fn new(source_task_id: i64, payload: TaskPayload) -> Self {
        Self {
            task_type: payload.task_type(),
            source_task_id,
            creation_time: None,
            payload: Some(payload),
        }
    }

    /// Start a staged task with a declared type and no payload yet.
    pub fn declared(task_type: ReplicationTaskType, source_task_id: i64) -> Self {
        Self {
            task_type,
            source_task_id,
            creation_time: None,
            payload: None,
        }
    }

    /// Attach the payload to a staged task, checking it matches the declared type.
    pub fn with_payload(mut self, payload: TaskPayload) -> Result<Self> {
        if payload.task_type() != self.task_type {
            return Err(ReplError::malformed(
                self.source_task_id,
                format!(
                    "declared {} but payload is {}",
                    self.task_type,
                    payload.task_type()
                ),
            ));
        }
        self.payload = Some(payload);
        Ok(self)
    }

    /// Set the creation time.
    pub fn with_creation_time(mut self, creation_time: i64) -> Self {
        self.creation_time = Some(creation_time);
        self
    }

    /// Check that exactly one payload is present and that it matches the declared type.
    pub fn validate(&self) -> Result<()> {
        match &self.payload {
            None => Err(ReplError::malformed(
                self.source_task_id,
                format!("declared {} without payload", self.task_type),
            )),
            Some(payload) if payload.task_type() != self.task_type => Err(ReplError::malformed(
                self.source_task_id,
                format!(
                    "declared {} but payload is {}",
                    self.task_type,
                    payload.task_type()
                ),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Creation time, or 0 when unset.
    pub fn creation_time_or_zero(&self) -> i64 {
        self.creation_time.unwrap_or(0)
    }

    /// Domain payload, if this task carries one.
    pub fn domain_attributes(&self) -> Option<&DomainTaskAttributes> {
        match &self.payload {
            Some(TaskPayload::Domain(attr)) => Some(attr),
            _ => None,
        }
    }

    /// History payload, if this task carries one.
    pub fn history_v2_attributes(&self) -> Option<&HistoryTaskV2Attributes> {
        match &self.payload {
            Some(TaskPayload::HistoryV2(attr)) => Some(attr),
            _ => None,
        }
    }

    /// Activity payload, if this task carries one.
    pub fn sync_activity_attributes(&self) -> Option<&SyncActivityTaskAttributes> {
        match &self.payload {
            Some(TaskPayload::SyncActivity(attr)) => Some(attr),
            _ => None,
        }
    }

    /// Shard status payload, if this task carries one.
    pub fn sync_shard_status_attributes(&self) -> Option<&SyncShardStatusTaskAttributes> {
        match &self.payload {
            Some(TaskPayload::SyncShardStatus(attr)) => Some(attr),
            _ => None,
        }
    }

    /// Failover marker payload, if this task carries one.
    pub fn failover_marker_attributes(&self) -> Option<&FailoverMarkerAttributes> {
        match &self.payload {
            Some(TaskPayload::FailoverMarker(attr)) => Some(attr),
            _ => None,
        }
    }

    /// Run this task targets, for payloads that target a run.
    pub fn run_key(&self) -> Option<RunKey> {
        match &self.payload {
            Some(TaskPayload::HistoryV2(a)) => {
                Some(RunKey::new(&a.domain_id, &a.workflow_id, &a.run_id))
            }
            Some(TaskPayload::SyncActivity(a)) => {
                Some(RunKey::new(&a.domain_id, &a.workflow_id, &a.run_id))
            }
            _ => None,
        }
    }

    /// Derive the identity key of this task.
    ///
    /// Fields that do not apply to the payload are left at zero/empty.
    pub fn task_info(&self) -> ReplicationTaskInfo {
        let mut info = ReplicationTaskInfo {
            task_type: self.task_type.code(),
            task_id: self.source_task_id,
            ..Default::default()
        };
        match &self.payload {
            Some(TaskPayload::Domain(a)) => {
                info.domain_id = a.id.clone();
                info.version = a.failover_version;
            }
            Some(TaskPayload::HistoryV2(a)) => {
                info.domain_id = a.domain_id.clone();
                info.workflow_id = a.workflow_id.clone();
                info.run_id = a.run_id.clone();
                info.version = a.version();
                if let Some(last) = a.version_history_items.last() {
                    info.first_event_id = a.first_event_id();
                    info.next_event_id = last.event_id + 1;
                }
            }
            Some(TaskPayload::SyncActivity(a)) => {
                info.domain_id = a.domain_id.clone();
                info.workflow_id = a.workflow_id.clone();
                info.run_id = a.run_id.clone();
                info.version = a.version;
                info.scheduled_id = a.scheduled_id;
            }
            Some(TaskPayload::FailoverMarker(a)) => {
                info.domain_id = a.domain_id.clone();
                info.version = a.failover_version;
            }
            Some(TaskPayload::SyncShardStatus(_)) | None => {}
        }
        info
    }
}

/// Identity key of a replication task, independent of its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ReplicationTaskInfo {
    /// Domain id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Numeric task type code, unknown codes included.
    pub task_type: i32,
    /// Source task id.
    pub task_id: i64,
    /// Version of the write.
    pub version: i64,
    /// First event id of the replicated range.
    pub first_event_id: i64,
    /// Event id after the replicated range.
    pub next_event_id: i64,
    /// Scheduled event id for activity tasks.
    pub scheduled_id: i64,
}

impl ReplicationTaskInfo {
    /// The fields that make two deliveries the same logical unit.
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity {
            domain_id: self.domain_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            task_type: self.task_type,
            task_id: self.task_id,
        }
    }

    /// Declared task type.
    pub fn replication_task_type(&self) -> ReplicationTaskType {
        ReplicationTaskType::from(self.task_type)
    }

    /// Reject keys with an inverted history range.
    pub fn validate(&self) -> Result<()> {
        if self.next_event_id != 0 && self.next_event_id < self.first_event_id {
            return Err(ReplError::malformed(
                self.task_id,
                format!(
                    "next_event_id {} < first_event_id {}",
                    self.next_event_id, self.first_event_id
                ),
            ));
        }
        Ok(())
    }
}

/// Dedupe key: two tasks with equal identities are the same logical unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// Domain id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Numeric task type code.
    pub task_type: i32,
    /// Source task id.
    pub task_id: i64,
}
