//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A storage collaborator (task log, DLQ store, cursor store) is unavailable.
    #[error("storage unavailable: {msg}")]
    StorageUnavailable {
        /// Error message describing the issue.
        msg: String,
    },

    /// A task depends on state that has not been replicated yet.
    #[error("dependency not yet replicated: {msg}")]
    DependencyNotReady {
        /// Error message describing the missing dependency.
        msg: String,
    },

    /// Transport error talking to a remote cluster.
    #[error("network error: {msg}")]
    NetworkError {
        /// Error message describing the network issue.
        msg: String,
    },

    /// A task is structurally invalid and can never be applied.
    #[error("malformed task {source_task_id}: {reason}")]
    MalformedTask {
        /// Source task id of the offending task.
        source_task_id: i64,
        /// Why the task was rejected.
        reason: String,
    },

    /// Local state refused a task; retrying will not help.
    #[error("task rejected by local state: {msg}")]
    ApplyRejected {
        /// Why the task was rejected.
        msg: String,
    },

    /// A request carried invalid arguments (bad token, bad page token, ...).
    #[error("bad request: {msg}")]
    BadRequest {
        /// Error message describing the problem.
        msg: String,
    },

    /// An enum could not be parsed from its text form.
    #[error("unknown enum value {value:?} for {enum_name}")]
    UnknownEnumValue {
        /// Name of the enum being parsed.
        enum_name: &'static str,
        /// The rejected text.
        value: String,
    },

    /// A DLQ store operation failed.
    #[error("DLQ store error: {msg}")]
    DlqStore {
        /// Error message describing the failure.
        msg: String,
    },

    /// Fetch or apply did not finish before its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplError {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplError::StorageUnavailable { .. }
                | ReplError::DependencyNotReady { .. }
                | ReplError::NetworkError { .. }
                | ReplError::DlqStore { .. }
                | ReplError::Timeout { .. }
                | ReplError::Io(_)
        )
    }

    /// Shorthand for a malformed-task error.
    pub fn malformed(source_task_id: i64, reason: impl Into<String>) -> Self {
        ReplError::MalformedTask {
            source_task_id,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;
