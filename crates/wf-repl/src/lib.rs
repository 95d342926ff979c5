#![warn(missing_docs)]

//! Workflow engine replication subsystem: cross-cluster task streaming, apply/dispatch, dead-letter queue

pub mod applier;
pub mod client;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod dlq;
pub mod dlq_store;
pub mod engine;
pub mod enums;
pub mod error;
pub mod failover_marker;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod processor;
pub mod retry;
pub mod source;
pub mod task;
pub mod task_store;
pub mod types;

pub use config::ReplConfig;
pub use engine::{EngineState, ReplicationEngine};
pub use error::{ReplError, Result};
pub use node::ReplicationNode;
pub use task::ReplicationTask;
