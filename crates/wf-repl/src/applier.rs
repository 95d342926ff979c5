//! Application of replicated tasks to local state.
//!
//! Workflow execution and domain business rules live outside this crate.
//! [`TaskApplier`] is the seam the dispatcher writes through; an implementation
//! reports transient failures with a retryable [`ReplError`] and permanent ones
//! with a non-retryable one. [`MemoryApplier`] records what it applied and can
//! be told to fail.

use crate::enums::ReplicationTaskType;
use crate::error::{ReplError, Result};
use crate::task::{DomainTaskAttributes, HistoryTaskV2Attributes, SyncActivityTaskAttributes};
use crate::types::RunKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Writes replicated tasks into local state.
#[async_trait]
pub trait TaskApplier: Send + Sync {
    /// Create or update a domain.
    async fn apply_domain(&self, source_cluster: &str, task: &DomainTaskAttributes) -> Result<()>;

    /// Append a history range to a run.
    async fn apply_history_v2(&self, source_cluster: &str, task: &HistoryTaskV2Attributes) -> Result<()>;

    /// Overwrite an activity's state.
    async fn apply_sync_activity(
        &self,
        source_cluster: &str,
        task: &SyncActivityTaskAttributes,
    ) -> Result<()>;
}

/// One successful application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTask {
    /// Kind of task.
    pub task_type: ReplicationTaskType,
    /// Domain id for domain tasks, run key otherwise.
    pub target: String,
    /// Version carried by the task.
    pub version: i64,
    /// Cluster it came from.
    pub source_cluster: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePlan {
    Transient(u32),
    Permanent,
}

/// In-memory applier with failure injection.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    applied: Mutex<Vec<AppliedTask>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MemoryApplier {
    /// Create an applier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` applications targeting `target` with a transient error.
    pub async fn fail_transient(&self, target: impl Into<String>, times: u32) {
        let target = target.into();
        let mut failures = self.failures.lock().await;
        if times == 0 {
            failures.remove(&target);
        } else {
            failures.insert(target, FailurePlan::Transient(times));
        }
    }

    /// Reject every application targeting `target` until cleared.
    pub async fn fail_permanently(&self, target: impl Into<String>) {
        self.failures
            .lock()
            .await
            .insert(target.into(), FailurePlan::Permanent);
    }

    /// Hold the next application targeting `target` for `delay` before it lands.
    pub async fn delay_next(&self, target: impl Into<String>, delay: Duration) {
        self.delays.lock().await.insert(target.into(), delay);
    }

    /// Stop injecting failures for `target`.
    pub async fn clear_failures(&self, target: &str) {
        self.failures.lock().await.remove(target);
    }

    /// Everything applied so far, in order.
    pub async fn applied(&self) -> Vec<AppliedTask> {
        self.applied.lock().await.clone()
    }

    /// Applications targeting `target`.
    pub async fn applied_to(&self, target: &str) -> Vec<AppliedTask> {
        self.applied
            .lock()
            .await
            .iter()
            .filter(|a| a.target == target)
            .cloned()
            .collect()
    }

    async fn check_failure(&self, target: &str) -> Result<()> {
        let mut failures = self.failures.lock().await;
        match failures.get_mut(target) {
            Some(FailurePlan::Permanent) => Err(ReplError::ApplyRejected {
                msg: format!("{} rejected", target),
            }),
            Some(FailurePlan::Transient(remaining)) => {
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(target);
                }
                Err(ReplError::DependencyNotReady {
                    msg: format!("{} not ready", target),
                })
            }
            None => Ok(()),
        }
    }

    async fn record(&self, task_type: ReplicationTaskType, target: String, version: i64, source_cluster: &str) -> Result<()> {
        let delay = self.delays.lock().await.remove(&target);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure(&target).await?;
        self.applied.lock().await.push(AppliedTask {
            task_type,
            target,
            version,
            source_cluster: source_cluster.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl TaskApplier for MemoryApplier {
    async fn apply_domain(&self, source_cluster: &str, task: &DomainTaskAttributes) -> Result<()> {
        self.record(
            ReplicationTaskType::Domain,
            task.id.clone(),
            task.failover_version,
            source_cluster,
        )
        .await
    }

    async fn apply_history_v2(&self, source_cluster: &str, task: &HistoryTaskV2Attributes) -> Result<()> {
        let target = RunKey::new(&task.domain_id, &task.workflow_id, &task.run_id).to_string();
        self.record(ReplicationTaskType::HistoryV2, target, task.version(), source_cluster)
            .await
    }

    async fn apply_sync_activity(
        &self,
        source_cluster: &str,
        task: &SyncActivityTaskAttributes,
    ) -> Result<()> {
        let target = RunKey::new(&task.domain_id, &task.workflow_id, &task.run_id).to_string();
        self.record(ReplicationTaskType::SyncActivity, target, task.version, source_cluster)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(run_id: &str) -> HistoryTaskV2Attributes {
        HistoryTaskV2Attributes {
            domain_id: "d".to_string(),
            workflow_id: "w".to_string(),
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_records_applications() {
        let applier = MemoryApplier::new();
        applier.apply_history_v2("east", &history("r1")).await.unwrap();
        let applied = applier.applied_to("d/w/r1").await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].task_type, ReplicationTaskType::HistoryV2);
        assert_eq!(applied[0].source_cluster, "east");
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let applier = MemoryApplier::new();
        applier.fail_transient("d/w/r1", 2).await;
        for _ in 0..2 {
            let err = applier.apply_history_v2("east", &history("r1")).await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(applier.apply_history_v2("east", &history("r1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_permanent_failure_until_cleared() {
        let applier = MemoryApplier::new();
        applier.fail_permanently("d/w/r1").await;
        let err = applier.apply_history_v2("east", &history("r1")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(applier.apply_history_v2("east", &history("r2")).await.is_ok());
        applier.clear_failures("d/w/r1").await;
        assert!(applier.apply_history_v2("east", &history("r1")).await.is_ok());
    }
}
