//! Serving side of the replication cursor protocol.
//!
//! A [`ReplicationSource`] hands out pages of a cluster's task log to the
//! destination clusters that pull from it. Each request carries the caller's
//! cursor; the processed half of the cursor is recorded as an acknowledgement
//! and the minimum acknowledgement over all callers is the point below which
//! the log may be garbage collected.

use crate::config::SourceConfig;
use crate::cursor::ReplicationStream;
use crate::enums::ReplicationTaskType;
use crate::error::{ReplError, Result};
use crate::messages::{
    GetDlqReplicationMessagesRequest, GetDlqReplicationMessagesResponse,
    GetDomainReplicationMessagesRequest, GetDomainReplicationMessagesResponse,
    GetReplicationMessagesRequest, GetReplicationMessagesResponse, ReplicationMessages,
    ReplicationToken, SyncShardStatus,
};
use crate::task::ReplicationTask;
use crate::task_store::{TaskLog, DOMAIN_STREAM_SHARD};
use crate::types::{now_nanos, ShardId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Domain stream position used when the caller has never retrieved anything.
const DOMAIN_STREAM_START: i64 = -1;

/// Serves replication pages from a cluster's task logs.
pub struct ReplicationSource {
    cluster_name: String,
    task_log: Arc<dyn TaskLog>,
    domain_log: Arc<dyn TaskLog>,
    config: SourceConfig,
    acks: Mutex<HashMap<ReplicationStream, HashMap<String, i64>>>,
}

impl ReplicationSource {
    /// Create a source over a per-shard task log and a domain task log.
    pub fn new(
        cluster_name: impl Into<String>,
        task_log: Arc<dyn TaskLog>,
        domain_log: Arc<dyn TaskLog>,
        config: SourceConfig,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            task_log,
            domain_log,
            config,
            acks: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the cluster this source serves.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Append a locally generated task to its stream.
    ///
    /// Domain tasks go to the domain stream regardless of `shard_id`. Task
    /// ids must increase strictly within a stream.
    pub async fn publish(&self, shard_id: ShardId, task: ReplicationTask) -> Result<()> {
        task.validate()?;
        let (log, shard_id) = if task.task_type == ReplicationTaskType::Domain {
            (&self.domain_log, DOMAIN_STREAM_SHARD)
        } else {
            (&self.task_log, shard_id)
        };
        let max = log.max_task_id(shard_id).await?;
        if task.source_task_id <= max {
            return Err(ReplError::malformed(
                task.source_task_id,
                format!("task id not above current maximum {}", max),
            ));
        }
        log.append(shard_id, task).await
    }

    /// Serve one page per token.
    ///
    /// A token with `last_processed > last_retrieved` is skipped and its
    /// shard is absent from the response.
    pub async fn get_replication_messages(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> Result<GetReplicationMessagesResponse> {
        let mut response = GetReplicationMessagesResponse::default();
        for token in &request.tokens {
            if let Err(e) = token.validate() {
                warn!(
                    caller = %request.cluster_name,
                    shard_id = %token.shard_id,
                    error = %e,
                    "rejecting malformed replication token"
                );
                continue;
            }
            self.record_ack(
                &request.cluster_name,
                ReplicationStream::Shard(token.shard_id),
                token.last_processed_message_id,
            )
            .await;
            let page = self.page_for_token(token).await?;
            debug!(
                caller = %request.cluster_name,
                shard_id = %token.shard_id,
                tasks = page.replication_tasks.len(),
                last_retrieved = page.last_retrieved_message_id,
                has_more = page.has_more,
                "serving replication page"
            );
            response.messages_by_shard.insert(token.shard_id, page);
        }
        Ok(response)
    }

    async fn page_for_token(&self, token: &ReplicationToken) -> Result<ReplicationMessages> {
        let mut limit = self.config.page_size;
        if self.config.max_read_ahead > 0 {
            let headroom = self.config.max_read_ahead - token.read_ahead();
            if headroom <= 0 {
                let mut page = ReplicationMessages::empty(token.last_retrieved_message_id, true);
                page.sync_shard_status = Some(heartbeat());
                return Ok(page);
            }
            limit = limit.min(headroom as usize);
        }
        let range = self
            .task_log
            .read_after(token.shard_id, token.last_retrieved_message_id, limit)
            .await?;
        let last_retrieved = range
            .tasks
            .last()
            .map(|t| t.source_task_id)
            .unwrap_or(token.last_retrieved_message_id);
        Ok(ReplicationMessages {
            replication_tasks: range.tasks,
            last_retrieved_message_id: last_retrieved,
            has_more: range.has_more,
            sync_shard_status: Some(heartbeat()),
        })
    }

    /// Serve one page of the domain stream.
    pub async fn get_domain_replication_messages(
        &self,
        request: GetDomainReplicationMessagesRequest,
    ) -> Result<GetDomainReplicationMessagesResponse> {
        let last_retrieved = request
            .last_retrieved_message_id
            .unwrap_or(DOMAIN_STREAM_START);
        if let Some(processed) = request.last_processed_message_id {
            if processed > last_retrieved {
                return Err(ReplError::BadRequest {
                    msg: format!(
                        "domain stream: last_processed {} > last_retrieved {}",
                        processed, last_retrieved
                    ),
                });
            }
            self.record_ack(&request.cluster_name, ReplicationStream::Domain, processed)
                .await;
        }
        let range = self
            .domain_log
            .read_after(DOMAIN_STREAM_SHARD, last_retrieved, self.config.domain_page_size)
            .await?;
        let last = range
            .tasks
            .last()
            .map(|t| t.source_task_id)
            .unwrap_or(last_retrieved);
        Ok(GetDomainReplicationMessagesResponse {
            messages: ReplicationMessages {
                replication_tasks: range.tasks,
                last_retrieved_message_id: last,
                has_more: range.has_more,
                sync_shard_status: Some(heartbeat()),
            },
        })
    }

    /// Resolve DLQ identity keys to full tasks. Keys that are invalid or no
    /// longer in the log are skipped.
    pub async fn get_dlq_replication_messages(
        &self,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<GetDlqReplicationMessagesResponse> {
        let mut replication_tasks = Vec::with_capacity(request.task_infos.len());
        for info in &request.task_infos {
            if let Err(e) = info.validate() {
                warn!(task_id = info.task_id, error = %e, "skipping invalid task info");
                continue;
            }
            let log = if info.replication_task_type() == ReplicationTaskType::Domain {
                &self.domain_log
            } else {
                &self.task_log
            };
            match log.find(info).await? {
                Some(task) => replication_tasks.push(task),
                None => debug!(task_id = info.task_id, "task info not found in log"),
            }
        }
        Ok(GetDlqReplicationMessagesResponse { replication_tasks })
    }

    async fn record_ack(&self, caller: &str, stream: ReplicationStream, processed: i64) {
        let mut acks = self.acks.lock().await;
        let entry = acks
            .entry(stream)
            .or_default()
            .entry(caller.to_string())
            .or_insert(processed);
        *entry = (*entry).max(processed);
    }

    /// Lowest processed id acknowledged by any caller of a stream, or `None`
    /// if nobody has pulled it yet.
    pub async fn gc_watermark(&self, stream: ReplicationStream) -> Option<i64> {
        let acks = self.acks.lock().await;
        acks.get(&stream).and_then(|callers| callers.values().min().copied())
    }

    /// Drop tasks every known caller has processed. Returns how many were removed.
    pub async fn trim_acknowledged(&self, stream: ReplicationStream) -> Result<usize> {
        let Some(watermark) = self.gc_watermark(stream).await else {
            return Ok(0);
        };
        let removed = match stream {
            ReplicationStream::Shard(shard_id) => {
                self.task_log.trim_through(shard_id, watermark).await?
            }
            ReplicationStream::Domain => {
                self.domain_log
                    .trim_through(DOMAIN_STREAM_SHARD, watermark)
                    .await?
            }
        };
        if removed > 0 {
            debug!(stream = %stream, watermark, removed, "trimmed acknowledged tasks");
        }
        Ok(removed)
    }
}

fn heartbeat() -> SyncShardStatus {
    SyncShardStatus {
        timestamp: Some(now_nanos()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::fixtures::{domain_task, history_task};
    use crate::task_store::MemoryTaskLog;

    const SHARD: ShardId = ShardId::new(1);

    fn config(page_size: usize, max_read_ahead: i64) -> SourceConfig {
        SourceConfig {
            page_size,
            domain_page_size: page_size,
            max_read_ahead,
        }
    }

    async fn source_with(ids: &[i64], config: SourceConfig) -> ReplicationSource {
        let source = ReplicationSource::new(
            "east",
            Arc::new(MemoryTaskLog::new()),
            Arc::new(MemoryTaskLog::new()),
            config,
        );
        for id in ids {
            source.publish(SHARD, history_task(*id, "r1", 1)).await.unwrap();
        }
        source
    }

    fn request(caller: &str, tokens: Vec<ReplicationToken>) -> GetReplicationMessagesRequest {
        GetReplicationMessagesRequest {
            tokens,
            cluster_name: caller.to_string(),
        }
    }

    mod paging {
        use super::*;

        #[tokio::test]
        async fn test_first_page_has_more() {
            let source = source_with(&[1, 2, 3, 5, 9], config(2, 0)).await;
            let resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 0, 0)]))
                .await
                .unwrap();
            let page = &resp.messages_by_shard[&SHARD];
            let ids: Vec<i64> = page.replication_tasks.iter().map(|t| t.source_task_id).collect();
            assert_eq!(ids, vec![1, 2]);
            assert!(page.has_more);
            assert_eq!(page.last_retrieved_message_id, 2);
            assert!(page.sync_shard_status.unwrap().timestamp.is_some());
        }

        #[tokio::test]
        async fn test_caught_up_page_is_empty() {
            let source = source_with(&[1, 2, 3, 5, 9], config(2, 0)).await;
            let resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 9, 9)]))
                .await
                .unwrap();
            let page = &resp.messages_by_shard[&SHARD];
            assert!(page.replication_tasks.is_empty());
            assert!(!page.has_more);
            assert_eq!(page.last_retrieved_message_id, 9);
        }

        #[tokio::test]
        async fn test_page_strictly_after_cursor() {
            let source = source_with(&[1, 2, 3, 5, 9], config(10, 0)).await;
            let resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 3, 3)]))
                .await
                .unwrap();
            let page = &resp.messages_by_shard[&SHARD];
            let ids: Vec<i64> = page.replication_tasks.iter().map(|t| t.source_task_id).collect();
            assert_eq!(ids, vec![5, 9]);
            assert!(page.is_ordered());
        }

        #[tokio::test]
        async fn test_malformed_token_omits_shard() {
            let source = source_with(&[1, 2], config(10, 0)).await;
            let resp = source
                .get_replication_messages(request(
                    "west",
                    vec![
                        ReplicationToken::new(SHARD, 1, 2),
                        ReplicationToken::new(ShardId::new(2), 0, 0),
                    ],
                ))
                .await
                .unwrap();
            assert!(!resp.messages_by_shard.contains_key(&SHARD));
            assert!(resp.messages_by_shard.contains_key(&ShardId::new(2)));
        }

        #[tokio::test]
        async fn test_storage_error_surfaces_as_retryable() {
            let log = Arc::new(MemoryTaskLog::new());
            let source = ReplicationSource::new(
                "east",
                log.clone(),
                Arc::new(MemoryTaskLog::new()),
                config(10, 0),
            );
            log.set_unavailable(true);
            let err = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 0, 0)]))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
    }

    mod read_ahead {
        use super::*;

        #[tokio::test]
        async fn test_limit_reached_returns_empty_page() {
            let source = source_with(&[1, 2, 3, 4, 5, 6], config(10, 3)).await;
            let resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 3, 0)]))
                .await
                .unwrap();
            let page = &resp.messages_by_shard[&SHARD];
            assert!(page.replication_tasks.is_empty());
            assert!(page.has_more);
            assert_eq!(page.last_retrieved_message_id, 3);
        }

        #[tokio::test]
        async fn test_page_capped_by_headroom() {
            let source = source_with(&[1, 2, 3, 4, 5, 6], config(10, 3)).await;
            let resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 2, 1)]))
                .await
                .unwrap();
            let page = &resp.messages_by_shard[&SHARD];
            let ids: Vec<i64> = page.replication_tasks.iter().map(|t| t.source_task_id).collect();
            assert_eq!(ids, vec![3, 4]);
            assert!(page.has_more);
        }
    }

    mod domain_stream {
        use super::*;

        #[tokio::test]
        async fn test_domain_tasks_go_to_domain_stream() {
            let source = source_with(&[], config(10, 0)).await;
            source.publish(SHARD, domain_task(1, "d1")).await.unwrap();
            source.publish(SHARD, domain_task(2, "d2")).await.unwrap();

            let shard_resp = source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 0, 0)]))
                .await
                .unwrap();
            assert!(shard_resp.messages_by_shard[&SHARD].replication_tasks.is_empty());

            let resp = source
                .get_domain_replication_messages(GetDomainReplicationMessagesRequest {
                    last_retrieved_message_id: None,
                    last_processed_message_id: None,
                    cluster_name: "west".to_string(),
                })
                .await
                .unwrap();
            assert_eq!(resp.messages.replication_tasks.len(), 2);
            assert_eq!(resp.messages.last_retrieved_message_id, 2);
            assert!(!resp.messages.has_more);
        }

        #[tokio::test]
        async fn test_domain_processed_beyond_retrieved_rejected() {
            let source = source_with(&[], config(10, 0)).await;
            let err = source
                .get_domain_replication_messages(GetDomainReplicationMessagesRequest {
                    last_retrieved_message_id: Some(1),
                    last_processed_message_id: Some(5),
                    cluster_name: "west".to_string(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::BadRequest { .. }));
        }
    }

    mod publish {
        use super::*;

        #[tokio::test]
        async fn test_ids_must_increase() {
            let source = source_with(&[5], config(10, 0)).await;
            assert!(source.publish(SHARD, history_task(5, "r1", 1)).await.is_err());
            assert!(source.publish(SHARD, history_task(4, "r1", 1)).await.is_err());
            assert!(source.publish(SHARD, history_task(6, "r1", 1)).await.is_ok());
        }

        #[tokio::test]
        async fn test_task_without_payload_rejected() {
            let source = source_with(&[], config(10, 0)).await;
            let task = ReplicationTask::declared(ReplicationTaskType::HistoryV2, 1);
            assert!(source.publish(SHARD, task).await.is_err());
        }
    }

    mod garbage_collection {
        use super::*;

        #[tokio::test]
        async fn test_watermark_is_min_over_callers() {
            let source = source_with(&[1, 2, 3, 4], config(10, 0)).await;
            let stream = ReplicationStream::Shard(SHARD);
            assert_eq!(source.gc_watermark(stream).await, None);

            source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 4, 3)]))
                .await
                .unwrap();
            source
                .get_replication_messages(request("north", vec![ReplicationToken::new(SHARD, 2, 1)]))
                .await
                .unwrap();
            assert_eq!(source.gc_watermark(stream).await, Some(1));

            assert_eq!(source.trim_acknowledged(stream).await.unwrap(), 1);
            let resp = source
                .get_replication_messages(request("north", vec![ReplicationToken::new(SHARD, 0, 0)]))
                .await
                .unwrap();
            assert_eq!(resp.messages_by_shard[&SHARD].replication_tasks[0].source_task_id, 2);
        }

        #[tokio::test]
        async fn test_ack_never_moves_backwards() {
            let source = source_with(&[1, 2, 3], config(10, 0)).await;
            let stream = ReplicationStream::Shard(SHARD);
            source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 3, 3)]))
                .await
                .unwrap();
            source
                .get_replication_messages(request("west", vec![ReplicationToken::new(SHARD, 0, 0)]))
                .await
                .unwrap();
            assert_eq!(source.gc_watermark(stream).await, Some(3));
        }
    }

    #[tokio::test]
    async fn test_dlq_lookup_skips_unknown() {
        let source = source_with(&[1, 2], config(10, 0)).await;
        source.publish(SHARD, domain_task(1, "d1")).await.unwrap();
        let resp = source
            .get_dlq_replication_messages(GetDlqReplicationMessagesRequest {
                task_infos: vec![
                    history_task(2, "r1", 1).task_info(),
                    history_task(7, "r1", 1).task_info(),
                    domain_task(1, "d1").task_info(),
                ],
            })
            .await
            .unwrap();
        let ids: Vec<i64> = resp.replication_tasks.iter().map(|t| t.source_task_id).collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
