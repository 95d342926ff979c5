//! Operator-facing DLQ lifecycle: read, merge, purge and count.
//!
//! Every operation addresses one queue by (DLQ type, shard, source cluster).
//! Storage errors are returned to the caller as they are; nothing in here
//! retries on its own.

use crate::client::ReplicationClient;
use crate::config::DlqConfig;
use crate::dispatcher::{DispatchOptions, TaskDispatcher};
use crate::dlq_store::{DlqEntry, DlqRange, DlqStore};
use crate::enums::DlqType;
use crate::error::Result;
use crate::messages::{
    CountDlqMessagesResponse, GetDlqReplicationMessagesRequest, HistoryDlqCountKey,
    MergeDlqMessagesRequest, MergeDlqMessagesResponse, PageToken, PurgeDlqMessagesRequest,
    ReadDlqMessagesRequest, ReadDlqMessagesResponse,
};
use crate::task::TaskIdentity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CachedCounts {
    counts: CountDlqMessagesResponse,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct DlqStatsInner {
    pages_read: AtomicU64,
    merged: AtomicU64,
    merge_failures: AtomicU64,
    purged: AtomicU64,
    recounts: AtomicU64,
}

/// DLQ manager counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    /// Pages served by read.
    pub pages_read: u64,
    /// Entries re-applied and removed by merge.
    pub merged: u64,
    /// Entries merge left in place.
    pub merge_failures: u64,
    /// Entries removed by purge.
    pub purged: u64,
    /// Full recounts against the store.
    pub recounts: u64,
}

/// Read/merge/purge/count over the DLQ.
pub struct DlqManager {
    store: Arc<dyn DlqStore>,
    dispatcher: Arc<TaskDispatcher>,
    sources: RwLock<HashMap<String, Arc<dyn ReplicationClient>>>,
    config: DlqConfig,
    count_cache: Mutex<Option<CachedCounts>>,
    stats: DlqStatsInner,
}

impl DlqManager {
    /// Create a manager that re-applies through `dispatcher`.
    pub fn new(store: Arc<dyn DlqStore>, dispatcher: Arc<TaskDispatcher>, config: DlqConfig) -> Self {
        Self {
            store,
            dispatcher,
            sources: RwLock::new(HashMap::new()),
            config,
            count_cache: Mutex::new(None),
            stats: DlqStatsInner::default(),
        }
    }

    /// Refresh parked tasks from their source cluster before merging them.
    pub async fn add_source(&self, client: Arc<dyn ReplicationClient>) {
        self.sources
            .write()
            .await
            .insert(client.source_cluster().to_string(), client);
    }

    fn page_size(&self, requested: i32) -> usize {
        if requested <= 0 {
            self.config.default_page_size
        } else {
            requested as usize
        }
    }

    async fn load_page(&self, request: &ReadDlqMessagesRequest) -> Result<DlqRange> {
        let after = request
            .next_page_token
            .as_ref()
            .map(PageToken::decode_position)
            .transpose()?;
        self.store
            .range(
                &request.key(),
                after,
                request.inclusive_end_message_id,
                self.page_size(request.maximum_page_size),
            )
            .await
    }

    fn next_token(range: &DlqRange) -> Result<Option<PageToken>> {
        match range.entries.last() {
            Some(last) if range.has_more => Ok(Some(PageToken::encode_position(last.message_id)?)),
            _ => Ok(None),
        }
    }

    /// Read one page of a queue.
    pub async fn read(&self, request: ReadDlqMessagesRequest) -> Result<ReadDlqMessagesResponse> {
        let range = self.load_page(&request).await?;
        let next_page_token = Self::next_token(&range)?;
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        let (replication_tasks, replication_tasks_info): (Vec<_>, Vec<_>) = range
            .entries
            .into_iter()
            .map(|e| (e.task, e.task_info))
            .unzip();
        Ok(ReadDlqMessagesResponse {
            dlq_type: request.dlq_type,
            replication_tasks,
            replication_tasks_info,
            next_page_token,
        })
    }

    /// Re-apply one page of a queue. Entries that apply (or turn out to be
    /// redundant) are removed; the rest stay for a later attempt.
    pub async fn merge(&self, request: MergeDlqMessagesRequest) -> Result<MergeDlqMessagesResponse> {
        let range = self.load_page(&request).await?;
        let next_page_token = Self::next_token(&range)?;
        let entries = self.refresh_from_source(&request.source_cluster, range.entries).await?;

        let mut resolved = Vec::with_capacity(entries.len());
        for entry in &entries {
            let outcome = self
                .dispatcher
                .reapply(
                    request.shard_id,
                    &request.source_cluster,
                    &entry.task,
                    DispatchOptions::default(),
                )
                .await?;
            if outcome.is_resolved() {
                resolved.push(entry.message_id);
            } else {
                debug!(message_id = entry.message_id, outcome = ?outcome, "entry stays in DLQ");
            }
        }

        let failed = (entries.len() - resolved.len()) as u64;
        let removed = self.store.delete(&request.key(), &resolved).await?;
        self.stats.merged.fetch_add(removed as u64, Ordering::Relaxed);
        self.stats.merge_failures.fetch_add(failed, Ordering::Relaxed);
        info!(
            dlq_type = %request.dlq_type,
            shard_id = %request.shard_id,
            source_cluster = %request.source_cluster,
            merged = removed,
            failed,
            "merged DLQ page"
        );
        Ok(MergeDlqMessagesResponse { next_page_token })
    }

    async fn refresh_from_source(
        &self,
        source_cluster: &str,
        mut entries: Vec<DlqEntry>,
    ) -> Result<Vec<DlqEntry>> {
        let Some(client) = self.sources.read().await.get(source_cluster).cloned() else {
            return Ok(entries);
        };
        if entries.is_empty() {
            return Ok(entries);
        }
        let request = GetDlqReplicationMessagesRequest {
            task_infos: entries.iter().map(|e| e.task_info.clone()).collect(),
        };
        let response = client.get_dlq_replication_messages(request).await?;
        let mut fresh: HashMap<TaskIdentity, _> = response
            .replication_tasks
            .into_iter()
            .map(|t| (t.task_info().identity(), t))
            .collect();
        for entry in &mut entries {
            match fresh.remove(&entry.task_info.identity()) {
                Some(task) => entry.task = task,
                None => debug!(
                    message_id = entry.message_id,
                    "source no longer has task, using parked copy"
                ),
            }
        }
        Ok(entries)
    }

    /// Delete entries without re-applying them.
    pub async fn purge(&self, request: PurgeDlqMessagesRequest) -> Result<()> {
        let removed = self
            .store
            .delete_through(&request.key(), request.inclusive_end_message_id)
            .await?;
        self.stats.purged.fetch_add(removed as u64, Ordering::Relaxed);
        info!(
            dlq_type = %request.dlq_type,
            shard_id = %request.shard_id,
            source_cluster = %request.source_cluster,
            inclusive_end = ?request.inclusive_end_message_id,
            removed,
            "purged DLQ"
        );
        Ok(())
    }

    /// Entry counts. Served from cache unless `force_fetch` or the cache is
    /// older than the configured TTL.
    pub async fn count(&self, force_fetch: bool) -> Result<CountDlqMessagesResponse> {
        let mut cache = self.count_cache.lock().await;
        let ttl = Duration::from_millis(self.config.count_cache_ttl_ms);
        if !force_fetch {
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < ttl {
                    return Ok(cached.counts.clone());
                }
            }
        }

        let mut counts = CountDlqMessagesResponse::default();
        for (key, n) in self.store.count_all().await? {
            match key.dlq_type {
                DlqType::Replication => {
                    *counts
                        .history
                        .entry(HistoryDlqCountKey {
                            shard_id: key.shard_id,
                            source_cluster: key.source_cluster,
                        })
                        .or_insert(0) += n;
                }
                DlqType::Domain => counts.domain += n,
                DlqType::Unknown(code) => {
                    warn!(code, entries = n, "ignoring DLQ with unknown type in count")
                }
            }
        }
        self.stats.recounts.fetch_add(1, Ordering::Relaxed);
        *cache = Some(CachedCounts {
            counts: counts.clone(),
            fetched_at: Instant::now(),
        });
        Ok(counts)
    }

    /// Snapshot of manager counters.
    pub fn stats(&self) -> DlqStats {
        DlqStats {
            pages_read: self.stats.pages_read.load(Ordering::Relaxed),
            merged: self.stats.merged.load(Ordering::Relaxed),
            merge_failures: self.stats.merge_failures.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
            recounts: self.stats.recounts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use crate::dlq_store::MemoryDlqStore;
    use crate::error::ReplError;
    use crate::failover_marker::FailoverMarkerTracker;
    use crate::messages::DlqKey;
    use crate::retry::RetryPolicy;
    use crate::task::fixtures::{domain_task, history_task};
    use crate::types::ShardId;

    const SHARD: ShardId = ShardId::new(2);

    struct Harness {
        applier: Arc<MemoryApplier>,
        store: Arc<MemoryDlqStore>,
        dispatcher: Arc<TaskDispatcher>,
        manager: DlqManager,
    }

    fn harness() -> Harness {
        let applier = Arc::new(MemoryApplier::new());
        let store = Arc::new(MemoryDlqStore::new());
        let dispatcher = Arc::new(TaskDispatcher::new(
            applier.clone(),
            Arc::new(FailoverMarkerTracker::new([SHARD])),
            store.clone(),
            RetryPolicy::no_retry(),
            100,
        ));
        let manager = DlqManager::new(
            store.clone(),
            dispatcher.clone(),
            DlqConfig {
                default_page_size: 3,
                count_cache_ttl_ms: 1_000,
            },
        );
        Harness {
            applier,
            store,
            dispatcher,
            manager,
        }
    }

    fn key() -> DlqKey {
        DlqKey::new(DlqType::Replication, SHARD, "east")
    }

    async fn park(h: &Harness, ids: &[i64], run_id: &str) {
        for id in ids {
            h.store
                .put(&key(), DlqEntry::new(history_task(*id, run_id, 1), "failed", 0))
                .await
                .unwrap();
        }
    }

    fn read_request(end: Option<i64>, page: i32) -> ReadDlqMessagesRequest {
        ReadDlqMessagesRequest {
            inclusive_end_message_id: end,
            maximum_page_size: page,
            ..ReadDlqMessagesRequest::new(DlqType::Replication, SHARD, "east")
        }
    }

    fn ids(resp: &ReadDlqMessagesResponse) -> Vec<i64> {
        resp.replication_tasks.iter().map(|t| t.source_task_id).collect()
    }

    mod read {
        use super::*;

        #[tokio::test]
        async fn test_pages_until_token_absent() {
            let h = harness();
            park(&h, &[1, 2, 3, 4, 5], "r1").await;

            let first = h.manager.read(read_request(None, 2)).await.unwrap();
            assert_eq!(ids(&first), vec![1, 2]);
            assert_eq!(first.dlq_type, DlqType::Replication);
            assert_eq!(first.replication_tasks_info.len(), 2);
            assert_eq!(first.replication_tasks_info[1].task_id, 2);

            let mut request = read_request(None, 2);
            request.next_page_token = first.next_page_token.clone();
            let second = h.manager.read(request).await.unwrap();
            assert_eq!(ids(&second), vec![3, 4]);

            let mut request = read_request(None, 2);
            request.next_page_token = second.next_page_token.clone();
            let last = h.manager.read(request).await.unwrap();
            assert_eq!(ids(&last), vec![5]);
            assert!(last.next_page_token.is_none());
        }

        #[tokio::test]
        async fn test_inclusive_bound() {
            let h = harness();
            park(&h, &[1, 2, 3, 4, 5], "r1").await;
            let resp = h.manager.read(read_request(Some(3), 10)).await.unwrap();
            assert_eq!(ids(&resp), vec![1, 2, 3]);
            assert!(resp.next_page_token.is_none());
        }

        #[tokio::test]
        async fn test_zero_page_size_uses_default() {
            let h = harness();
            park(&h, &[1, 2, 3, 4, 5], "r1").await;
            let resp = h.manager.read(read_request(None, 0)).await.unwrap();
            assert_eq!(ids(&resp), vec![1, 2, 3]);
            assert!(resp.next_page_token.is_some());
        }

        #[tokio::test]
        async fn test_bound_matching_nothing_is_empty() {
            let h = harness();
            park(&h, &[10, 11], "r1").await;
            let resp = h.manager.read(read_request(Some(5), 10)).await.unwrap();
            assert!(resp.replication_tasks.is_empty());
            assert!(resp.next_page_token.is_none());
        }

        #[tokio::test]
        async fn test_garbage_token_is_bad_request() {
            let h = harness();
            let mut request = read_request(None, 2);
            request.next_page_token = Some(PageToken::from_bytes(vec![9]));
            assert!(matches!(
                h.manager.read(request).await.unwrap_err(),
                ReplError::BadRequest { .. }
            ));
        }

        #[tokio::test]
        async fn test_storage_error_is_retryable() {
            let h = harness();
            h.store.set_unavailable(true);
            let err = h.manager.read(read_request(None, 2)).await.unwrap_err();
            assert!(err.is_retryable());
        }
    }

    mod merge {
        use super::*;

        #[tokio::test]
        async fn test_merge_removes_applied_keeps_failed() {
            let h = harness();
            park(&h, &[1, 2], "good").await;
            park(&h, &[3], "bad").await;
            h.applier.fail_permanently("domain-a/wf-1/bad").await;

            let resp = h.manager.merge(read_request(Some(3), 10)).await.unwrap();
            assert!(resp.next_page_token.is_none());

            let after = h.manager.read(read_request(Some(3), 10)).await.unwrap();
            assert_eq!(ids(&after), vec![3]);
            assert_eq!(h.applier.applied_to("domain-a/wf-1/good").await.len(), 2);
            assert_eq!(h.manager.stats().merged, 2);
            assert_eq!(h.manager.stats().merge_failures, 1);
        }

        #[tokio::test]
        async fn test_merge_is_reinvocable() {
            let h = harness();
            park(&h, &[1], "bad").await;
            h.applier.fail_permanently("domain-a/wf-1/bad").await;
            h.manager.merge(read_request(None, 10)).await.unwrap();
            assert_eq!(ids(&h.manager.read(read_request(None, 10)).await.unwrap()), vec![1]);

            h.applier.clear_failures("domain-a/wf-1/bad").await;
            h.manager.merge(read_request(None, 10)).await.unwrap();
            assert!(h.manager.read(read_request(None, 10)).await.unwrap().replication_tasks.is_empty());
        }

        #[tokio::test]
        async fn test_merge_respects_version_ordering() {
            let h = harness();
            h.dispatcher
                .dispatch(SHARD, "east", &history_task(50, "r1", 9), DispatchOptions::default())
                .await
                .unwrap();
            park(&h, &[4], "r1").await;
            h.manager.merge(read_request(None, 10)).await.unwrap();
            assert!(h.manager.read(read_request(None, 10)).await.unwrap().replication_tasks.is_empty());
            assert_eq!(h.applier.applied_to("domain-a/wf-1/r1").await.len(), 1);
        }

        #[tokio::test]
        async fn test_merge_pages_with_token() {
            let h = harness();
            park(&h, &[1, 2, 3, 4], "r1").await;
            let first = h.manager.merge(read_request(None, 2)).await.unwrap();
            assert!(first.next_page_token.is_some());
            let mut request = read_request(None, 2);
            request.next_page_token = first.next_page_token;
            let second = h.manager.merge(request).await.unwrap();
            assert!(second.next_page_token.is_none());
            assert!(h.store.count_all().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_merge_does_not_park_again() {
            let h = harness();
            park(&h, &[1], "bad").await;
            h.applier.fail_permanently("domain-a/wf-1/bad").await;
            h.manager.merge(read_request(None, 10)).await.unwrap();
            assert_eq!(h.store.count_all().await.unwrap(), vec![(key(), 1)]);
            assert_eq!(h.dispatcher.stats().dead_lettered, 0);
        }
    }

    mod purge {
        use super::*;

        #[tokio::test]
        async fn test_purge_through_bound() {
            let h = harness();
            park(&h, &[1, 2, 3, 4], "r1").await;
            h.manager
                .purge(PurgeDlqMessagesRequest {
                    dlq_type: DlqType::Replication,
                    shard_id: SHARD,
                    source_cluster: "east".to_string(),
                    inclusive_end_message_id: Some(2),
                })
                .await
                .unwrap();
            assert_eq!(ids(&h.manager.read(read_request(None, 10)).await.unwrap()), vec![3, 4]);
            assert!(h.applier.applied().await.is_empty());
            assert_eq!(h.manager.stats().purged, 2);
        }

        #[tokio::test]
        async fn test_purge_empty_queue_is_ok() {
            let h = harness();
            let result = h
                .manager
                .purge(PurgeDlqMessagesRequest {
                    dlq_type: DlqType::Domain,
                    shard_id: SHARD,
                    source_cluster: "east".to_string(),
                    inclusive_end_message_id: None,
                })
                .await;
            assert!(result.is_ok());
        }
    }

    mod count {
        use super::*;

        fn purge_all() -> PurgeDlqMessagesRequest {
            PurgeDlqMessagesRequest {
                dlq_type: DlqType::Replication,
                shard_id: SHARD,
                source_cluster: "east".to_string(),
                inclusive_end_message_id: None,
            }
        }

        #[tokio::test]
        async fn test_counts_by_queue() {
            let h = harness();
            park(&h, &[1, 2], "r1").await;
            h.store
                .put(
                    &DlqKey::new(DlqType::Domain, ShardId::new(0), "east"),
                    DlqEntry::new(domain_task(1, "d1"), "failed", 0),
                )
                .await
                .unwrap();
            let counts = h.manager.count(true).await.unwrap();
            assert_eq!(counts.domain, 1);
            assert_eq!(
                counts.history[&HistoryDlqCountKey {
                    shard_id: SHARD,
                    source_cluster: "east".to_string()
                }],
                2
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_cached_until_forced() {
            let h = harness();
            park(&h, &[1, 2], "r1").await;
            let first = h.manager.count(false).await.unwrap();
            let second = h.manager.count(false).await.unwrap();
            assert_eq!(first, second);
            assert_eq!(h.store.count_scans(), 1);

            h.manager.purge(purge_all()).await.unwrap();
            assert_eq!(h.manager.count(false).await.unwrap(), first);
            let forced = h.manager.count(true).await.unwrap();
            assert!(forced.history.is_empty());
            assert_eq!(h.store.count_scans(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_cache_expires_after_ttl() {
            let h = harness();
            park(&h, &[1], "r1").await;
            h.manager.count(false).await.unwrap();
            h.manager.purge(purge_all()).await.unwrap();
            tokio::time::advance(Duration::from_millis(1_001)).await;
            assert!(h.manager.count(false).await.unwrap().history.is_empty());
        }
    }
}
