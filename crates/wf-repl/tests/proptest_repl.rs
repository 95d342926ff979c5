//! Property-based tests for wf-repl using proptest.
//!
//! Covers the wire enums, the source's page selection and retry backoff.

mod common;

use common::history;
use proptest::prelude::*;
use std::sync::Arc;
use wf_repl::config::SourceConfig;
use wf_repl::enums::{DlqType, DomainOperation, EncodingType, ReplicationTaskType};
use wf_repl::messages::{GetReplicationMessagesRequest, ReplicationToken};
use wf_repl::retry::RetryPolicy;
use wf_repl::source::ReplicationSource;
use wf_repl::task_store::MemoryTaskLog;
use wf_repl::types::ShardId;

fn any_task_type() -> impl Strategy<Value = ReplicationTaskType> {
    prop_oneof![(0i32..=6), any::<i32>()].prop_map(ReplicationTaskType::from)
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    /// Display then parse returns the same value, known or not.
    #[test]
    fn test_task_type_text_roundtrip(t in any_task_type()) {
        let parsed: ReplicationTaskType = t.to_string().parse().unwrap();
        prop_assert_eq!(parsed, t);
        let lower: ReplicationTaskType = t.to_string().to_lowercase().parse().unwrap();
        prop_assert_eq!(lower, t);
    }

    /// Codes survive serde unchanged, including ones this build does not know.
    #[test]
    fn test_unknown_codes_preserved(code in any::<i32>()) {
        let t = ReplicationTaskType::from(code);
        prop_assert_eq!(serde_json::to_string(&t).unwrap(), code.to_string());
        prop_assert_eq!(t.code(), code);
        prop_assert_eq!(DlqType::from(code).code(), code);
        prop_assert_eq!(DomainOperation::from(code).code(), code);
        prop_assert_eq!(EncodingType::from(code).code(), code);

        let dlq: DlqType = serde_json::from_str(&code.to_string()).unwrap();
        prop_assert_eq!(dlq, DlqType::from(code));
        let parsed: DomainOperation = DomainOperation::from(code).to_string().parse().unwrap();
        prop_assert_eq!(parsed, DomainOperation::from(code));
    }

    /// A page holds the first `page_size` ids strictly after the cursor, in
    /// order, and `has_more` is set exactly when ids remain beyond it.
    #[test]
    fn test_page_selection(
        ids in proptest::collection::btree_set(1i64..500, 0..40),
        cursor in 0i64..500,
        page_size in 1usize..10,
    ) {
        let shard = ShardId::new(0);
        let source = ReplicationSource::new(
            "east",
            Arc::new(MemoryTaskLog::new()),
            Arc::new(MemoryTaskLog::new()),
            SourceConfig { page_size, domain_page_size: page_size, max_read_ahead: 0 },
        );
        let response = block_on(async {
            for id in &ids {
                source.publish(shard, history(*id, "r0", 1)).await.unwrap();
            }
            source
                .get_replication_messages(GetReplicationMessagesRequest {
                    tokens: vec![ReplicationToken::new(shard, cursor, cursor)],
                    cluster_name: "west".to_string(),
                })
                .await
                .unwrap()
        });

        let page = &response.messages_by_shard[&shard];
        let after: Vec<i64> = ids.iter().copied().filter(|id| *id > cursor).collect();
        let expected: Vec<i64> = after.iter().copied().take(page_size).collect();
        let got: Vec<i64> = page.replication_tasks.iter().map(|t| t.source_task_id).collect();
        prop_assert_eq!(&got, &expected);
        prop_assert_eq!(page.has_more, after.len() > page_size);
        prop_assert!(page.is_ordered());
        let resume = expected.last().copied().unwrap_or(cursor);
        prop_assert_eq!(page.last_retrieved_message_id, resume);
    }

    /// Backoff never decreases and never exceeds the ceiling; jitter stays
    /// within half of the base delay.
    #[test]
    fn test_backoff_bounds(
        initial in 1u64..1000,
        max in 1u64..60_000,
        attempt in 1u32..40,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: initial,
            max_backoff_ms: max,
            jitter: true,
        };
        let base = policy.base_delay(attempt);
        prop_assert!(base <= policy.base_delay(attempt + 1));
        prop_assert!(base.as_millis() as u64 <= max);
        let jittered = policy.delay(attempt).as_millis() as u64;
        let base_ms = base.as_millis() as u64;
        prop_assert!(jittered >= base_ms / 2 && jittered <= base_ms);
    }
}

