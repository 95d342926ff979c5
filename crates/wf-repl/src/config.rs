//! Configuration for the replication subsystem, loadable from TOML or JSON.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which cluster we are and whom we replicate from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name of the local cluster.
    pub local_cluster_name: String,
    /// Number of shards; shard ids are `0..shard_count`.
    pub shard_count: u32,
    /// Clusters this cluster pulls replication tasks from.
    pub source_clusters: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_cluster_name: "local".to_string(),
            shard_count: 4,
            source_clusters: Vec::new(),
        }
    }
}

/// Serving-side paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Maximum tasks per shard page.
    pub page_size: usize,
    /// Maximum tasks per domain stream page.
    pub domain_page_size: usize,
    /// Refuse to hand out more tasks once a caller has this many retrieved
    /// but unprocessed. Zero disables the limit.
    pub max_read_ahead: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            domain_page_size: 100,
            max_read_ahead: 1_000,
        }
    }
}

/// Pulling-side loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Wait between polls when the source reported no more tasks.
    pub poll_interval_ms: u64,
    /// Deadline for a single fetch.
    pub fetch_timeout_ms: u64,
    /// Deadline for dispatching a single task, retries included.
    pub apply_timeout_ms: u64,
    /// Longest wait after repeated fetch failures.
    pub max_error_backoff_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            fetch_timeout_ms: 10_000,
            apply_timeout_ms: 30_000,
            max_error_backoff_ms: 30_000,
        }
    }
}

impl ProcessorConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How many recently applied identity keys are remembered for dedupe.
    pub dedupe_capacity: usize,
    /// How many runs keep their highest applied version; least recently
    /// touched runs are forgotten first.
    pub run_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedupe_capacity: 10_000,
            run_capacity: 100_000,
        }
    }
}

/// DLQ manager tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Page size used when a request asks for `<= 0`.
    pub default_page_size: usize,
    /// How long cached counts are served before a recount.
    pub count_cache_ttl_ms: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            count_cache_ttl_ms: 60_000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplConfig {
    /// Cluster identity.
    pub cluster: ClusterConfig,
    /// Source paging.
    pub source: SourceConfig,
    /// Processor timing.
    pub processor: ProcessorConfig,
    /// Retry of transient apply failures.
    pub retry: RetryPolicy,
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// DLQ tuning.
    pub dlq: DlqConfig,
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster.local_cluster_name.is_empty() {
            anyhow::bail!("cluster.local_cluster_name must not be empty");
        }
        if self.cluster.shard_count == 0 {
            anyhow::bail!("cluster.shard_count must be at least 1");
        }
        if self
            .cluster
            .source_clusters
            .contains(&self.cluster.local_cluster_name)
        {
            anyhow::bail!(
                "cluster {} cannot replicate from itself",
                self.cluster.local_cluster_name
            );
        }
        if self.source.page_size == 0 || self.source.domain_page_size == 0 {
            anyhow::bail!("source page sizes must be at least 1");
        }
        if self.source.max_read_ahead < 0 {
            anyhow::bail!("source.max_read_ahead must not be negative");
        }
        if self.processor.fetch_timeout_ms == 0 || self.processor.apply_timeout_ms == 0 {
            anyhow::bail!("processor timeouts must be at least 1ms");
        }
        if self.dispatcher.run_capacity == 0 {
            anyhow::bail!("dispatcher.run_capacity must be at least 1");
        }
        if self.dlq.default_page_size == 0 {
            anyhow::bail!("dlq.default_page_size must be at least 1");
        }
        Ok(())
    }
}
