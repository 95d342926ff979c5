//! Prometheus-compatible replication metrics.
//!
//! Exposes dispatcher, DLQ and per-stream processor counters in Prometheus
//! text exposition format.

use crate::dispatcher::DispatchStats;
use crate::dlq::DlqStats;
use crate::engine::StreamStatus;

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "wf_repl_tasks_applied_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a new gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&self.sample_line());
        output
    }

    fn sample_line(&self) -> String {
        if self.labels.is_empty() {
            format!("{} {}\n", self.name, self.format_value())
        } else {
            let label_str = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{}{{{}}} {}\n", self.name, label_str, self.format_value())
        }
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

/// Per-stream processor sample.
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    /// Cluster being pulled from.
    pub source_cluster: String,
    /// Stream label, "shard-N" or "domain".
    pub stream: String,
    /// Completed rounds.
    pub rounds: u64,
    /// Tasks dispatched.
    pub tasks_processed: u64,
    /// Failed fetches.
    pub fetch_errors: u64,
    /// Aborted apply phases.
    pub apply_errors: u64,
    /// Last persisted cursor position.
    pub last_processed_message_id: i64,
}

/// Snapshot of all replication metrics for one cluster.
#[derive(Debug, Clone, Default)]
pub struct ReplMetrics {
    /// Local cluster name.
    pub cluster: String,
    /// Tasks written to local state.
    pub tasks_applied: u64,
    /// Redeliveries suppressed.
    pub tasks_duplicate: u64,
    /// Tasks dropped for an older version.
    pub tasks_version_stale: u64,
    /// Failover markers recorded.
    pub markers_recorded: u64,
    /// Tasks parked in the DLQ.
    pub tasks_dead_lettered: u64,
    /// Entries merged back out of the DLQ.
    pub dlq_merged: u64,
    /// Entries merge could not apply.
    pub dlq_merge_failures: u64,
    /// Entries purged from the DLQ.
    pub dlq_purged: u64,
    /// Failover markers waiting on shards.
    pub pending_failovers: u64,
    /// Whether the engine is running (1.0) or not (0.0).
    pub engine_running: f64,
    /// Processor samples.
    pub streams: Vec<StreamMetrics>,
}

impl ReplMetrics {
    /// Metrics for `cluster` with every counter at zero.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            ..Default::default()
        }
    }

    /// Update metrics from a dispatcher snapshot.
    pub fn update_from_dispatch(&mut self, stats: &DispatchStats) {
        self.tasks_applied = stats.applied;
        self.tasks_duplicate = stats.duplicates;
        self.tasks_version_stale = stats.version_stale;
        self.markers_recorded = stats.markers_recorded;
        self.tasks_dead_lettered = stats.dead_lettered;
    }

    /// Update metrics from a DLQ manager snapshot.
    pub fn update_from_dlq(&mut self, stats: &DlqStats) {
        self.dlq_merged = stats.merged;
        self.dlq_merge_failures = stats.merge_failures;
        self.dlq_purged = stats.purged;
    }

    /// Replace the processor samples.
    pub fn update_from_streams(&mut self, status: &[StreamStatus]) {
        self.streams = status
            .iter()
            .map(|s| StreamMetrics {
                source_cluster: s.source_cluster.clone(),
                stream: s.stream.to_string(),
                rounds: s.stats.rounds,
                tasks_processed: s.stats.tasks_processed,
                fetch_errors: s.stats.fetch_errors,
                apply_errors: s.stats.apply_errors,
                last_processed_message_id: s.stats.last_processed_message_id,
            })
            .collect();
    }

    /// Produce the full list of Prometheus metrics.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let labels = vec![("cluster".to_string(), self.cluster.clone())];

        let mut metrics = vec![
            Metric::counter(
                "wf_repl_tasks_applied_total",
                "Replication tasks written to local state",
                labels.clone(),
                self.tasks_applied as f64,
            ),
            Metric::counter(
                "wf_repl_tasks_duplicate_total",
                "Redelivered replication tasks suppressed",
                labels.clone(),
                self.tasks_duplicate as f64,
            ),
            Metric::counter(
                "wf_repl_tasks_version_stale_total",
                "Replication tasks dropped for carrying an older version",
                labels.clone(),
                self.tasks_version_stale as f64,
            ),
            Metric::counter(
                "wf_repl_markers_recorded_total",
                "Failover markers recorded",
                labels.clone(),
                self.markers_recorded as f64,
            ),
            Metric::counter(
                "wf_repl_tasks_dead_lettered_total",
                "Replication tasks parked in the DLQ",
                labels.clone(),
                self.tasks_dead_lettered as f64,
            ),
            Metric::counter(
                "wf_repl_dlq_merged_total",
                "DLQ entries re-applied and removed",
                labels.clone(),
                self.dlq_merged as f64,
            ),
            Metric::counter(
                "wf_repl_dlq_merge_failures_total",
                "DLQ entries that failed to re-apply",
                labels.clone(),
                self.dlq_merge_failures as f64,
            ),
            Metric::counter(
                "wf_repl_dlq_purged_total",
                "DLQ entries purged",
                labels.clone(),
                self.dlq_purged as f64,
            ),
            Metric::gauge(
                "wf_repl_pending_failovers",
                "Failover markers not yet seen by every shard",
                labels.clone(),
                self.pending_failovers as f64,
            ),
            Metric::gauge(
                "wf_repl_engine_running",
                "Whether the replication engine is running (1.0) or not (0.0)",
                labels,
                self.engine_running,
            ),
        ];

        let stream_labels = |s: &StreamMetrics| {
            vec![
                ("cluster".to_string(), self.cluster.clone()),
                ("source_cluster".to_string(), s.source_cluster.clone()),
                ("stream".to_string(), s.stream.clone()),
            ]
        };
        metrics.extend(self.streams.iter().map(|s| {
            Metric::counter(
                "wf_repl_stream_rounds_total",
                "Completed fetch/apply rounds",
                stream_labels(s),
                s.rounds as f64,
            )
        }));
        metrics.extend(self.streams.iter().map(|s| {
            Metric::counter(
                "wf_repl_stream_tasks_total",
                "Tasks dispatched by the stream processor",
                stream_labels(s),
                s.tasks_processed as f64,
            )
        }));
        metrics.extend(self.streams.iter().map(|s| {
            Metric::counter(
                "wf_repl_stream_errors_total",
                "Failed fetch or apply phases",
                stream_labels(s),
                (s.fetch_errors + s.apply_errors) as f64,
            )
        }));
        metrics.extend(self.streams.iter().map(|s| {
            Metric::gauge(
                "wf_repl_stream_last_processed_id",
                "Last persisted cursor position",
                stream_labels(s),
                s.last_processed_message_id as f64,
            )
        }));
        metrics
    }

    /// Format all metrics as Prometheus text exposition format.
    ///
    /// Samples sharing a name are grouped under one HELP/TYPE header.
    pub fn format_prometheus(&self) -> String {
        let mut output = String::new();
        let mut last_name: Option<String> = None;
        for m in self.to_metrics() {
            if last_name.as_deref() == Some(m.name.as_str()) {
                output.push_str(&m.sample_line());
            } else {
                output.push_str(&m.format());
                last_name = Some(m.name.clone());
            }
        }
        output
    }

    /// Share of resolved tasks that ended in the DLQ, or 0.0 if none.
    pub fn dead_letter_rate(&self) -> f64 {
        let total = self.tasks_applied + self.tasks_dead_lettered;
        if total == 0 {
            return 0.0;
        }
        self.tasks_dead_lettered as f64 / total as f64
    }
}
