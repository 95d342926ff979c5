//! The replication engine: supervises one processor per (source cluster, stream).
//!
//! Each source's processors share a cancellation token, so re-registering a
//! source stops and awaits its old processors before new ones start on the
//! same cursors.

use crate::client::ReplicationClient;
use crate::config::ReplConfig;
use crate::cursor::{CursorStore, ReplicationStream};
use crate::dispatcher::TaskDispatcher;
use crate::processor::{ProcessorState, ProcessorStats, ReplicationProcessor};
use crate::types::ShardId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// The replication engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine is idle and not running.
    Idle,
    /// Engine is actively running.
    Running,
    /// Engine is draining (waiting for processors to finish their round).
    Draining,
    /// Engine has stopped.
    Stopped,
}

/// Status of one processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    /// Cluster being pulled from.
    pub source_cluster: String,
    /// Stream being pulled.
    pub stream: ReplicationStream,
    /// Processor state.
    pub state: ProcessorState,
    /// Processor counters.
    pub stats: ProcessorStats,
}

/// Processors pulling from one source cluster.
struct SourceRun {
    cancel: CancellationToken,
    processors: Vec<Arc<ReplicationProcessor>>,
    handles: Vec<JoinHandle<()>>,
}

impl SourceRun {
    async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "replication processor task failed");
            }
        }
    }
}

/// The central replication engine.
pub struct ReplicationEngine {
    config: ReplConfig,
    dispatcher: Arc<TaskDispatcher>,
    cursors: Arc<dyn CursorStore>,
    sources: RwLock<HashMap<String, Arc<dyn ReplicationClient>>>,
    running: Mutex<HashMap<String, SourceRun>>,
    state: Mutex<EngineState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ReplicationEngine {
    /// Create a new replication engine.
    pub fn new(config: ReplConfig, dispatcher: Arc<TaskDispatcher>, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            config,
            dispatcher,
            cursors,
            sources: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            state: Mutex::new(EngineState::Idle),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Local shards, `0..shard_count`.
    pub fn shards(&self) -> Vec<ShardId> {
        (0..self.config.cluster.shard_count as i32)
            .map(ShardId::new)
            .collect()
    }

    /// The dispatcher every processor applies through.
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Register a source cluster. If the engine is running its processors
    /// start immediately; processors of a source registered under the same
    /// name are cancelled and awaited first.
    pub async fn add_source(&self, client: Arc<dyn ReplicationClient>) {
        let name = client.source_cluster().to_string();
        let state = self.state.lock().await;
        let replaced = self
            .sources
            .write()
            .await
            .insert(name.clone(), client.clone())
            .is_some();
        if *state == EngineState::Running {
            let previous = self.running.lock().await.remove(&name);
            if let Some(previous) = previous {
                previous.shutdown().await;
            }
            let run = self.spawn_source(client);
            self.running.lock().await.insert(name.clone(), run);
        }
        if replaced {
            info!(source_cluster = %name, "replaced replication source");
        }
    }

    /// Names of registered source clusters, sorted.
    pub async fn source_clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn spawn_source(&self, client: Arc<dyn ReplicationClient>) -> SourceRun {
        let streams = self
            .shards()
            .into_iter()
            .map(ReplicationStream::Shard)
            .chain(std::iter::once(ReplicationStream::Domain));
        let cancel = self.cancel.child_token();
        let mut run = SourceRun {
            cancel: cancel.clone(),
            processors: Vec::new(),
            handles: Vec::new(),
        };
        for stream in streams {
            let processor = Arc::new(ReplicationProcessor::new(
                self.config.cluster.local_cluster_name.clone(),
                stream,
                client.clone(),
                self.dispatcher.clone(),
                self.cursors.clone(),
                self.config.processor.clone(),
            ));
            run.handles
                .push(self.tasks.spawn(processor.clone().run(cancel.child_token())));
            run.processors.push(processor);
        }
        run
    }

    /// Start a processor for every registered source and stream.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if *state != EngineState::Idle {
            return;
        }
        let sources: Vec<_> = self.sources.read().await.values().cloned().collect();
        let mut running = self.running.lock().await;
        for client in sources {
            let name = client.source_cluster().to_string();
            running.insert(name, self.spawn_source(client));
        }
        *state = EngineState::Running;
        info!(
            cluster = %self.config.cluster.local_cluster_name,
            shards = self.config.cluster.shard_count,
            processors = running.values().map(|r| r.processors.len()).sum::<usize>(),
            "replication engine started"
        );
    }

    /// Cancel every processor and wait for them to exit.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if *state != EngineState::Running {
                *state = EngineState::Stopped;
                return;
            }
            *state = EngineState::Draining;
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        *self.state.lock().await = EngineState::Stopped;
        info!(cluster = %self.config.cluster.local_cluster_name, "replication engine stopped");
    }

    /// Get the current engine state.
    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Status of every processor, sorted by source cluster then stream.
    pub async fn stream_status(&self) -> Vec<StreamStatus> {
        let running = self.running.lock().await;
        let mut status: Vec<StreamStatus> = running
            .values()
            .flat_map(|r| r.processors.iter())
            .map(|p| StreamStatus {
                source_cluster: p.source_cluster().to_string(),
                stream: p.stream(),
                state: p.state(),
                stats: p.stats(),
            })
            .collect();
        status.sort_by(|a, b| (&a.source_cluster, a.stream).cmp(&(&b.source_cluster, b.stream)));
        status
    }
}
