//! Failover marker tracking.
//!
//! When a domain fails over, the old active cluster writes a failover marker
//! into every shard's stream. A destination may only treat the failover as
//! globally visible once every shard it tracks has delivered the marker, since
//! only then have all writes from before the failover been received.
//!
//! Idle shards are accounted for through heartbeats, but only heartbeats from
//! the cluster that emitted the marker count: an idle stream from some other
//! source says nothing about whether the emitting cluster's marker arrived.

use crate::task::{FailoverMarkerAttributes, FailoverMarkers};
use crate::types::ShardId;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a domain's most recent failover stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// No marker has been seen for the domain.
    Untracked,
    /// Some tracked shards have not observed the marker yet.
    Pending {
        /// Version of the marker being awaited.
        failover_version: i64,
        /// Shards that observed it.
        observed: usize,
        /// Shards that must observe it.
        expected: usize,
    },
    /// Every tracked shard observed the marker.
    Completed {
        /// Version of the completed marker.
        failover_version: i64,
    },
}

impl MarkerStatus {
    /// Returns true once the marker is globally visible.
    pub fn is_completed(&self) -> bool {
        matches!(self, MarkerStatus::Completed { .. })
    }
}

#[derive(Debug)]
struct DomainMarker {
    marker: FailoverMarkerAttributes,
    source_cluster: String,
    observed: BTreeSet<ShardId>,
    completed: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    domains: HashMap<String, DomainMarker>,
    newly_completed: Vec<FailoverMarkerAttributes>,
}

/// Tracks, per domain, which shards observed the current failover marker.
#[derive(Debug)]
pub struct FailoverMarkerTracker {
    shards: BTreeSet<ShardId>,
    state: Mutex<TrackerState>,
}

impl FailoverMarkerTracker {
    /// Track markers across the given shards.
    pub fn new(shards: impl IntoIterator<Item = ShardId>) -> Self {
        Self {
            shards: shards.into_iter().collect(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Shards that must observe a marker before it completes.
    pub fn tracked_shards(&self) -> &BTreeSet<ShardId> {
        &self.shards
    }

    /// Record that `shard_id` of `source_cluster` delivered a marker.
    ///
    /// A higher failover version than the one being tracked restarts tracking
    /// for the domain under the new marker's cluster; a lower one is stale and
    /// ignored.
    pub async fn record(
        &self,
        source_cluster: &str,
        shard_id: ShardId,
        marker: &FailoverMarkerAttributes,
    ) -> MarkerStatus {
        let mut state = self.state.lock().await;
        self.record_locked(&mut state, source_cluster, shard_id, marker)
    }

    /// Record every marker of a batch delivered by one shard.
    pub async fn record_batch(
        &self,
        source_cluster: &str,
        shard_id: ShardId,
        markers: &FailoverMarkers,
    ) -> Vec<MarkerStatus> {
        let mut state = self.state.lock().await;
        markers
            .failover_markers
            .iter()
            .map(|m| self.record_locked(&mut state, source_cluster, shard_id, m))
            .collect()
    }

    fn record_locked(
        &self,
        state: &mut TrackerState,
        source_cluster: &str,
        shard_id: ShardId,
        marker: &FailoverMarkerAttributes,
    ) -> MarkerStatus {
        if !self.shards.contains(&shard_id) {
            warn!(shard_id = %shard_id, domain_id = %marker.domain_id, "marker from untracked shard");
            return self.status_locked(state, &marker.domain_id);
        }
        let entry = state
            .domains
            .entry(marker.domain_id.clone())
            .or_insert_with(|| DomainMarker {
                marker: marker.clone(),
                source_cluster: source_cluster.to_string(),
                observed: BTreeSet::new(),
                completed: false,
            });
        if marker.failover_version < entry.marker.failover_version {
            debug!(
                domain_id = %marker.domain_id,
                stale = marker.failover_version,
                current = entry.marker.failover_version,
                "ignoring stale failover marker"
            );
            return self.status_locked(state, &marker.domain_id);
        }
        if marker.failover_version > entry.marker.failover_version {
            info!(
                domain_id = %marker.domain_id,
                previous = entry.marker.failover_version,
                failover_version = marker.failover_version,
                "newer failover marker, restarting tracking"
            );
            *entry = DomainMarker {
                marker: marker.clone(),
                source_cluster: source_cluster.to_string(),
                observed: BTreeSet::new(),
                completed: false,
            };
        }
        entry.observed.insert(shard_id);
        self.complete_if_ready(state, &marker.domain_id);
        self.status_locked(state, &marker.domain_id)
    }

    /// Treat a heartbeat from an idle shard of `source_cluster` as
    /// observation of every pending marker that cluster emitted at or before
    /// `timestamp`.
    ///
    /// Callers must only pass heartbeats from shards with no unapplied tasks,
    /// otherwise a marker still sitting in the backlog would be skipped.
    /// Markers without a creation time are never satisfied this way.
    pub async fn record_shard_status(
        &self,
        source_cluster: &str,
        shard_id: ShardId,
        timestamp: i64,
    ) -> Vec<String> {
        if !self.shards.contains(&shard_id) {
            return Vec::new();
        }
        let mut state = self.state.lock().await;
        let satisfied: Vec<String> = state
            .domains
            .iter_mut()
            .filter(|(_, d)| !d.completed && d.source_cluster == source_cluster)
            .filter(|(_, d)| matches!(d.marker.creation_time, Some(t) if t <= timestamp))
            .filter_map(|(domain_id, d)| d.observed.insert(shard_id).then(|| domain_id.clone()))
            .collect();
        let mut completed = Vec::new();
        for domain_id in &satisfied {
            if self.complete_if_ready(&mut state, domain_id) {
                completed.push(domain_id.clone());
            }
        }
        completed
    }

    fn complete_if_ready(&self, state: &mut TrackerState, domain_id: &str) -> bool {
        let Some(entry) = state.domains.get_mut(domain_id) else {
            return false;
        };
        if entry.completed || !self.shards.is_subset(&entry.observed) {
            return false;
        }
        entry.completed = true;
        info!(
            domain_id = %domain_id,
            failover_version = entry.marker.failover_version,
            shards = self.shards.len(),
            "failover marker observed by all shards"
        );
        let marker = entry.marker.clone();
        state.newly_completed.push(marker);
        true
    }

    /// Status of a domain's most recent marker.
    pub async fn status(&self, domain_id: &str) -> MarkerStatus {
        let state = self.state.lock().await;
        self.status_locked(&state, domain_id)
    }

    fn status_locked(&self, state: &TrackerState, domain_id: &str) -> MarkerStatus {
        match state.domains.get(domain_id) {
            None => MarkerStatus::Untracked,
            Some(d) if d.completed => MarkerStatus::Completed {
                failover_version: d.marker.failover_version,
            },
            Some(d) => MarkerStatus::Pending {
                failover_version: d.marker.failover_version,
                observed: d.observed.intersection(&self.shards).count(),
                expected: self.shards.len(),
            },
        }
    }

    /// Domains with a marker still awaiting some shards, sorted.
    pub async fn pending_domains(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut pending: Vec<String> = state
            .domains
            .iter()
            .filter(|(_, d)| !d.completed)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Drain markers that completed since the last call.
    pub async fn take_completed(&self) -> Vec<FailoverMarkerAttributes> {
        std::mem::take(&mut self.state.lock().await.newly_completed)
    }
}
