//! Peer registry for tracking heartbeat-monitored peers.
//!
//! Provides `PeerRegistry`, the concurrent map from peer identity to its
//! exclusively-owned [`PhiAccrualDetector`]. Three kinds of callers share it:
//! - Ingestion (many tasks): `ingest` creates or updates a detector
//! - Health queries: `suspicion_of` / `healthy_peers` read without mutating
//! - The sweeper (one task): `sweep` reaps saturated, silent peers
//!
//! Locking: the map sits behind a `RwLock`; every detector has its own
//! `Mutex`. Heartbeats for distinct peers only share the map read lock, so
//! they proceed in parallel. Structural changes (first heartbeat, reap) take
//! the write lock. Detectors never leave the registry, so a reaped peer cannot
//! be updated through a stale handle.

use crate::config::{DetectorConfig, MIN_WINDOW_SIZE};
use crate::detector::{Detector, PhiAccrualDetector, Tags};
use crate::events::{EventBus, RegistryEvent};
use crate::time::TimeUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};
use web_time::Instant;

/// Errors that can occur during registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer identity cannot be empty")]
    EmptyIdentity,
}

/// What `ingest` did with a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First heartbeat from this identity; a detector was created.
    Registered,
    /// Heartbeat recorded on an existing detector.
    Recorded,
}

/// A peer that passed a health query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerHealth {
    pub identity: String,
    pub suspicion: f64,
}

/// Point-in-time view of one detector, for gauges and debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub identity: String,
    pub tags: Tags,
    pub mean: f64,
    pub stdev: f64,
    pub samples: usize,
    pub suspicion: f64,
}

/// Result of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers inspected.
    pub evaluated: usize,
    /// Identities removed, in removal order.
    pub reaped: Vec<String>,
}

/// Registry for tracking heartbeat-monitored peers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` for shared ownership.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Mutex<PhiAccrualDetector>>>,
    window_size: usize,
    time_unit: TimeUnit,
    grace_window: Duration,
    events: Arc<EventBus>,
    reaped_total: AtomicU64,
}

fn lock(detector: &Mutex<PhiAccrualDetector>) -> MutexGuard<'_, PhiAccrualDetector> {
    detector.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reap condition: saturated suspicion and silence strictly past the grace window.
fn is_reapable(detector: &PhiAccrualDetector, now: Instant, grace_window: Duration) -> bool {
    let silent_past_grace = now
        .checked_duration_since(detector.last_arrival())
        .is_some_and(|silence| silence > grace_window);
    silent_past_grace && detector.suspicion(now) == f64::INFINITY
}

impl PeerRegistry {
    /// Create a registry sized by `config`.
    ///
    /// `config` is expected to have passed [`DetectorConfig::validate`]. A
    /// window below [`MIN_WINDOW_SIZE`] is raised to it, otherwise no peer
    /// could ever reach a finite suspicion and none would be reaped.
    pub fn new(config: &DetectorConfig) -> Self {
        Self::with_event_bus(config, Arc::new(EventBus::new()))
    }

    /// Create a registry that publishes lifecycle events on `events`.
    pub fn with_event_bus(config: &DetectorConfig, events: Arc<EventBus>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            window_size: config.window_size.max(MIN_WINDOW_SIZE),
            time_unit: config.time_unit,
            grace_window: config.grace_period(),
            events,
            reaped_total: AtomicU64::new(0),
        }
    }

    /// Bus carrying `PeerRegistered` / `PeerReaped` events.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Configured silence required before a saturated peer is reaped.
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Record a heartbeat from `identity`, creating its detector on first sight.
    ///
    /// `tags` are only used when the detector is created. Arrivals earlier
    /// than the previous one are recorded as negative intervals.
    pub fn ingest(
        &self,
        identity: &str,
        arrival: Instant,
        tags: Tags,
    ) -> Result<IngestOutcome, RegistryError> {
        if identity.is_empty() {
            return Err(RegistryError::EmptyIdentity);
        }

        // Fast path: known peer, shared map lock plus this peer's lock only.
        {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(detector) = peers.get(identity) {
                lock(detector).record(arrival);
                return Ok(IngestOutcome::Recorded);
            }
        }

        let (outcome, active) = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let outcome = match peers.entry(identity.to_string()) {
                // Another task registered it between our two lock acquisitions.
                Entry::Occupied(entry) => {
                    lock(entry.get()).record(arrival);
                    IngestOutcome::Recorded
                }
                Entry::Vacant(entry) => {
                    entry.insert(Mutex::new(PhiAccrualDetector::new(
                        self.window_size,
                        self.time_unit,
                        arrival,
                        tags.clone(),
                    )));
                    IngestOutcome::Registered
                }
            };
            (outcome, peers.len())
        };

        if outcome == IngestOutcome::Registered {
            info!(identity, active_peers = active, "registered new peer");
            self.events.emit(&RegistryEvent::PeerRegistered {
                identity: identity.to_string(),
                tags,
            });
        }
        Ok(outcome)
    }

    /// Current suspicion of `identity`, or `None` if the registry does not know it.
    ///
    /// `Some(NaN)` means the peer is known but has too few samples.
    pub fn suspicion_of(&self, identity: &str, at: Instant) -> Option<f64> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(identity).map(|detector| lock(detector).suspicion(at))
    }

    /// Up to `limit` peers with suspicion strictly below `threshold`.
    ///
    /// Iteration follows map order; callers needing a priority order sort the
    /// result themselves. Peers with `NaN` suspicion never qualify.
    pub fn healthy_peers(&self, at: Instant, threshold: f64, limit: usize) -> Vec<PeerHealth> {
        self.healthy_peers_where(at, threshold, limit, |_, _| true)
    }

    /// Like [`healthy_peers`](Self::healthy_peers), restricted to peers for
    /// which `filter(identity, tags)` holds.
    ///
    /// The registry stays label-agnostic: the caller owns the predicate, and
    /// `limit` counts only peers that passed it.
    pub fn healthy_peers_where<F>(
        &self,
        at: Instant,
        threshold: f64,
        limit: usize,
        filter: F,
    ) -> Vec<PeerHealth>
    where
        F: Fn(&str, &Tags) -> bool,
    {
        let mut healthy = Vec::new();
        if limit == 0 {
            return healthy;
        }

        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        for (identity, detector) in peers.iter() {
            let detector = lock(detector);
            if !filter(identity, detector.tags()) {
                continue;
            }
            let suspicion = detector.suspicion(at);
            if suspicion < threshold {
                healthy.push(PeerHealth {
                    identity: identity.clone(),
                    suspicion,
                });
                if healthy.len() >= limit {
                    break;
                }
            }
        }
        healthy
    }

    /// Reap every peer whose suspicion is `+Inf` at `now` and whose last
    /// heartbeat is more than `grace_window` old.
    ///
    /// Candidates are chosen under the read lock and re-checked under the
    /// write lock, so a heartbeat that lands mid-sweep keeps its peer.
    pub fn sweep(&self, now: Instant, grace_window: Duration) -> SweepReport {
        let (evaluated, candidates) = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            let mut candidates = Vec::new();
            for (identity, detector) in peers.iter() {
                let detector = lock(detector);
                trace!(
                    identity = identity.as_str(),
                    suspicion = detector.suspicion(now),
                    "sweep evaluated peer"
                );
                if is_reapable(&detector, now, grace_window) {
                    candidates.push(identity.clone());
                }
            }
            (peers.len(), candidates)
        };

        let mut report = SweepReport {
            evaluated,
            reaped: Vec::new(),
        };
        if candidates.is_empty() {
            debug!(evaluated, "sweep complete, nothing to reap");
            return report;
        }

        let mut events = Vec::with_capacity(candidates.len());
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            for identity in candidates {
                let still_reapable = peers
                    .get(&identity)
                    .is_some_and(|detector| is_reapable(&lock(detector), now, grace_window));
                if !still_reapable {
                    continue;
                }
                if let Some(detector) = peers.remove(&identity) {
                    let detector = detector.into_inner().unwrap_or_else(|e| e.into_inner());
                    let (mean, stdev) = detector.moments();
                    let silent_for = now
                        .checked_duration_since(detector.last_arrival())
                        .unwrap_or_default();
                    events.push(RegistryEvent::PeerReaped {
                        identity: identity.clone(),
                        tags: detector.tags().clone(),
                        mean,
                        stdev,
                        silent_for_ms: silent_for.as_millis() as u64,
                    });
                    report.reaped.push(identity);
                }
            }
        }

        self.reaped_total
            .fetch_add(report.reaped.len() as u64, Ordering::Relaxed);
        for event in &events {
            if let RegistryEvent::PeerReaped {
                identity,
                mean,
                stdev,
                silent_for_ms,
                ..
            } = event
            {
                info!(
                    identity = identity.as_str(),
                    mean,
                    stdev,
                    silent_for_ms,
                    "no heartbeat within saturation and grace window, reaped peer"
                );
            }
            self.events.emit(event);
        }
        debug!(evaluated, reaped = report.reaped.len(), "sweep complete");
        report
    }

    /// Number of active peers.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(identity)
    }

    /// Peers reaped since the registry was created.
    pub fn reaped_total(&self) -> u64 {
        self.reaped_total.load(Ordering::Relaxed)
    }

    /// Per-peer statistics and suspicion at `at`.
    pub fn snapshot(&self, at: Instant) -> Vec<PeerStatus> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .iter()
            .map(|(identity, detector)| {
                let detector = lock(detector);
                let (mean, stdev) = detector.moments();
                PeerStatus {
                    identity: identity.clone(),
                    tags: detector.tags().clone(),
                    mean,
                    stdev,
                    samples: detector.samples(),
                    suspicion: detector.suspicion(at),
                }
            })
            .collect()
    }
}
