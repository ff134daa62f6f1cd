//! Registry lifecycle events.
//!
//! Provides `RegistryEvent` for gauges/logs owned by collaborators and
//! `EventBus` for subscriptions. The registry emits after releasing its
//! locks, so callbacks may call back into the registry.

use crate::detector::Tags;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Observable peer lifecycle transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistryEvent {
    /// First heartbeat from a previously unseen peer.
    PeerRegistered {
        identity: String,
        tags: Tags,
    },
    /// Peer evicted by a sweep.
    PeerReaped {
        identity: String,
        tags: Tags,
        /// Last observed interval mean, in the configured unit.
        mean: f64,
        /// Last observed interval standard deviation, in the configured unit.
        stdev: f64,
        /// Silence at the time of the sweep, in milliseconds.
        #[serde(rename = "silentForMs")]
        silent_for_ms: u64,
    },
}

impl RegistryEvent {
    pub fn identity(&self) -> &str {
        match self {
            RegistryEvent::PeerRegistered { identity, .. } => identity,
            RegistryEvent::PeerReaped { identity, .. } => identity,
        }
    }
}

type Callback = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing registry events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&RegistryEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        let removed = {
            let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
            callbacks
                .iter()
                .position(|(i, _)| *i == id)
                .map(|index| callbacks.remove(index))
        };
        // Dropped after the lock: the callback may own another subscription.
        drop(removed);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &RegistryEvent) {
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
