//! Background sweep task.
//!
//! Calls [`PeerRegistry::sweep`] on a fixed period until stopped. A failing
//! cycle is logged and the loop keeps going; ingestion and queries are never
//! blocked for longer than one sweep holds the registry write lock.

use crate::registry::PeerRegistry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info};
use web_time::Instant;

/// Handle to a running sweep task.
///
/// Dropping the handle without calling [`stop`](Self::stop) also ends the
/// task, but without waiting for it.
pub struct Sweeper {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current Tokio runtime.
    ///
    /// The first sweep runs one `period` after start. Must be called from
    /// within a runtime.
    pub fn start(registry: Arc<PeerRegistry>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_sweep_loop(registry, period, shutdown_rx));
        Self { shutdown_tx, handle }
    }

    /// Stop the loop, letting an in-progress sweep finish first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }
}

async fn run_sweep_loop(
    registry: Arc<PeerRegistry>,
    period: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        period_ms = period.as_millis() as u64,
        grace_ms = registry.grace_window().as_millis() as u64,
        "sweeper started"
    );

    loop {
        tokio::select! {
            // Fires on stop() and when the handle is dropped.
            _ = &mut shutdown_rx => {
                info!("sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                run_sweep_cycle(&registry);
            }
        }
    }
}

fn run_sweep_cycle(registry: &PeerRegistry) {
    let grace_window = registry.grace_window();
    let result = catch_unwind(AssertUnwindSafe(|| {
        registry.sweep(Instant::now(), grace_window)
    }));

    match result {
        Ok(report) => {
            debug!(
                evaluated = report.evaluated,
                reaped = report.reaped.len(),
                active = registry.len(),
                reaped_total = registry.reaped_total(),
                "sweep cycle finished"
            );
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Sweep cycle failed: {}", message);
        }
    }
}
