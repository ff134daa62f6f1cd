//! accrual-core: φ-accrual failure detection for heartbeat-monitored peers.
//!
//! This crate provides:
//! - Interval statistics over a bounded window (`IntervalEstimator`)
//! - The φ suspicion function and a per-peer `PhiAccrualDetector`
//! - A concurrent `PeerRegistry` with health queries and reaping
//! - A background `Sweeper` that reaps peers on a fixed period
//!
//! Transport is out of scope; callers stamp each heartbeat's arrival time
//! and hand it to [`PeerRegistry::ingest`].

pub mod config;
pub mod detector;
pub mod estimator;
pub mod events;
pub mod phi;
pub mod registry;
pub mod sweeper;
pub mod time;

pub use config::{ConfigError, DetectorConfig, MIN_WINDOW_SIZE};
pub use detector::{Detector, PhiAccrualDetector, Tags};
pub use estimator::IntervalEstimator;
pub use events::{EventBus, RegistryEvent, Subscription};
pub use registry::{IngestOutcome, PeerHealth, PeerRegistry, PeerStatus, RegistryError, SweepReport};
pub use sweeper::Sweeper;
pub use time::TimeUnit;
