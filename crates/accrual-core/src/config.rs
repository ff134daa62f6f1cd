//! Detector configuration.
//!
//! Supplied once at construction and never re-read; the time unit in
//! particular must stay fixed for the lifetime of the process.

use crate::time::TimeUnit;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Smallest window that can hold the two intervals a variance needs.
pub const MIN_WINDOW_SIZE: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("window_size must be at least {MIN_WINDOW_SIZE}, got {0}")]
    WindowTooSmall(usize),
    #[error("sweep_interval_ms must be at least 1")]
    ZeroSweepInterval,
}

/// Sizing and timing for detectors, the registry and the sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Intervals retained per peer (default: 100)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Time between sweeps in milliseconds (default: 10s)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Minimum silence before a saturated peer is reaped, in milliseconds (default: 10s)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Unit for interval arithmetic (default: milliseconds)
    #[serde(default)]
    pub time_unit: TimeUnit,
}

fn default_window_size() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    10_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            time_unit: TimeUnit::default(),
        }
    }
}

impl DetectorConfig {
    /// Reject settings the detector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < MIN_WINDOW_SIZE {
            return Err(ConfigError::WindowTooSmall(self.window_size));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
