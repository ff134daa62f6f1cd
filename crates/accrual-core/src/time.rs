//! Time-unit arithmetic for heartbeat intervals.
//!
//! Intervals are fed to the estimator as plain `f64` values in one unit chosen
//! at startup. Mixing units across peers is undefined, so the unit lives in the
//! registry configuration and never changes for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use web_time::Instant;

/// Unit used when converting elapsed time into interval samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    fn nanos_per_unit(self) -> f64 {
        match self {
            TimeUnit::Microseconds => 1_000.0,
            TimeUnit::Milliseconds => 1_000_000.0,
            TimeUnit::Seconds => 1_000_000_000.0,
        }
    }

    /// Convert a duration into this unit, keeping the fractional part.
    pub fn from_duration(self, duration: Duration) -> f64 {
        duration.as_nanos() as f64 / self.nanos_per_unit()
    }

    /// Signed elapsed time from `earlier` to `later`.
    ///
    /// Negative when `later` precedes `earlier` (clock skew, reordered
    /// arrivals). Never panics, unlike `Instant` subtraction.
    pub fn delta(self, earlier: Instant, later: Instant) -> f64 {
        match later.checked_duration_since(earlier) {
            Some(elapsed) => self.from_duration(elapsed),
            None => -self.from_duration(earlier.duration_since(later)),
        }
    }
}
