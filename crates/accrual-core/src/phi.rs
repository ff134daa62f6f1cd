//! The φ (suspicion) function.
//!
//! φ = -log10(1 - F(delta)), where F is the normal CDF fitted to the observed
//! heartbeat intervals. It is a pure function of `(mean, stdev, delta)`; the
//! detector only supplies those three numbers.
//!
//! Non-finite results are part of the contract:
//!
//! | condition                         | φ      |
//! |-----------------------------------|--------|
//! | `stdev` is `NaN` (no samples)     | `NaN`  |
//! | `stdev == 0`, `delta == mean`     | `NaN`  |
//! | `stdev == 0`, `delta != mean`     | `+Inf` |
//! | F rounds to exactly `1.0`         | `+Inf` |
//!
//! The last row is what eventually evicts a silent peer: once `delta` sits
//! roughly 8 or more standard deviations past the mean, `1 + erf(x)` rounds to
//! `2.0` and φ saturates.

use std::f64::consts::SQRT_2;

/// Probability that the next heartbeat would have arrived by `delta`.
pub fn normal_cdf(delta: f64, mean: f64, stdev: f64) -> f64 {
    0.5 * (1.0 + libm::erf((delta - mean) / (stdev * SQRT_2)))
}

/// Suspicion level for a peer silent for `delta` units.
pub fn phi(mean: f64, stdev: f64, delta: f64) -> f64 {
    if mean.is_nan() || stdev.is_nan() || delta.is_nan() {
        return f64::NAN;
    }
    if stdev == 0.0 {
        // All probability mass sits on `mean`.
        return if delta == mean { f64::NAN } else { f64::INFINITY };
    }
    -(1.0 - normal_cdf(delta, mean, stdev)).log10()
}
