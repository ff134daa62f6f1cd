//! Per-peer accrual failure detection.
//!
//! A [`PhiAccrualDetector`] turns a stream of heartbeat arrival times into a
//! continuous suspicion level:
//! 1. Each arrival records the interval since the previous one
//! 2. The intervals are summarised as a normal distribution (mean, stdev)
//! 3. At query time, φ measures how unlikely the current silence is
//!
//! The detector never decides that a peer is dead; [`PeerRegistry`] does
//! that from φ plus a grace window.
//!
//! [`PeerRegistry`]: crate::PeerRegistry

use crate::estimator::IntervalEstimator;
use crate::phi::phi;
use crate::time::TimeUnit;
use std::collections::HashMap;
use web_time::Instant;

/// Opaque key/value metadata carried alongside a detector.
pub type Tags = HashMap<String, String>;

/// Anything that resolves a point in time to a suspicion level.
///
/// Only [`PhiAccrualDetector`] implements this today.
pub trait Detector {
    /// Suspicion that the peer has failed, as seen at `at`. Read-only.
    fn suspicion(&self, at: Instant) -> f64;
}

/// φ-accrual detector for a single peer.
#[derive(Debug, Clone)]
pub struct PhiAccrualDetector {
    estimator: IntervalEstimator,
    last_arrival: Instant,
    time_unit: TimeUnit,
    tags: Tags,
}

impl PhiAccrualDetector {
    /// Create a detector for a peer whose first heartbeat arrived at `first_arrival`.
    pub fn new(window_size: usize, time_unit: TimeUnit, first_arrival: Instant, tags: Tags) -> Self {
        Self {
            estimator: IntervalEstimator::new(window_size),
            last_arrival: first_arrival,
            time_unit,
            tags,
        }
    }

    /// Record a heartbeat that arrived at `arrival`.
    ///
    /// Out-of-order arrivals produce a negative interval, which is recorded
    /// as-is and moves `last_arrival` backwards.
    pub fn record(&mut self, arrival: Instant) {
        let interval = self.time_unit.delta(self.last_arrival, arrival);
        self.estimator.record(interval);
        self.last_arrival = arrival;
    }

    /// Mean and standard deviation of the recorded intervals.
    pub fn moments(&self) -> (f64, f64) {
        self.estimator.moments()
    }

    /// Number of intervals contributing to the estimate.
    pub fn samples(&self) -> usize {
        self.estimator.len()
    }

    pub fn last_arrival(&self) -> Instant {
        self.last_arrival
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Silence since the last heartbeat, in the configured unit.
    pub fn silence(&self, at: Instant) -> f64 {
        self.time_unit.delta(self.last_arrival, at)
    }

    #[cfg(test)]
    pub(crate) fn with_estimator(estimator: IntervalEstimator, last_arrival: Instant) -> Self {
        Self {
            estimator,
            last_arrival,
            time_unit: TimeUnit::Milliseconds,
            tags: Tags::new(),
        }
    }
}

impl Detector for PhiAccrualDetector {
    fn suspicion(&self, at: Instant) -> f64 {
        // A single interval has no spread to speak of.
        if self.estimator.len() < 2 {
            return f64::NAN;
        }
        let (mean, stdev) = self.estimator.moments();
        phi(mean, stdev, self.silence(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOLERANCE: f64 = 1e-4;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn assert_phi(expected: f64, actual: f64) {
        assert!(
            (expected - actual).abs() < TOLERANCE,
            "expected φ ≈ {expected}, got {actual}"
        );
    }

    /// Detector fed alternating 90/110 ms intervals: mean 100, stdev 10.
    fn steady_detector(start: Instant, beats: usize) -> (PhiAccrualDetector, Instant) {
        let mut detector = PhiAccrualDetector::new(1000, TimeUnit::Milliseconds, start, Tags::new());
        let mut t = start;
        for i in 0..beats {
            t += if i % 2 == 0 { ms(90) } else { ms(110) };
            detector.record(t);
        }
        (detector, t)
    }

    fn fixture(sum: f64, sum_of_squares: f64, recorded: u64) -> (PhiAccrualDetector, Instant) {
        let last = Instant::now();
        let estimator = IntervalEstimator::from_totals(1000, sum, sum_of_squares, recorded);
        (PhiAccrualDetector::with_estimator(estimator, last), last)
    }

    // ==================== Reference fixtures ====================

    #[test]
    fn test_fixture_at_expectation() {
        let (detector, last) = fixture(100_000.0, 1.04e7, 1000);
        assert_phi(0.3010299956639812, detector.suspicion(last + ms(100)));
    }

    #[test]
    fn test_fixture_after_expectation() {
        let (detector, last) = fixture(100_000.0, 1.04e7, 1000);
        assert_phi(0.3965376860943206, detector.suspicion(last + ms(105)));
    }

    #[test]
    fn test_fixture_huge_variance_at_expectation() {
        let (detector, last) = fixture(100_000.0, 2.0e7, 1000);
        assert_phi(0.3010299956639812, detector.suspicion(last + ms(100)));
    }

    #[test]
    fn test_fixture_low_variance() {
        let (detector, last) = fixture(100_000.0, 1.0001e7, 1000);
        assert_phi(6.54264567249168, detector.suspicion(last + ms(105)));
    }

    #[test]
    fn test_fixture_no_variance() {
        let (detector, last) = fixture(100_000.0, 1.0e7, 1000);
        assert_eq!(detector.suspicion(last + ms(105)), f64::INFINITY);
    }

    #[test]
    fn test_fixture_two_samples() {
        let (detector, last) = fixture(98.8 + 100.1, 98.8 * 98.8 + 100.1 * 100.1, 2);
        assert_phi(0.7017290002925862, detector.suspicion(last + ms(100)));
    }

    // ==================== Insufficient data ====================

    #[test]
    fn test_no_samples_is_nan() {
        let start = Instant::now();
        let detector = PhiAccrualDetector::new(10, TimeUnit::Milliseconds, start, Tags::new());
        assert!(detector.suspicion(start + ms(100)).is_nan());
    }

    #[test]
    fn test_one_sample_is_nan_for_any_delta() {
        let start = Instant::now();
        let mut detector = PhiAccrualDetector::new(10, TimeUnit::Milliseconds, start, Tags::new());
        detector.record(start + ms(100));
        for offset in [0, 50, 100, 150, 100_000] {
            assert!(detector.suspicion(start + ms(100 + offset)).is_nan());
        }
    }

    // ==================== Zero variance ====================

    #[test]
    fn test_constant_intervals() {
        let start = Instant::now();
        let mut detector = PhiAccrualDetector::new(10, TimeUnit::Milliseconds, start, Tags::new());
        let mut t = start;
        for _ in 0..5 {
            t += ms(250);
            detector.record(t);
        }
        assert!(detector.suspicion(t + ms(250)).is_nan());
        assert_eq!(detector.suspicion(t + ms(251)), f64::INFINITY);
        assert_eq!(detector.suspicion(t + ms(10)), f64::INFINITY);
    }

    // ==================== Arrival stream ====================

    #[test]
    fn test_steady_stream_moments() {
        let (detector, _) = steady_detector(Instant::now(), 200);
        let (mean, stdev) = detector.moments();
        assert!((mean - 100.0).abs() < 1e-9);
        assert!((stdev - 10.0).abs() < 1e-9);
        assert_eq!(detector.samples(), 200);
    }

    #[test]
    fn test_steady_stream_suspicion_curve() {
        let (detector, last) = steady_detector(Instant::now(), 200);

        assert_phi(0.3010299956639812, detector.suspicion(last + ms(100)));
        assert_phi(0.799546, detector.suspicion(last + ms(110)));
        assert!(detector.suspicion(last).abs() < 1e-4);
        assert!(detector.suspicion(last + ms(160)).is_finite());
        assert_eq!(detector.suspicion(last + ms(100 + 255 * 10)), f64::INFINITY);
    }

    #[test]
    fn test_query_before_last_arrival() {
        let (detector, last) = steady_detector(Instant::now(), 50);
        let before = detector.suspicion(last - ms(100));
        assert!(before.abs() < 1e-4, "got {before}");
    }

    #[test]
    fn test_suspicion_does_not_mutate() {
        let (detector, last) = steady_detector(Instant::now(), 50);
        let at = last + ms(123);
        let first = detector.suspicion(at);
        let second = detector.suspicion(at);
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(detector.last_arrival(), last);
        assert_eq!(detector.samples(), 50);
    }

    #[test]
    fn test_out_of_order_arrival_records_negative_interval() {
        let start = Instant::now();
        let mut detector = PhiAccrualDetector::new(10, TimeUnit::Milliseconds, start, Tags::new());
        detector.record(start + ms(100));
        detector.record(start + ms(40));

        assert_eq!(detector.last_arrival(), start + ms(40));
        let (mean, _) = detector.moments();
        assert!((mean - 20.0).abs() < 1e-9); // (100 + -60) / 2
    }

    #[test]
    fn test_microsecond_unit() {
        let start = Instant::now();
        let mut detector = PhiAccrualDetector::new(10, TimeUnit::Microseconds, start, Tags::new());
        detector.record(start + ms(1));
        detector.record(start + ms(3));
        let (mean, stdev) = detector.moments();
        assert!((mean - 1500.0).abs() < 1e-9);
        assert!((stdev - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_tags_are_carried() {
        let mut tags = Tags::new();
        tags.insert("service".into(), "billing".into());
        let detector = PhiAccrualDetector::new(4, TimeUnit::Seconds, Instant::now(), tags);
        assert_eq!(detector.tags().get("service").map(String::as_str), Some("billing"));
    }

    #[test]
    fn test_trait_object() {
        let (detector, last) = steady_detector(Instant::now(), 20);
        let boxed: Box<dyn Detector> = Box::new(detector);
        assert_phi(0.3010299956639812, boxed.suspicion(last + ms(100)));
    }
}
