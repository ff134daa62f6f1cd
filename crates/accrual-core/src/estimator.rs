//! Rolling statistics over heartbeat inter-arrival intervals.
//!
//! [`IntervalEstimator`] keeps the last `window_size` intervals in a
//! fixed-capacity ring and maintains their sum and sum of squares
//! incrementally, so both recording and reading the moments are O(1)
//! regardless of the window size.
//!
//! The running totals use compensated (Neumaier) summation. A detector lives
//! for as long as its peer keeps beating, so the add-new/subtract-evicted
//! updates would otherwise accumulate rounding error without bound.

/// Neumaier-compensated running sum.
#[derive(Debug, Clone, Copy, Default)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    fn add(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Fixed-capacity rolling sum / sum-of-squares over recorded intervals.
///
/// Invariant: `sum` and `sum_of_squares` always equal the sum and sum of
/// squares of the values currently resident in `samples`. Unfilled slots
/// hold `0.0` and contribute nothing.
#[derive(Debug, Clone)]
pub struct IntervalEstimator {
    samples: Box<[f64]>,
    /// Slot that the next `record` overwrites (the oldest resident value once full)
    next: usize,
    sum: CompensatedSum,
    sum_of_squares: CompensatedSum,
    total_recorded: u64,
}

impl IntervalEstimator {
    /// Create an estimator holding at most `window_size` intervals.
    ///
    /// # Panics
    /// Panics if `window_size` is zero. Configuration validation rejects a
    /// zero window before an estimator is ever built.
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "window size must be positive");
        Self {
            samples: vec![0.0; window_size].into_boxed_slice(),
            next: 0,
            sum: CompensatedSum::default(),
            sum_of_squares: CompensatedSum::default(),
            total_recorded: 0,
        }
    }

    /// Overwrite the oldest slot with `value`.
    ///
    /// Accepts any float, including negative intervals produced by reordered
    /// arrivals; the caller decides what it feeds in.
    pub fn record(&mut self, value: f64) {
        let evicted = std::mem::replace(&mut self.samples[self.next], value);
        self.next = (self.next + 1) % self.samples.len();

        self.sum.add(value);
        self.sum.add(-evicted);
        self.sum_of_squares.add(value * value);
        self.sum_of_squares.add(-(evicted * evicted));
        self.total_recorded += 1;
    }

    /// Mean and standard deviation of the resident intervals.
    ///
    /// Both are `NaN` when nothing has been recorded yet.
    pub fn moments(&self) -> (f64, f64) {
        let n = self.len();
        if n == 0 {
            return (f64::NAN, f64::NAN);
        }
        let n = n as f64;
        let mean = self.sum() / n;
        let mean_of_squares = self.sum_of_squares() / n;
        let variance = mean_of_squares - mean * mean;

        // E[x²] - E[x]² cancels catastrophically when the spread is tiny
        // relative to the magnitude. Anything under the rounding floor of
        // E[x²] is indistinguishable from zero.
        let floor = n * f64::EPSILON * mean_of_squares.abs();
        let variance = if variance <= floor { 0.0 } else { variance };

        (mean, variance.sqrt())
    }

    /// Number of intervals currently contributing to the statistics.
    pub fn len(&self) -> usize {
        self.total_recorded.min(self.samples.len() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total_recorded == 0
    }

    /// Capacity fixed at construction.
    pub fn window_size(&self) -> usize {
        self.samples.len()
    }

    /// Total number of `record` calls, including evicted values.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn sum(&self) -> f64 {
        self.sum.value()
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.sum_of_squares.value()
    }

    /// Build an estimator directly from running totals.
    ///
    /// Used to reproduce known statistical fixtures without replaying
    /// thousands of samples.
    #[cfg(test)]
    pub(crate) fn from_totals(window_size: usize, sum: f64, sum_of_squares: f64, recorded: u64) -> Self {
        let mut estimator = Self::new(window_size);
        estimator.sum.add(sum);
        estimator.sum_of_squares.add(sum_of_squares);
        estimator.total_recorded = recorded;
        estimator
    }
}
