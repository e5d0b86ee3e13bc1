//! Worker-local collection of iteration metrics.
//!
//! Every worker owns one [`Aggregate`] and folds its own metrics into it, so the
//! hot path never contends with other workers. Progress reports and the final
//! result merge all of them into one view. Like any aggregate, `merge` must be
//! associative and commutative: worker aggregates are merged in arbitrary order.
//!
//! Aggregates keep mergeable raw data (counts and latency histograms) only.
//! Percentiles and rates are derived later, in [`crate::report`].
use std::time::Duration;

use hdrhistogram::Histogram;

use crate::metric::{IterationMetric, Outcome, Step};

/// Highest latency tracked with full precision, in microseconds (one hour).
/// Larger values saturate.
const MAX_TRACKABLE_MICROS: u64 = 3_600_000_000;

#[derive(Clone, Debug)]
pub struct Aggregate {
    pub succeeded: u64,
    pub failed: u64,
    success_latency: Histogram<u64>,
    fail_latency: Histogram<u64>,
}

fn histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_TRACKABLE_MICROS, 3)
        .expect("constant histogram bounds are valid")
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregate {
    pub fn new() -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            success_latency: histogram(),
            fail_latency: histogram(),
        }
    }

    /// Fold one metric in. Only iterations are counted; setup, teardown and
    /// drops are accounted for elsewhere.
    pub fn consume(&mut self, metric: &IterationMetric<'_>) {
        if metric.step != Step::Iteration {
            return;
        }
        let micros = metric.duration.as_micros().min(u64::MAX as u128) as u64;
        match metric.outcome {
            Outcome::Success => {
                self.succeeded += 1;
                self.success_latency.saturating_record(micros.max(1));
            }
            Outcome::Fail => {
                self.failed += 1;
                self.fail_latency.saturating_record(micros.max(1));
            }
            Outcome::Dropped => {}
        }
    }

    pub fn merge(&mut self, other: &Aggregate) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        // both histograms share the same bounds, so adding cannot fail
        let _ = self.success_latency.add(&other.success_latency);
        let _ = self.fail_latency.add(&other.fail_latency);
    }

    /// Iterations that ran to completion, successfully or not.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn success_latency(&self) -> &Histogram<u64> {
        &self.success_latency
    }

    pub fn fail_latency(&self) -> &Histogram<u64> {
        &self.fail_latency
    }

    /// Latency histogram across every completed iteration.
    pub fn latency(&self) -> Histogram<u64> {
        let mut all = self.success_latency.clone();
        let _ = all.add(&self.fail_latency);
        all
    }
}

/// Convert a histogram value back into a duration.
pub(crate) fn micros(value: u64) -> Duration {
    Duration::from_micros(value)
}
