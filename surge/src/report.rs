//! Reports and reporters.
//!
//! A [`Reporter`] is the capability a run is handed for telemetry: it sees every
//! iteration metric as it happens, periodic [`ProgressReport`]s, and one
//! [`RunSummary`] at the end. Reporters are passed into [`crate::Run`], never
//! global, so two runs in the same process do not share state.
use async_trait::async_trait;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{micros, Aggregate},
    error::{BoxError, RunError},
    metric::IterationMetric,
    result::{StopReason, Verdict},
};

/// Latency percentiles in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

fn millis(value: u64) -> f64 {
    micros(value).as_secs_f64() * 1_000.0
}

impl From<&Histogram<u64>> for LatencySummary {
    fn from(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            count: histogram.len(),
            min_ms: millis(histogram.min()),
            mean_ms: histogram.mean() / 1_000.0,
            p50_ms: millis(histogram.value_at_quantile(0.50)),
            p90_ms: millis(histogram.value_at_quantile(0.90)),
            p95_ms: millis(histogram.value_at_quantile(0.95)),
            p99_ms: millis(histogram.value_at_quantile(0.99)),
            max_ms: millis(histogram.max()),
        }
    }
}

/// Snapshot taken while the run is in progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub scenario: String,
    pub elapsed_secs: f64,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    /// Started but not finished yet.
    pub in_flight: u64,
    pub latency: LatencySummary,
}

impl ProgressReport {
    pub fn new(
        scenario: &str,
        elapsed: std::time::Duration,
        started: u64,
        dropped: u64,
        aggregate: &Aggregate,
    ) -> Self {
        Self {
            scenario: scenario.to_string(),
            elapsed_secs: elapsed.as_secs_f64(),
            started,
            succeeded: aggregate.succeeded,
            failed: aggregate.failed,
            dropped,
            in_flight: started.saturating_sub(aggregate.completed()),
            latency: LatencySummary::from(&aggregate.latency()),
        }
    }
}

/// Final, cumulative view of a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub trigger: String,
    /// RFC 3339, UTC.
    pub started_at: String,
    pub elapsed_secs: f64,
    pub stop_reason: StopReason,
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emitted: Option<u64>,
    /// Failed iterations as a percentage of started ones.
    pub failure_rate: f64,
    pub latency: LatencySummary,
    pub success_latency: LatencySummary,
    pub fail_latency: LatencySummary,
    pub errors: Vec<RunError>,
    pub verdict: Verdict,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called for every setup, iteration, teardown and drop. Runs on the
    /// worker's hot path, so keep it cheap.
    fn iteration(&self, _metric: &IterationMetric<'_>) {}

    /// `count` start signals were dropped at once.
    fn dropped(&self, scenario: &str, count: u64) {
        let metric = IterationMetric::dropped(scenario);
        for _ in 0..count {
            self.iteration(&metric);
        }
    }

    fn progress(&self, _report: &ProgressReport) {}

    async fn report(&self, summary: &RunSummary) -> Result<(), BoxError>;
}

#[async_trait]
impl<R: Reporter + ?Sized> Reporter for std::sync::Arc<R> {
    fn iteration(&self, metric: &IterationMetric<'_>) {
        (**self).iteration(metric)
    }

    fn dropped(&self, scenario: &str, count: u64) {
        (**self).dropped(scenario, count)
    }

    fn progress(&self, report: &ProgressReport) {
        (**self).progress(report)
    }

    async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
        (**self).report(summary).await
    }
}

/// Logs progress and the final summary through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

#[async_trait]
impl Reporter for TracingReporter {
    fn iteration(&self, metric: &IterationMetric<'_>) {
        tracing::trace!(
            step = ?metric.step,
            outcome = %metric.outcome,
            duration = ?metric.duration,
            error = metric.error,
            "iteration"
        );
    }

    fn dropped(&self, scenario: &str, count: u64) {
        tracing::trace!(scenario, count, "dropped");
    }

    fn progress(&self, report: &ProgressReport) {
        tracing::info!(
            elapsed = format_args!("{:.0}s", report.elapsed_secs),
            started = report.started,
            succeeded = report.succeeded,
            failed = report.failed,
            dropped = report.dropped,
            in_flight = report.in_flight,
            p95_ms = report.latency.p95_ms,
            "progress"
        );
    }

    async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
        tracing::info!(
            scenario = %summary.scenario,
            stop_reason = ?summary.stop_reason,
            elapsed = format_args!("{:.3}s", summary.elapsed_secs),
            started = summary.started,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dropped = summary.dropped,
            emitted = summary.emitted,
            p50_ms = summary.latency.p50_ms,
            p99_ms = summary.latency.p99_ms,
            passed = summary.verdict.passed,
            "run finished"
        );
        for reason in &summary.verdict.reasons {
            tracing::warn!(%reason, "run failed");
        }
        Ok(())
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    fn dropped(&self, _scenario: &str, _count: u64) {}

    async fn report(&self, _summary: &RunSummary) -> Result<(), BoxError> {
        Ok(())
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use super::*;

    /// Prints the final summary to stdout as pretty JSON.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct StdoutReporter;

    #[async_trait]
    impl Reporter for StdoutReporter {
        async fn report(&self, summary: &RunSummary) -> Result<(), BoxError> {
            println!("{}", serde_json::to_string_pretty(summary)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::metric::{Outcome, Step};

    fn metric(outcome: Outcome, millis: u64) -> IterationMetric<'static> {
        IterationMetric {
            scenario: "test",
            step: Step::Iteration,
            outcome,
            duration: Duration::from_millis(millis),
            error: None,
        }
    }

    mod latency_summary {
        use super::*;

        #[test]
        fn empty_histogram_is_all_zero() {
            let summary = LatencySummary::from(&Aggregate::new().latency());
            assert_eq!(summary, LatencySummary::default());
        }

        #[test]
        fn percentiles_in_milliseconds() {
            let mut aggregate = Aggregate::new();
            for ms in 1..=100 {
                aggregate.consume(&metric(Outcome::Success, ms));
            }
            let summary = LatencySummary::from(aggregate.success_latency());
            assert_eq!(summary.count, 100);
            assert!((summary.min_ms - 1.0).abs() < 0.01);
            assert!((summary.p50_ms - 50.0).abs() < 0.1);
            assert!((summary.p99_ms - 99.0).abs() < 0.1);
            assert!((summary.max_ms - 100.0).abs() < 0.1);
            assert!((summary.mean_ms - 50.5).abs() < 0.1);
        }
    }

    #[test]
    fn progress_counts_in_flight() {
        let mut aggregate = Aggregate::new();
        aggregate.consume(&metric(Outcome::Success, 5));
        aggregate.consume(&metric(Outcome::Fail, 5));
        let report = ProgressReport::new("test", Duration::from_secs(3), 7, 2, &aggregate);
        assert_eq!(report.in_flight, 5);
        assert_eq!(report.elapsed_secs, 3.0);
        assert_eq!(report.latency.count, 2);
    }

    #[test]
    fn default_dropped_fans_out_to_iteration() {
        #[derive(Default)]
        struct Counting(AtomicU64);

        #[async_trait]
        impl Reporter for Counting {
            fn iteration(&self, metric: &IterationMetric<'_>) {
                assert_eq!(metric.outcome, Outcome::Dropped);
                self.0.fetch_add(1, Ordering::Relaxed);
            }

            async fn report(&self, _summary: &RunSummary) -> Result<(), BoxError> {
                Ok(())
            }
        }

        let reporter = Counting::default();
        reporter.dropped("test", 4);
        assert_eq!(reporter.0.load(Ordering::Relaxed), 4);
    }
}
