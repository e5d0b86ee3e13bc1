//! What a finished run hands back.
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::Aggregate,
    error::RunError,
    report::{LatencySummary, RunSummary},
};

/// Why the run left the running phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured maximum duration (or the trigger's own duration) elapsed.
    DurationElapsed,
    /// The interrupt token fired or Ctrl-C was received.
    Interrupted,
    /// The iteration ceiling was handed out.
    IterationsReached,
    /// The trigger stopped on its own before any limit.
    TriggerFinished,
    /// Setup failed and no iteration was attempted.
    SetupFailed,
}

/// Failure thresholds evaluated once, when the run is over.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Highest tolerated number of failed iterations.
    pub max_failures: Option<u64>,
    /// Highest tolerated failure percentage of started iterations.
    pub max_failures_rate: Option<f64>,
    /// Do not fail the run because of dropped iterations.
    pub ignore_dropped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    /// Every reason the run failed, empty when it passed.
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub scenario: String,
    /// Description of the trigger that drove the run.
    pub trigger: String,
    pub started_at: SystemTime,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
    pub started: u64,
    pub dropped: u64,
    /// Start signals the trigger emitted. `None` in users mode, which has no
    /// trigger.
    pub emitted: Option<u64>,
    pub aggregate: Aggregate,
    pub errors: Vec<RunError>,
    pub thresholds: Thresholds,
}

impl RunResult {
    pub fn succeeded(&self) -> u64 {
        self.aggregate.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.aggregate.failed
    }

    /// Failed iterations as a percentage of started iterations.
    pub fn failure_rate(&self) -> f64 {
        if self.started == 0 {
            return 0.0;
        }
        self.failed() as f64 / self.started as f64 * 100.0
    }

    pub fn verdict(&self) -> Verdict {
        let mut reasons: Vec<String> = self
            .errors
            .iter()
            .filter(|e| e.is_fatal())
            .map(ToString::to_string)
            .collect();

        let failed = self.failed();
        let Thresholds {
            max_failures,
            max_failures_rate,
            ignore_dropped,
        } = self.thresholds;
        match (max_failures, max_failures_rate) {
            (None, None) if failed > 0 => {
                reasons.push(format!("{failed} iterations failed"));
            }
            _ => {
                if let Some(max) = max_failures {
                    if failed > max {
                        reasons.push(format!(
                            "{failed} iterations failed, more than the {max} allowed"
                        ));
                    }
                }
                if let Some(max) = max_failures_rate {
                    let rate = self.failure_rate();
                    if rate > max {
                        reasons.push(format!(
                            "{rate:.2}% of iterations failed, more than the {max}% allowed"
                        ));
                    }
                }
            }
        }
        if self.dropped > 0 && !ignore_dropped {
            reasons.push(format!("{} iterations dropped", self.dropped));
        }

        Verdict {
            passed: reasons.is_empty(),
            reasons,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict().passed
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            scenario: self.scenario.clone(),
            trigger: self.trigger.clone(),
            started_at: humantime::format_rfc3339_millis(self.started_at).to_string(),
            elapsed_secs: self.elapsed.as_secs_f64(),
            stop_reason: self.stop_reason,
            started: self.started,
            succeeded: self.succeeded(),
            failed: self.failed(),
            dropped: self.dropped,
            emitted: self.emitted,
            failure_rate: self.failure_rate(),
            latency: LatencySummary::from(&self.aggregate.latency()),
            success_latency: LatencySummary::from(self.aggregate.success_latency()),
            fail_latency: LatencySummary::from(self.aggregate.fail_latency()),
            errors: self.errors.clone(),
            verdict: self.verdict(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{IterationMetric, Outcome, Step};

    fn result(succeeded: u64, failed: u64, dropped: u64, thresholds: Thresholds) -> RunResult {
        let mut aggregate = Aggregate::new();
        for i in 0..succeeded + failed {
            aggregate.consume(&IterationMetric {
                scenario: "test",
                step: Step::Iteration,
                outcome: if i < succeeded {
                    Outcome::Success
                } else {
                    Outcome::Fail
                },
                duration: Duration::from_millis(10),
                error: None,
            });
        }
        RunResult {
            scenario: "test".into(),
            trigger: "10 iterations every 1s".into(),
            started_at: SystemTime::UNIX_EPOCH,
            elapsed: Duration::from_secs(1),
            stop_reason: StopReason::DurationElapsed,
            started: succeeded + failed,
            dropped,
            emitted: Some(succeeded + failed + dropped),
            aggregate,
            errors: Vec::new(),
            thresholds,
        }
    }

    mod verdict {
        use super::*;

        #[test]
        fn clean_run_passes() {
            let verdict = result(10, 0, 0, Thresholds::default()).verdict();
            assert!(verdict.passed);
            assert!(verdict.reasons.is_empty());
        }

        #[test]
        fn any_failure_fails_without_thresholds() {
            let verdict = result(9, 1, 0, Thresholds::default()).verdict();
            assert_eq!(verdict.reasons, ["1 iterations failed"]);
        }

        #[test]
        fn absolute_threshold() {
            let thresholds = Thresholds {
                max_failures: Some(2),
                ..Default::default()
            };
            assert!(result(8, 2, 0, thresholds.clone()).passed());
            assert!(!result(7, 3, 0, thresholds).passed());
        }

        #[test]
        fn rate_threshold_is_a_percentage_of_started() {
            let thresholds = Thresholds {
                max_failures_rate: Some(10.0),
                ..Default::default()
            };
            assert!(result(90, 10, 0, thresholds.clone()).passed());
            let verdict = result(89, 11, 0, thresholds).verdict();
            assert_eq!(
                verdict.reasons,
                ["11.00% of iterations failed, more than the 10% allowed"]
            );
        }

        #[test]
        fn drops_fail_unless_ignored() {
            assert_eq!(
                result(10, 0, 3, Thresholds::default()).verdict().reasons,
                ["3 iterations dropped"]
            );
            let thresholds = Thresholds {
                ignore_dropped: true,
                ..Default::default()
            };
            assert!(result(10, 0, 3, thresholds).passed());
        }

        #[test]
        fn only_fatal_errors_count() {
            let mut run = result(10, 0, 0, Thresholds::default());
            run.errors.push(RunError::DrainTimeout(Duration::from_secs(1)));
            assert!(run.passed());
            run.errors.push(RunError::Teardown("db gone".into()));
            assert_eq!(run.verdict().reasons, ["teardown failed: db gone"]);
        }
    }

    #[test]
    fn summary_carries_counts_and_verdict() {
        let summary = result(3, 1, 0, Thresholds::default()).summary();
        assert_eq!(summary.started_at, "1970-01-01T00:00:00.000Z");
        assert_eq!((summary.started, summary.succeeded, summary.failed), (4, 3, 1));
        assert_eq!(summary.failure_rate, 25.0);
        assert_eq!(summary.fail_latency.count, 1);
        assert!(!summary.verdict.passed);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stop_reason"], "duration_elapsed");
        assert_eq!(json["emitted"], 4);

        let mut users = result(2, 0, 0, Thresholds::default());
        users.emitted = None;
        let json = serde_json::to_value(users.summary()).unwrap();
        assert!(json.get("emitted").is_none());
    }
}
