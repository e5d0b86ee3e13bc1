use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Which part of a scenario a metric was recorded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Setup,
    Iteration,
    Teardown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
    /// A start signal no worker was free to take.
    Dropped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
            Outcome::Dropped => "dropped",
        })
    }
}

/// A single sample handed to reporters: one iteration, one drop, or the
/// scenario's setup or teardown.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IterationMetric<'a> {
    pub scenario: &'a str,
    pub step: Step,
    pub outcome: Outcome,
    /// Zero for drops.
    pub duration: Duration,
    /// Failure detail: the error returned, the reason given to
    /// [`crate::IterationContext::fail`] or the panic message.
    pub error: Option<&'a str>,
}

impl<'a> IterationMetric<'a> {
    pub fn dropped(scenario: &'a str) -> Self {
        Self {
            scenario,
            step: Step::Iteration,
            outcome: Outcome::Dropped,
            duration: Duration::ZERO,
            error: None,
        }
    }
}
