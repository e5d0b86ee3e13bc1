//! Error types.
//!
//! Construction problems (bad rate strings, inconsistent ramps, incomplete file
//! stages) surface as [`ConfigError`] before anything runs. Problems that happen
//! while a run is in progress never abort the run: they are folded into the
//! [`crate::RunResult`] as [`RunError`]s next to the statistics already collected.

use std::time::Duration;

use thiserror::Error;

/// Error type returned by user scenario code (setup, iterations, teardown).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while turning configuration into a [`crate::Trigger`] or
/// [`crate::RunOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rate '{0}': expected <count>/<duration>, e.g. 10/s or 5/100ms")]
    InvalidRate(String),

    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("start rate unit {start:?} differs from end rate unit {end:?}")]
    MismatchedUnits { start: Duration, end: Duration },

    #[error("start rate equals end rate ({0}); use the constant mode instead")]
    FlatRamp(u64),

    #[error("ramp duration {duration:?} is shorter than the rate unit {unit:?}")]
    RampTooShort { duration: Duration, unit: Duration },

    #[error("invalid stage '{0}': expected <duration>:<target>")]
    InvalidStage(String),

    #[error("stage list is empty")]
    EmptyStages,

    #[error("invalid gaussian parameter '{field}': {reason}")]
    InvalidGaussian { field: &'static str, reason: String },

    #[error("invalid jitter {0}: must be a finite, non-negative percentage")]
    InvalidJitter(f64),

    #[error("unknown distribution '{0}': expected none, regular or random")]
    UnknownDistribution(String),

    #[error("unknown mode '{0}': expected constant, ramp, staged or gaussian")]
    UnknownMode(String),

    #[error("stage {stage}: missing required field '{field}'")]
    MissingField { stage: usize, field: &'static str },

    #[error("stage {stage}: {source}")]
    Stage {
        stage: usize,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("file defines no stages")]
    NoFileStages,

    #[error("failed to parse schedule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read schedule file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Attach a file stage index to an error raised while building that stage.
    pub(crate) fn in_stage(self, stage: usize) -> Self {
        match self {
            e @ (ConfigError::MissingField { .. } | ConfigError::Stage { .. }) => e,
            e => ConfigError::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }
}

/// Terminal problems recorded against a run.
///
/// None of these discard iteration statistics. Setup and teardown failures fail
/// the run verdict, a drain timeout is reported but does not.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("in-flight iterations still running after the {0:?} drain grace period")]
    DrainTimeout(Duration),
}

impl RunError {
    /// Whether this error fails the run verdict.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RunError::DrainTimeout(_))
    }
}
