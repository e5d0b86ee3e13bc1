//! Triggers: what starts iterations, and how often.
//!
//! A [`Trigger`] bundles everything the run needs to push start signals: a
//! (possibly jittered and distributed) rate function, its tick interval, an
//! optional finite duration and a description. It is built from
//! [`TriggerOptions`], which select one [`LoadShape`] and the decorations to
//! apply on top of it.
//!
//! ```rust
//! use std::time::Duration;
//! use surge::{Distribution, LoadShape, TriggerOptions};
//!
//! let trigger = TriggerOptions::builder()
//!     .shape(LoadShape::Constant("50/s".parse().unwrap()))
//!     .distribution(Distribution::Regular)
//!     .build()
//!     .build()
//!     .unwrap();
//! // 50 per second spread over 100ms sub-ticks
//! assert_eq!(trigger.interval(), Some(Duration::from_millis(100)));
//! ```
pub mod worker;
pub use worker::{TriggerAction, TriggerEvent, TriggerState, TriggerStats, TriggerWorker};

use std::time::Duration;

use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    error::ConfigError,
    rate::{
        distribute, with_jitter, BoxGenerator, BoxRateFunction, ConstantRate, Distribution,
        FileSchedule, FileSequence, GaussianParams, GaussianRate, RampRate, RateSpec, Stage,
        StagedRate,
    },
};

/// The load shapes a trigger can follow.
#[derive(Clone, Debug)]
pub enum LoadShape {
    /// A fixed count every rate unit.
    Constant(RateSpec),
    /// Linear ramp between two rates sharing a unit.
    Ramp {
        start: RateSpec,
        end: RateSpec,
        duration: Duration,
    },
    /// Piecewise-linear targets evaluated every `interval`.
    Staged { stages: Vec<Stage>, interval: Duration },
    /// Gaussian volume over a repeating window.
    Gaussian(GaussianParams),
    /// Sequence of independently configured stages read from a schedule file.
    File(FileSchedule),
    /// A fixed population of workers iterating back to back; no rate at all.
    Users,
}

impl LoadShape {
    /// Build the generator for this shape.
    ///
    /// `start` anchors time-dependent shapes; `None` anchors them on their first
    /// evaluation. `apply_env` lets the file sequencer export stage parameters
    /// to the process environment, and is off for dry runs. Returns `None` for
    /// [`LoadShape::Users`].
    pub fn generator(
        &self,
        start: Option<Instant>,
        apply_env: bool,
    ) -> Result<Option<BoxGenerator>, ConfigError> {
        let generator: BoxGenerator = match self {
            LoadShape::Constant(spec) => Box::new(ConstantRate::new(*spec)),
            LoadShape::Ramp {
                start: from,
                end,
                duration,
            } => {
                let ramp = RampRate::new(*from, *end, *duration)?;
                Box::new(match start {
                    Some(at) => ramp.starting_at(at),
                    None => ramp,
                })
            }
            LoadShape::Staged { stages, interval } => {
                let staged = StagedRate::new(stages.clone(), *interval)?;
                Box::new(match start {
                    Some(at) => staged.starting_at(at),
                    None => staged,
                })
            }
            LoadShape::Gaussian(params) => {
                let gaussian = GaussianRate::new(params.clone())?;
                Box::new(match start {
                    Some(at) => gaussian.starting_at(at),
                    None => gaussian,
                })
            }
            LoadShape::File(schedule) => {
                Box::new(FileSequence::new(schedule.clone()).with_environment(apply_env))
            }
            LoadShape::Users => return Ok(None),
        };
        Ok(Some(generator))
    }

    /// Natural tick interval, before any distribution.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            LoadShape::Constant(spec) => Some(spec.unit),
            LoadShape::Ramp { start, .. } => Some(start.unit),
            LoadShape::Staged { interval, .. } => Some(*interval),
            LoadShape::Gaussian(params) => Some(params.interval),
            LoadShape::File(schedule) => schedule.stages().first().map(|s| s.interval()),
            LoadShape::Users => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoadShape::Constant(_) => "constant",
            LoadShape::Ramp { .. } => "ramp",
            LoadShape::Staged { .. } => "staged",
            LoadShape::Gaussian(_) => "gaussian",
            LoadShape::File(_) => "file",
            LoadShape::Users => "users",
        }
    }
}

/// Apply jitter then sub-tick distribution to a generator.
pub(crate) fn decorate(
    generator: BoxGenerator,
    jitter: f64,
    distribution: Distribution,
) -> (Duration, BoxRateFunction) {
    let interval = generator.interval();
    let rate = with_jitter(generator.into_rate(), jitter);
    distribute(distribution, interval, rate)
}

pub(crate) fn validate_jitter(jitter: f64) -> Result<(), ConfigError> {
    if !jitter.is_finite() || jitter < 0.0 {
        return Err(ConfigError::InvalidJitter(jitter));
    }
    Ok(())
}

/// Everything needed to build a [`Trigger`].
///
/// Jitter and distribution apply to every shape except [`LoadShape::File`],
/// whose stages carry their own, and [`LoadShape::Users`], which has no rate.
#[derive(Clone, Debug, TypedBuilder)]
pub struct TriggerOptions {
    pub shape: LoadShape,
    /// Jitter percentage; 0 disables it.
    #[builder(default)]
    pub jitter: f64,
    #[builder(default)]
    pub distribution: Distribution,
}

impl TriggerOptions {
    /// Constant rate from a `<count>/<duration>` string.
    pub fn constant(rate: &str) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .shape(LoadShape::Constant(rate.parse()?))
            .build())
    }

    /// Ramp between two `<count>/<duration>` strings over `duration`.
    pub fn ramp(start: &str, end: &str, duration: &str) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .shape(LoadShape::Ramp {
                start: start.parse()?,
                end: end.parse()?,
                duration: crate::rate::spec::parse_duration(duration)?,
            })
            .build())
    }

    /// Staged targets from a `"<duration>:<target>, ..."` list, evaluated every
    /// `interval`.
    pub fn staged(stages: &str, interval: &str) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .shape(LoadShape::Staged {
                stages: crate::rate::parse_stages(stages)?,
                interval: crate::rate::spec::parse_duration(interval)?,
            })
            .build())
    }

    /// Build a live trigger.
    pub fn build(&self) -> Result<Trigger, ConfigError> {
        validate_jitter(self.jitter)?;
        let (kind, description, duration) = self.kind(true)?;
        Ok(Trigger {
            options: self.clone(),
            kind,
            description,
            duration,
        })
    }

    fn kind(
        &self,
        apply_env: bool,
    ) -> Result<(TriggerKind, String, Option<Duration>), ConfigError> {
        let Some(generator) = self.shape.generator(None, apply_env)? else {
            return Ok((TriggerKind::Users, "fixed population of users".to_string(), None));
        };
        let duration = generator.duration();
        let mut description = generator.describe();
        if matches!(self.shape, LoadShape::File(_)) {
            let interval = generator.interval();
            let rate = generator.into_rate();
            return Ok((TriggerKind::Rate { rate, interval }, description, duration));
        }

        if self.jitter > 0.0 {
            description.push_str(&format!(", {}% jitter", self.jitter));
        }
        description.push_str(&format!(", {} distribution", self.distribution));
        let (interval, rate) = decorate(generator, self.jitter, self.distribution);
        Ok((TriggerKind::Rate { rate, interval }, description, duration))
    }
}

/// How a trigger starts iterations.
pub enum TriggerKind {
    /// A rate function evaluated every `interval`, feeding the triggered pool.
    Rate {
        rate: BoxRateFunction,
        interval: Duration,
    },
    /// No rate: the continuous pool keeps every worker busy.
    Users,
}

/// A built trigger, ready to be handed to a [`crate::Run`].
pub struct Trigger {
    options: TriggerOptions,
    kind: TriggerKind,
    description: String,
    duration: Option<Duration>,
}

impl Trigger {
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Finite duration of the load shape, if it has one.
    pub fn duration(&self) -> Option<Duration> {
        self.duration.filter(|d| !d.is_zero())
    }

    /// Tick interval, `None` for the users mode.
    pub fn interval(&self) -> Option<Duration> {
        match &self.kind {
            TriggerKind::Rate { interval, .. } => Some(*interval),
            TriggerKind::Users => None,
        }
    }

    pub fn options(&self) -> &TriggerOptions {
        &self.options
    }

    /// An independent rate function with the same shape, for charting.
    ///
    /// It shares no state with the live trigger and never touches the process
    /// environment. Returns `None` for the users mode.
    pub fn dry_run(&self) -> Result<Option<(Duration, BoxRateFunction)>, ConfigError> {
        match self.options.kind(false)?.0 {
            TriggerKind::Rate { rate, interval } => Ok(Some((interval, rate))),
            TriggerKind::Users => Ok(None),
        }
    }

    pub(crate) fn into_kind(self) -> TriggerKind {
        self.kind
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("description", &self.description)
            .field("interval", &self.interval())
            .field("duration", &self.duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_trigger_is_distributed() {
        let trigger = TriggerOptions::constant("10/s").unwrap().build().unwrap();
        assert_eq!(trigger.interval(), Some(Duration::from_millis(100)));
        assert_eq!(trigger.duration(), None);
        assert_eq!(
            trigger.description(),
            "10 iterations every 1s, regular distribution"
        );
    }

    #[test]
    fn no_distribution_keeps_the_natural_interval() {
        let trigger = TriggerOptions::builder()
            .shape(LoadShape::Constant("10/s".parse().unwrap()))
            .distribution(Distribution::None)
            .jitter(5.0)
            .build()
            .build()
            .unwrap();
        assert_eq!(trigger.interval(), Some(Duration::from_secs(1)));
        assert_eq!(
            trigger.description(),
            "10 iterations every 1s, 5% jitter, none distribution"
        );
    }

    #[test]
    fn staged_trigger_has_a_finite_duration() {
        let trigger = TriggerOptions::staged("0s:0, 10s:10, 20s:0", "1s")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(trigger.duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn ramp_errors_surface_at_build() {
        let err = TriggerOptions::ramp("5/s", "5/s", "1m")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FlatRamp(5)));
    }

    #[test]
    fn negative_jitter_is_rejected() {
        let err = TriggerOptions::builder()
            .shape(LoadShape::Constant("1/s".parse().unwrap()))
            .jitter(-1.0)
            .build()
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJitter(_)));
    }

    #[test]
    fn users_mode_has_no_rate() {
        let trigger = TriggerOptions::builder()
            .shape(LoadShape::Users)
            .build()
            .build()
            .unwrap();
        assert_eq!(trigger.interval(), None);
        assert!(trigger.dry_run().unwrap().is_none());
        assert!(matches!(trigger.into_kind(), TriggerKind::Users));
    }

    #[test]
    fn dry_run_is_independent_of_the_live_trigger() {
        let trigger = TriggerOptions::staged("0s:0, 10s:10", "1s")
            .unwrap()
            .build()
            .unwrap();
        let (_, mut dry) = trigger.dry_run().unwrap().unwrap();
        let start = Instant::now();
        // advance the dry run to the end of its stages
        assert_eq!(dry.rate(start), 0);
        assert_eq!(dry.rate(start + Duration::from_secs(20)), 0);

        let TriggerKind::Rate { mut rate, .. } = trigger.into_kind() else {
            panic!("expected a rate trigger");
        };
        // the live trigger is anchored on its own first call
        let later = start + Duration::from_secs(30);
        let first: u64 = (0..10).map(|_| rate.rate(later)).sum();
        assert_eq!(first, 0);
        let ramped: u64 = (0..10).map(|_| rate.rate(later + Duration::from_secs(5))).sum();
        assert_eq!(ramped, 5);
    }
}
