//! File-driven sequence of load stages.
//!
//! A schedule file lists stages that run back to back, each with its own load
//! shape, duration and parameters. Fields missing from a stage fall back to the
//! file's `default` section:
//!
//! ```yaml
//! scenario: checkout
//! default:
//!   distribution: regular
//!   parameters:
//!     REGION: eu-west-1
//! limits:
//!   max-duration: 30m
//!   concurrency: 200
//!   max-failures-rate: 5
//! schedule:
//!   stage-start: 2024-05-01T08:00:00Z
//! stages:
//!   - mode: constant
//!     duration: 5m
//!     rate: 10/s
//!   - mode: ramp
//!     duration: 10m
//!     start-rate: 10/s
//!     end-rate: 100/s
//!     jitter: 10
//!   - mode: gaussian
//!     duration: 15m
//!     volume: 10000
//!     repeat: 5m
//!     peak: 2m30s
//!     standard-deviation: 1m
//!     iteration-frequency: 1s
//! ```
//!
//! Validation is fail-fast: [`FileSchedule::parse`] builds every stage once and
//! reports the first missing field or invalid value together with its stage
//! index (0-based).
//!
//! While a stage is active its `parameters` are exported to the process
//! environment; they are removed again when the stage ends or the sequence is
//! dropped.
use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, SystemTime},
};

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{
    distributed_interval, parse_stages, spec::parse_duration, BoxRateFunction, Distribution,
    GaussianParams, Generator, RateFunction,
};
use crate::{
    error::ConfigError,
    trigger::{decorate, validate_jitter, LoadShape, Trigger, TriggerOptions},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Document {
    #[serde(default)]
    scenario: String,
    #[serde(default)]
    default: StageFields,
    #[serde(default)]
    limits: FileLimits,
    #[serde(default)]
    schedule: ScheduleSection,
    #[serde(default)]
    stages: Vec<StageFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ScheduleSection {
    stage_start: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct StageFields {
    mode: Option<String>,
    duration: Option<String>,
    rate: Option<String>,
    start_rate: Option<String>,
    end_rate: Option<String>,
    stages: Option<String>,
    iteration_frequency: Option<String>,
    volume: Option<f64>,
    repeat: Option<String>,
    peak: Option<String>,
    standard_deviation: Option<String>,
    weights: Option<Vec<f64>>,
    jitter: Option<f64>,
    distribution: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, serde_yaml::Value>,
}

fn required<'a, T: ?Sized>(
    value: Option<&'a T>,
    stage: usize,
    field: &'static str,
) -> Result<&'a T, ConfigError> {
    value.ok_or(ConfigError::MissingField { stage, field })
}

fn parameter_value(value: &serde_yaml::Value) -> Result<String, ConfigError> {
    Ok(match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)?.trim_end().to_string(),
    })
}

impl StageFields {
    /// Fill every field this stage leaves unset from `defaults`. Parameters are
    /// merged, the stage's own values winning.
    fn or(self, defaults: &StageFields) -> StageFields {
        let mut parameters = defaults.parameters.clone();
        parameters.extend(self.parameters);
        StageFields {
            mode: self.mode.or_else(|| defaults.mode.clone()),
            duration: self.duration.or_else(|| defaults.duration.clone()),
            rate: self.rate.or_else(|| defaults.rate.clone()),
            start_rate: self.start_rate.or_else(|| defaults.start_rate.clone()),
            end_rate: self.end_rate.or_else(|| defaults.end_rate.clone()),
            stages: self.stages.or_else(|| defaults.stages.clone()),
            iteration_frequency: self
                .iteration_frequency
                .or_else(|| defaults.iteration_frequency.clone()),
            volume: self.volume.or(defaults.volume),
            repeat: self.repeat.or_else(|| defaults.repeat.clone()),
            peak: self.peak.or_else(|| defaults.peak.clone()),
            standard_deviation: self
                .standard_deviation
                .or_else(|| defaults.standard_deviation.clone()),
            weights: self.weights.or_else(|| defaults.weights.clone()),
            jitter: self.jitter.or(defaults.jitter),
            distribution: self.distribution.or_else(|| defaults.distribution.clone()),
            parameters,
        }
    }

    fn into_stage(self, index: usize) -> Result<FileStage, ConfigError> {
        let duration = parse_duration(required(self.duration.as_deref(), index, "duration")?)?;
        let duration_of = |value: Option<&str>, field| -> Result<Duration, ConfigError> {
            parse_duration(required(value, index, field)?)
        };

        let mode = required(self.mode.as_deref(), index, "mode")?;
        let shape = match mode.trim().to_ascii_lowercase().as_str() {
            "constant" => {
                LoadShape::Constant(required(self.rate.as_deref(), index, "rate")?.parse()?)
            }
            "ramp" => LoadShape::Ramp {
                start: required(self.start_rate.as_deref(), index, "start-rate")?.parse()?,
                end: required(self.end_rate.as_deref(), index, "end-rate")?.parse()?,
                duration,
            },
            "staged" => LoadShape::Staged {
                stages: parse_stages(required(self.stages.as_deref(), index, "stages")?)?,
                interval: duration_of(self.iteration_frequency.as_deref(), "iteration-frequency")?,
            },
            "gaussian" => LoadShape::Gaussian(GaussianParams {
                volume: *required(self.volume.as_ref(), index, "volume")?,
                repeat: duration_of(self.repeat.as_deref(), "repeat")?,
                peak: duration_of(self.peak.as_deref(), "peak")?,
                std_dev: duration_of(self.standard_deviation.as_deref(), "standard-deviation")?,
                interval: duration_of(self.iteration_frequency.as_deref(), "iteration-frequency")?,
                weights: self.weights.unwrap_or_default(),
            }),
            _ => return Err(ConfigError::UnknownMode(mode.to_string())),
        };

        let jitter = self.jitter.unwrap_or(0.0);
        validate_jitter(jitter)?;
        let distribution = match self.distribution {
            Some(name) => name.parse()?,
            None => Distribution::default(),
        };
        let parameters = self
            .parameters
            .iter()
            .map(|(k, v)| Ok((k.clone(), parameter_value(v)?)))
            .collect::<Result<_, ConfigError>>()?;

        let stage = FileStage {
            duration,
            shape,
            jitter,
            distribution,
            parameters,
        };
        // surface shape errors (flat ramps, bad gaussian parameters) now
        stage.build(Instant::now())?;
        Ok(stage)
    }
}

/// Run limits carried by a schedule file.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileLimits {
    #[serde(default, with = "humantime_serde_opt")]
    pub max_duration: Option<Duration>,
    pub concurrency: Option<usize>,
    pub max_iterations: Option<u64>,
    pub max_failures: Option<u64>,
    /// Percentage of started iterations.
    pub max_failures_rate: Option<f64>,
    pub ignore_dropped: Option<bool>,
}

mod humantime_serde_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// One validated stage of a [`FileSchedule`].
#[derive(Clone, Debug)]
pub struct FileStage {
    pub duration: Duration,
    pub shape: LoadShape,
    pub jitter: f64,
    pub distribution: Distribution,
    /// Exported to the environment while the stage is active.
    pub parameters: BTreeMap<String, String>,
}

impl FileStage {
    /// Tick interval of this stage once distributed.
    pub fn interval(&self) -> Duration {
        let natural = self.shape.interval().unwrap_or(Duration::from_secs(1));
        distributed_interval(self.distribution, natural)
    }

    fn build(&self, start: Instant) -> Result<(Duration, BoxRateFunction), ConfigError> {
        let generator = self
            .shape
            .generator(Some(start), false)?
            .ok_or_else(|| ConfigError::UnknownMode(self.shape.name().to_string()))?;
        Ok(decorate(generator, self.jitter, self.distribution))
    }
}

/// A parsed and validated schedule file.
#[derive(Clone, Debug)]
pub struct FileSchedule {
    scenario: String,
    limits: FileLimits,
    stage_start: Option<SystemTime>,
    stages: Vec<FileStage>,
}

impl FileSchedule {
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let document: Document = serde_yaml::from_str(yaml)?;
        if document.stages.is_empty() {
            return Err(ConfigError::NoFileStages);
        }
        let stage_start = document
            .schedule
            .stage_start
            .map(|value| {
                humantime::parse_rfc3339_weak(value.trim()).map_err(|e| {
                    ConfigError::InvalidTimestamp {
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .transpose()?;

        let stages = document
            .stages
            .into_iter()
            .enumerate()
            .map(|(index, fields)| {
                fields
                    .or(&document.default)
                    .into_stage(index)
                    .map_err(|e| e.in_stage(index))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            scenario: document.scenario,
            limits: document.limits,
            stage_start,
            stages,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn limits(&self) -> &FileLimits {
        &self.limits
    }

    pub fn stages(&self) -> &[FileStage] {
        &self.stages
    }

    /// Wall-clock instant the first stage is scheduled at, if any.
    pub fn stage_start(&self) -> Option<SystemTime> {
        self.stage_start
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Time left until the last stage ends, accounting for `stage-start`.
    pub fn remaining(&self) -> Duration {
        let total = self.total_duration();
        match self.stage_start.map(|at| SystemTime::now().duration_since(at)) {
            None => total,
            Some(Ok(elapsed)) => total.saturating_sub(elapsed),
            Some(Err(ahead)) => total + ahead.duration(),
        }
    }

    /// Build the trigger driving this schedule.
    pub fn trigger(&self) -> Result<Trigger, ConfigError> {
        TriggerOptions::builder()
            .shape(LoadShape::File(self.clone()))
            .build()
            .build()
    }
}

struct ActiveStage {
    index: usize,
    ends: Instant,
    interval: Duration,
    rate: BoxRateFunction,
    exported: Vec<String>,
}

/// Rate function running the stages of a [`FileSchedule`] back to back.
///
/// The sequence is anchored at its first evaluation, or at the file's
/// `stage-start` when one is set: stages that already ended relative to that
/// instant are skipped and the current one is entered part-way through. Before
/// a future `stage-start` the rate is 0. Every stage's generator is anchored on
/// the stage's own start.
pub struct FileSequence {
    schedule: FileSchedule,
    apply_env: bool,
    next: usize,
    next_start: Option<Instant>,
    active: Option<ActiveStage>,
}

impl FileSequence {
    pub fn new(schedule: FileSchedule) -> Self {
        Self {
            schedule,
            apply_env: true,
            next: 0,
            next_start: None,
            active: None,
        }
    }

    /// Whether stage parameters are exported to the process environment.
    pub fn with_environment(mut self, apply_env: bool) -> Self {
        self.apply_env = apply_env;
        self
    }

    /// Index of the stage currently running.
    pub fn current_stage(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.index)
    }

    fn anchor(&mut self, now: Instant) -> Instant {
        let Some(at) = self.schedule.stage_start else {
            return now;
        };
        let mut elapsed = match SystemTime::now().duration_since(at) {
            Ok(elapsed) => elapsed,
            Err(ahead) => return now + ahead.duration(),
        };
        while let Some(stage) = self.schedule.stages.get(self.next) {
            if elapsed < stage.duration {
                break;
            }
            elapsed -= stage.duration;
            self.next += 1;
        }
        if self.next > 0 {
            info!(skipped = self.next, "skipping stages already elapsed");
        }
        now.checked_sub(elapsed).unwrap_or(now)
    }

    fn advance(&mut self, now: Instant) -> Option<&mut ActiveStage> {
        loop {
            match self.active.as_ref().map(|a| now < a.ends) {
                Some(true) => break,
                Some(false) => self.leave(),
                None => {}
            }
            let start = self.next_start?;
            if now < start {
                return None;
            }
            let index = self.next;
            let ends = start + self.schedule.stages.get(index)?.duration;
            self.next += 1;
            self.next_start = Some(ends);
            if now >= ends {
                debug!(stage = index, "skipping elapsed stage");
                continue;
            }
            self.enter(index, start, ends);
        }
        self.active.as_mut()
    }

    fn enter(&mut self, index: usize, start: Instant, ends: Instant) {
        let Some(stage) = self.schedule.stages.get(index) else {
            return;
        };
        let (interval, rate) = match stage.build(start) {
            Ok(built) => built,
            Err(e) => {
                error!(stage = index, error = %e, "could not build stage, skipping it");
                return;
            }
        };
        let mut exported = Vec::new();
        if self.apply_env {
            for (key, value) in &stage.parameters {
                std::env::set_var(key, value);
                exported.push(key.clone());
            }
        }
        info!(
            stage = index,
            mode = stage.shape.name(),
            duration = %humantime::format_duration(stage.duration),
            "entering stage"
        );
        self.active = Some(ActiveStage {
            index,
            ends,
            interval,
            rate,
            exported,
        });
    }

    fn leave(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        for key in &active.exported {
            std::env::remove_var(key);
        }
        if active.index + 1 == self.schedule.stages.len() {
            info!("all stages complete");
        } else {
            debug!(stage = active.index, "leaving stage");
        }
    }
}

impl RateFunction for FileSequence {
    fn rate(&mut self, now: Instant) -> u64 {
        if self.next_start.is_none() {
            self.next_start = Some(self.anchor(now));
        }
        match self.advance(now) {
            Some(active) => active.rate.rate(now),
            None => 0,
        }
    }

    fn next_interval(&self) -> Option<Duration> {
        self.active.as_ref().map(|a| a.interval)
    }
}

impl Generator for FileSequence {
    fn interval(&self) -> Duration {
        self.schedule
            .stages
            .first()
            .map(FileStage::interval)
            .unwrap_or(Duration::from_secs(1))
    }

    fn duration(&self) -> Option<Duration> {
        Some(self.schedule.remaining())
    }

    fn describe(&self) -> String {
        format!(
            "{} file stages over {}",
            self.schedule.stages.len(),
            humantime::format_duration(self.schedule.total_duration())
        )
    }

    fn into_rate(self: Box<Self>) -> BoxRateFunction {
        self
    }
}

impl Drop for FileSequence {
    fn drop(&mut self) {
        self.leave();
    }
}
