//! Piecewise-linear rate across a list of stages.
use std::time::Duration;

use tokio::time::Instant;

use super::{spec::parse_duration, BoxRateFunction, Generator, RateFunction};
use crate::error::ConfigError;

/// One segment of a staged profile: ramp from `start_target` to `end_target`
/// over `duration`.
///
/// Use `Stage::new(Duration::from_secs(10), 0, 100)` to ramp from 0 to 100
/// iterations per tick over 10s. A zero `duration` is a jump: it is skipped
/// immediately and the next stage starts from its `end_target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub start_target: u64,
    pub end_target: u64,
}

impl Stage {
    pub fn new(duration: Duration, start_target: u64, end_target: u64) -> Self {
        Self {
            duration,
            start_target,
            end_target,
        }
    }

    /// Truncated linear interpolation at `elapsed` into the stage.
    fn target_at(&self, elapsed: Duration) -> u64 {
        let d = self.duration.as_nanos() as i128;
        if d == 0 {
            return self.end_target;
        }
        let e = elapsed.as_nanos().min(self.duration.as_nanos()) as i128;
        let start = self.start_target as i128;
        let end = self.end_target as i128;
        // (start * (d - e) + end * e) / d, floor on non-negative values
        let value = (start * d + (end - start) * e) / d;
        value.clamp(0, u64::MAX as i128) as u64
    }
}

/// Parse `"<duration>:<target>, <duration>:<target>, ..."` into stages.
///
/// Boundaries are cumulative: each stage starts where the previous one ended,
/// and the first one starts from 0.
///
/// ```rust
/// use std::time::Duration;
/// use surge::rate::{parse_stages, Stage};
///
/// let stages = parse_stages("0s:5, 10s:10").unwrap();
/// assert_eq!(stages, vec![
///     Stage::new(Duration::ZERO, 0, 5),
///     Stage::new(Duration::from_secs(10), 5, 10),
/// ]);
/// ```
pub fn parse_stages(input: &str) -> Result<Vec<Stage>, ConfigError> {
    let mut stages = Vec::new();
    let mut previous = 0;
    for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let invalid = || ConfigError::InvalidStage(item.to_string());
        let (duration, target) = item.split_once(':').ok_or_else(invalid)?;
        let duration = parse_duration(duration).map_err(|_| invalid())?;
        let target = target.trim().parse::<u64>().map_err(|_| invalid())?;
        stages.push(Stage::new(duration, previous, target));
        previous = target;
    }
    if stages.is_empty() {
        return Err(ConfigError::EmptyStages);
    }
    Ok(stages)
}

/// Rate function walking a list of [`Stage`]s.
///
/// The sequence is anchored at the first evaluation unless an explicit start
/// is given with [`StagedRate::starting_at`]. Stage boundaries are advanced
/// lazily on every call, so a sparse caller never skips a stage's accounting,
/// and once the last stage ends the rate is 0.
#[derive(Clone, Debug)]
pub struct StagedRate {
    stages: Vec<Stage>,
    interval: Duration,
    start: Option<Instant>,
    current: usize,
    current_start: Option<Instant>,
}

impl StagedRate {
    pub fn new(stages: Vec<Stage>, interval: Duration) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        Ok(Self {
            stages,
            interval,
            start: None,
            current: 0,
            current_start: None,
        })
    }

    /// Parse a stage list (see [`parse_stages`]) evaluated every `interval`.
    pub fn parse(input: &str, interval: Duration) -> Result<Self, ConfigError> {
        Self::new(parse_stages(input)?, interval)
    }

    /// Anchor the first stage at `start` instead of the first evaluation.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

impl RateFunction for StagedRate {
    fn rate(&mut self, now: Instant) -> u64 {
        let start = *self.start.get_or_insert(now);
        let mut stage_start = *self.current_start.get_or_insert(start);
        if now < stage_start {
            return 0;
        }

        while let Some(stage) = self.stages.get(self.current) {
            let stage_end = stage_start + stage.duration;
            if now < stage_end {
                break;
            }
            stage_start = stage_end;
            self.current += 1;
            tracing::debug!(stage = self.current, "staged rate advanced");
        }
        self.current_start = Some(stage_start);

        match self.stages.get(self.current) {
            Some(stage) => stage.target_at(now - stage_start),
            None => 0,
        }
    }
}

impl Generator for StagedRate {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn duration(&self) -> Option<Duration> {
        Some(self.total_duration())
    }

    fn describe(&self) -> String {
        let stages = self
            .stages
            .iter()
            .map(|s| format!("{}:{}", humantime::format_duration(s.duration), s.end_target))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "staged [{stages}] per {}",
            humantime::format_duration(self.interval)
        )
    }

    fn into_rate(self: Box<Self>) -> BoxRateFunction {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_secs(1);

    mod parse {
        use super::*;

        #[test]
        fn cumulative_boundaries() {
            let stages = parse_stages("10s:10, 5s:10,1m:0").unwrap();
            assert_eq!(
                stages,
                vec![
                    Stage::new(Duration::from_secs(10), 0, 10),
                    Stage::new(Duration::from_secs(5), 10, 10),
                    Stage::new(Duration::from_secs(60), 10, 0),
                ]
            );
        }

        #[test]
        fn rejects_malformed_items() {
            for bad in ["10s", "10s:x", "ten:10", "10s:-1"] {
                assert!(
                    matches!(parse_stages(bad), Err(ConfigError::InvalidStage(_))),
                    "{bad}"
                );
            }
            assert!(matches!(parse_stages(" , "), Err(ConfigError::EmptyStages)));
        }
    }

    #[test]
    fn interpolates_then_stops() {
        let start = Instant::now();
        let mut rate = StagedRate::parse("0s:0,10s:10", TICK).unwrap();
        for i in 0..10 {
            assert_eq!(rate.rate(start + TICK * i), i as u64);
        }
        assert_eq!(rate.rate(start + Duration::from_secs(10)), 0);
        assert_eq!(rate.rate(start + Duration::from_secs(60)), 0);
    }

    #[test]
    fn sub_second_offsets_truncate() {
        let start = Instant::now();
        let mut rate = StagedRate::parse("0s:0,10s:10", TICK)
            .unwrap()
            .starting_at(start);
        assert_eq!(rate.rate(start + Duration::from_millis(500)), 0);
        assert_eq!(rate.rate(start + Duration::from_millis(2500)), 2);
        assert_eq!(rate.rate(start + Duration::from_millis(9999)), 9);
    }

    #[test]
    fn ramp_down() {
        let start = Instant::now();
        let mut rate = StagedRate::parse("0s:100,10s:0", TICK)
            .unwrap()
            .starting_at(start);
        for i in 0..10u64 {
            assert_eq!(rate.rate(start + Duration::from_secs(i)), 100 - 10 * i);
        }
    }

    #[test]
    fn sparse_calls_never_skip_stages() {
        let start = Instant::now();
        let mut rate = StagedRate::parse("2s:10, 2s:10, 2s:20", TICK)
            .unwrap()
            .starting_at(start);
        // straight into the third stage
        assert_eq!(rate.rate(start + Duration::from_secs(5)), 15);
        assert_eq!(rate.current, 2);
        assert_eq!(rate.rate(start + Duration::from_secs(6)), 0);
    }

    #[test]
    fn before_explicit_start_is_zero() {
        let now = Instant::now();
        let mut rate = StagedRate::parse("10s:10", TICK)
            .unwrap()
            .starting_at(now + Duration::from_secs(5));
        assert_eq!(rate.rate(now), 0);
        assert_eq!(rate.rate(now + Duration::from_secs(10)), 5);
    }

    #[test]
    fn total_duration_and_description() {
        let rate = StagedRate::parse("0s:1, 10s:10, 50s:0", TICK).unwrap();
        assert_eq!(rate.total_duration(), Duration::from_secs(60));
        assert_eq!(rate.describe(), "staged [0s:1, 10s:10, 50s:0] per 1s");
    }
}
