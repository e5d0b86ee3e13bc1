use std::time::Duration;

use tokio::time::Instant;

use super::{BoxRateFunction, Generator, RateFunction, RateSpec, Stage, StagedRate};
use crate::error::ConfigError;

/// Linear ramp from one rate to another over a fixed duration.
///
/// Both rates must share the same unit, which is also the tick interval. After
/// the ramp duration has elapsed the rate drops to 0.
#[derive(Clone, Debug)]
pub struct RampRate {
    start: RateSpec,
    end: RateSpec,
    duration: Duration,
    staged: StagedRate,
}

impl RampRate {
    pub fn new(start: RateSpec, end: RateSpec, duration: Duration) -> Result<Self, ConfigError> {
        if start.unit != end.unit {
            return Err(ConfigError::MismatchedUnits {
                start: start.unit,
                end: end.unit,
            });
        }
        if start.count == end.count {
            return Err(ConfigError::FlatRamp(start.count));
        }
        if duration < start.unit {
            return Err(ConfigError::RampTooShort {
                duration,
                unit: start.unit,
            });
        }
        let staged = StagedRate::new(
            vec![Stage::new(duration, start.count, end.count)],
            start.unit,
        )?;
        Ok(Self {
            start,
            end,
            duration,
            staged,
        })
    }

    /// Anchor the ramp at `start` instead of the first evaluation.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.staged = self.staged.starting_at(start);
        self
    }
}

impl RateFunction for RampRate {
    fn rate(&mut self, now: Instant) -> u64 {
        self.staged.rate(now)
    }
}

impl Generator for RampRate {
    fn interval(&self) -> Duration {
        self.start.unit
    }

    fn duration(&self) -> Option<Duration> {
        Some(self.duration)
    }

    fn describe(&self) -> String {
        format!(
            "ramp from {} to {} over {}",
            self.start,
            self.end,
            humantime::format_duration(self.duration)
        )
    }

    fn into_rate(self: Box<Self>) -> BoxRateFunction {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> RateSpec {
        s.parse().unwrap()
    }

    #[test]
    fn ramp_up() {
        let start = Instant::now();
        let mut ramp = RampRate::new(spec("0/s"), spec("100/s"), Duration::from_secs(10))
            .unwrap()
            .starting_at(start);
        for i in 0..10u64 {
            assert_eq!(ramp.rate(start + Duration::from_secs(i)), i * 10);
        }
        assert_eq!(ramp.rate(start + Duration::from_secs(10)), 0);
    }

    #[test]
    fn ramp_down_anchors_on_first_call() {
        let start = Instant::now() + Duration::from_secs(3);
        let mut ramp = RampRate::new(spec("10/s"), spec("0/s"), Duration::from_secs(10)).unwrap();
        assert_eq!(ramp.rate(start), 10);
        assert_eq!(ramp.rate(start + Duration::from_secs(5)), 5);
    }

    #[test]
    fn rejects_equal_rates() {
        let err = RampRate::new(spec("5/s"), spec("5/s"), Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ConfigError::FlatRamp(5)));
    }

    #[test]
    fn rejects_mismatched_units() {
        let err =
            RampRate::new(spec("5/s"), spec("50/m"), Duration::from_secs(600)).unwrap_err();
        assert!(matches!(err, ConfigError::MismatchedUnits { .. }));
    }

    #[test]
    fn rejects_duration_shorter_than_unit() {
        let err =
            RampRate::new(spec("1/m"), spec("10/m"), Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, ConfigError::RampTooShort { .. }));
    }

    #[test]
    fn description() {
        let ramp = RampRate::new(spec("1/s"), spec("10/s"), Duration::from_secs(60)).unwrap();
        assert_eq!(ramp.describe(), "ramp from 1/1s to 10/1s over 1m");
        assert_eq!(ramp.interval(), Duration::from_secs(1));
        assert_eq!(ramp.duration(), Some(Duration::from_secs(60)));
    }
}
