use std::time::Duration;

use tokio::time::Instant;

use super::{BoxRateFunction, Generator, RateFunction, RateSpec};

/// A fixed number of iterations every rate unit.
///
/// The natural tick interval is the rate unit itself: `10/s` ticks once a
/// second and emits 10 on each tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantRate {
    spec: RateSpec,
}

impl ConstantRate {
    pub fn new(spec: RateSpec) -> Self {
        Self { spec }
    }
}

impl RateFunction for ConstantRate {
    fn rate(&mut self, _now: Instant) -> u64 {
        self.spec.count
    }
}

impl Generator for ConstantRate {
    fn interval(&self) -> Duration {
        self.spec.unit
    }

    fn describe(&self) -> String {
        format!(
            "{} iterations every {}",
            self.spec.count,
            humantime::format_duration(self.spec.unit)
        )
    }

    fn into_rate(self: Box<Self>) -> BoxRateFunction {
        self
    }
}
