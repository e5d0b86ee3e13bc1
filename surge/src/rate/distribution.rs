//! Sub-tick distribution of a coarse rate.
//!
//! A generator ticking every second with a rate of 50 would start 50 iterations
//! in one burst at the top of each second. Distributing splits every coarse
//! tick into 100ms sub-ticks and spreads the coarse count across them while
//! keeping the per-cycle total exact.
//!
//! # Regular
//!
//! The coarse rate is evaluated once per cycle of `steps = interval / 100ms`
//! sub-ticks. Every sub-tick adds `rate / steps` to an accumulator, emits its
//! integer part and keeps the fraction:
//!
//! ```text
//! rate = 7, steps = 9
//! accumulated: .78 1.56 1.33 1.11 .89 1.67 1.44 1.22 1.00
//! emitted:      0    1    1    1   0    1    1    1    1   (sum 7)
//! ```
//!
//! Before taking the integer part the accumulator is rounded *up* to a
//! resolution of 1e-7, so that a value like `0.99999999` produced by
//! floating-point error still emits its unit on the last sub-tick.
//!
//! # Random
//!
//! Same cycle structure, but every sub-tick except the last draws a uniformly
//! random share of what remains of the coarse rate. The last sub-tick emits the
//! remainder, so the total is still exact.
use std::{fmt, str::FromStr, time::Duration};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{BoxRateFunction, RateFunction};
use crate::error::ConfigError;

/// Sub-tick interval used by the regular and random policies.
pub const DISTRIBUTION_INTERVAL: Duration = Duration::from_millis(100);

/// Accumulator resolution.
const RESOLUTION: f64 = 1e7;

/// How a coarse rate is spread across sub-ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Emit the coarse rate in one burst per natural tick.
    None,
    /// Spread deterministically, alternating large and small sub-ticks.
    #[default]
    Regular,
    /// Spread randomly while preserving the total.
    Random,
}

impl FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "regular" => Ok(Self::Regular),
            "random" => Ok(Self::Random),
            _ => Err(ConfigError::UnknownDistribution(s.to_string())),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Regular => "regular",
            Self::Random => "random",
        })
    }
}

/// Distribute `rate` evaluated every `interval` according to `policy`.
///
/// Returns the sub-tick interval and the sub-tick rate function. `none`, and
/// any interval already at or below [`DISTRIBUTION_INTERVAL`], return the
/// inputs unchanged. The random policy draws from an entropy-seeded generator;
/// use [`distribute_with_rng`] for reproducible placement.
pub fn distribute(
    policy: Distribution,
    interval: Duration,
    rate: BoxRateFunction,
) -> (Duration, BoxRateFunction) {
    distribute_with_rng(policy, interval, rate, StdRng::from_entropy())
}

/// Tick interval a rate evaluated every `interval` ends up with under `policy`.
pub fn distributed_interval(policy: Distribution, interval: Duration) -> Duration {
    if policy == Distribution::None || interval <= DISTRIBUTION_INTERVAL {
        interval
    } else {
        DISTRIBUTION_INTERVAL
    }
}

/// [`distribute`] with an explicit random source for the random policy.
pub fn distribute_with_rng<R>(
    policy: Distribution,
    interval: Duration,
    rate: BoxRateFunction,
    rng: R,
) -> (Duration, BoxRateFunction)
where
    R: Rng + Send + 'static,
{
    if distributed_interval(policy, interval) == interval {
        return (interval, rate);
    }
    let steps = (interval.as_nanos() / DISTRIBUTION_INTERVAL.as_nanos()) as u64;
    let distributed: BoxRateFunction = match policy {
        Distribution::Regular => Box::new(RegularDistribution::new(rate, steps)),
        Distribution::Random => Box::new(RandomDistribution::new(rate, steps, rng)),
        Distribution::None => rate,
    };
    (DISTRIBUTION_INTERVAL, distributed)
}

/// Deterministic even spread of a coarse rate over `steps` sub-ticks.
pub struct RegularDistribution {
    inner: BoxRateFunction,
    steps: u64,
    step: u64,
    per_step: f64,
    accumulated: f64,
}

impl RegularDistribution {
    pub fn new(inner: BoxRateFunction, steps: u64) -> Self {
        Self {
            inner,
            steps: steps.max(1),
            step: 0,
            per_step: 0.0,
            accumulated: 0.0,
        }
    }
}

impl RateFunction for RegularDistribution {
    fn rate(&mut self, now: Instant) -> u64 {
        if self.step == 0 {
            self.per_step = self.inner.rate(now) as f64 / self.steps as f64;
            self.accumulated = 0.0;
        }
        self.step = (self.step + 1) % self.steps;

        self.accumulated = ((self.accumulated + self.per_step) * RESOLUTION).ceil() / RESOLUTION;
        let emitted = self.accumulated.floor();
        self.accumulated -= emitted;
        emitted as u64
    }
}

/// Random spread of a coarse rate over `steps` sub-ticks.
pub struct RandomDistribution<R> {
    inner: BoxRateFunction,
    steps: u64,
    step: u64,
    remaining: u64,
    rng: R,
}

impl<R: Rng + Send> RandomDistribution<R> {
    pub fn new(inner: BoxRateFunction, steps: u64, rng: R) -> Self {
        Self {
            inner,
            steps: steps.max(1),
            step: 0,
            remaining: 0,
            rng,
        }
    }
}

impl<R: Rng + Send> RateFunction for RandomDistribution<R> {
    fn rate(&mut self, now: Instant) -> u64 {
        if self.step == 0 {
            self.remaining = self.inner.rate(now);
        }
        let last = self.step + 1 == self.steps;
        self.step = (self.step + 1) % self.steps;

        let emitted = if last || self.remaining == 0 {
            self.remaining
        } else {
            self.rng.gen_range(0..=self.remaining).min(self.remaining)
        };
        self.remaining -= emitted;
        emitted
    }
}
