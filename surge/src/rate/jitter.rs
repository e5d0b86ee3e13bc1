//! Bounded random perturbation of a rate.
//!
//! Every tick multiplies the requested rate by `1 + cos(u * 2π) * percent / 100`
//! with `u` uniform in `[0, 1)`, rounds to the nearest integer (never below 0)
//! and carries `requested - emitted` into the next tick. The carry keeps the
//! long-run total equal to the requested total.
use std::f64::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::Instant;

use super::{BoxRateFunction, RateFunction};

/// Wrap `rate` with `percent` jitter. A zero percentage returns `rate` as is.
pub fn with_jitter(rate: BoxRateFunction, percent: f64) -> BoxRateFunction {
    with_jitter_rng(rate, percent, StdRng::from_entropy())
}

/// [`with_jitter`] with an explicit random source.
pub fn with_jitter_rng<R>(rate: BoxRateFunction, percent: f64, rng: R) -> BoxRateFunction
where
    R: Rng + Send + 'static,
{
    if percent == 0.0 {
        return rate;
    }
    Box::new(Jitter {
        inner: rate,
        percent,
        remainder: 0.0,
        rng,
    })
}

struct Jitter<R> {
    inner: BoxRateFunction,
    percent: f64,
    remainder: f64,
    rng: R,
}

impl<R: Rng + Send> RateFunction for Jitter<R> {
    fn rate(&mut self, now: Instant) -> u64 {
        let requested = self.inner.rate(now) as f64 + self.remainder;
        let factor = 1.0 + (self.rng.gen::<f64>() * TAU).cos() * self.percent / 100.0;
        let emitted = (requested * factor).round().max(0.0);
        self.remainder = requested - emitted;
        emitted as u64
    }

    fn next_interval(&self) -> Option<std::time::Duration> {
        self.inner.next_interval()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::rngs::mock::StepRng;

    use super::*;

    fn fixed(rate: u64) -> BoxRateFunction {
        Box::new(move |_: Instant| rate)
    }

    #[test]
    fn zero_percent_is_identity() {
        let mut rate = with_jitter(fixed(13), 0.0);
        let now = Instant::now();
        for _ in 0..100 {
            assert_eq!(rate.rate(now), 13);
        }
    }

    #[test]
    fn cosine_peak_applies_full_percentage() {
        // u = 0 gives cos(0) = 1, the maximum upward jitter
        let mut rate = with_jitter_rng(fixed(100), 20.0, StepRng::new(0, 0));
        let now = Instant::now();
        assert_eq!(rate.rate(now), 120);
        // the 20 over-emitted are paid back on the next tick: (100 - 20) * 1.2 = 96
        assert_eq!(rate.rate(now), 96);
    }

    #[test]
    fn emitted_values_stay_within_bounds() {
        let mut rate = with_jitter_rng(fixed(1_000), 10.0, StdRng::seed_from_u64(42));
        let now = Instant::now();
        for _ in 0..1_000 {
            let n = rate.rate(now);
            assert!((780..=1_230).contains(&n), "{n} out of bounds");
        }
    }

    proptest! {
        #[test]
        fn long_run_total_is_preserved(
            requested in proptest::collection::vec(0u64..500, 1..400),
            percent in 1.0f64..50.0,
            seed in any::<u64>(),
        ) {
            let mut queue = requested.clone().into_iter();
            let inner: BoxRateFunction = Box::new(move |_: Instant| queue.next().unwrap_or(0));
            let mut rate = with_jitter_rng(inner, percent, StdRng::seed_from_u64(seed));
            let now = Instant::now();

            let mut emitted = 0u64;
            for _ in 0..requested.len() {
                emitted += rate.rate(now);
            }
            // whatever is left in the carry is bounded by one jittered tick
            let total: u64 = requested.iter().sum();
            let slack = (requested.iter().max().copied().unwrap_or(0) as f64 * 2.0 + 2.0) as u64;
            prop_assert!(emitted.abs_diff(total) <= slack, "emitted {} vs requested {}", emitted, total);
        }
    }
}
