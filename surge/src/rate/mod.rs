//! Rate functions: "how many iterations should be starting right now".
//!
//! A [`RateFunction`] maps a tick instant to a non-negative integer. Everything
//! that shapes load is built from this one abstraction:
//!
//! - generators produce a rate function together with its natural tick interval
//!   ([`ConstantRate`], [`RampRate`], [`StagedRate`], [`GaussianRate`] and the
//!   file-driven [`FileSequence`]),
//! - decorators wrap an existing rate function without changing the long-run
//!   total ([`with_jitter`], [`distribute`]).
//!
//! Rate functions may carry internal state (fractional remainders, the current
//! stage index). They take `&mut self` and are owned by a single trigger task, so
//! they are always evaluated sequentially and in tick order.
//!
//! # Fractional carrying
//!
//! Several generators compute a real-valued rate per tick. The integer part is
//! emitted and the fraction is carried into the next tick:
//!
//! ```text
//! total     = rate_f + fractional
//! emitted   = floor(total)
//! fractional = total - emitted
//! ```
//!
//! so a rate of 0.25 per tick emits one iteration every fourth tick instead of
//! never emitting anything.
pub mod constant;
pub mod distribution;
pub mod file;
pub mod gaussian;
pub mod jitter;
pub mod ramp;
pub mod spec;
pub mod staged;

pub use constant::ConstantRate;
pub use distribution::{
    distribute, distribute_with_rng, distributed_interval, Distribution, DISTRIBUTION_INTERVAL,
};
pub use file::{FileLimits, FileSchedule, FileSequence, FileStage};
pub use gaussian::{GaussianParams, GaussianRate};
pub use jitter::{with_jitter, with_jitter_rng};
pub use ramp::RampRate;
pub use spec::RateSpec;
pub use staged::{parse_stages, Stage, StagedRate};

use std::time::Duration;

use tokio::time::Instant;

/// A function of tick time to the number of iterations to start on that tick.
///
/// Implemented for every `FnMut(Instant) -> u64 + Send` closure, which is handy
/// for tests and ad hoc shapes:
///
/// ```rust
/// use surge::rate::{BoxRateFunction, RateFunction};
/// use tokio::time::Instant;
///
/// let mut rate: BoxRateFunction = Box::new(|_: Instant| 3u64);
/// assert_eq!(rate.rate(Instant::now()), 3);
/// ```
pub trait RateFunction: Send {
    /// Number of iterations to start at `now`.
    fn rate(&mut self, now: Instant) -> u64;

    /// Interval until the next evaluation, when it differs from the interval
    /// the rate function was built with.
    ///
    /// Only rate functions whose tick interval changes over time (the file
    /// sequencer moving between stages) return `Some`.
    fn next_interval(&self) -> Option<Duration> {
        None
    }
}

impl<F> RateFunction for F
where
    F: FnMut(Instant) -> u64 + Send,
{
    fn rate(&mut self, now: Instant) -> u64 {
        self(now)
    }
}

/// Owned, type-erased rate function.
pub type BoxRateFunction = Box<dyn RateFunction>;

/// A load shape: a rate function that knows its own natural tick interval and,
/// when it is finite, how long it lasts.
pub trait Generator: RateFunction {
    /// Interval at which [`RateFunction::rate`] is meant to be evaluated.
    fn interval(&self) -> Duration;

    /// How long the shape lasts; `None` runs until the run's own limits apply.
    fn duration(&self) -> Option<Duration> {
        None
    }

    /// Human readable summary, e.g. `10 iterations every 1s`.
    fn describe(&self) -> String;

    /// Erase down to the plain rate function for decoration.
    fn into_rate(self: Box<Self>) -> BoxRateFunction;
}

/// Owned, type-erased generator.
pub type BoxGenerator = Box<dyn Generator>;

/// Emit the integer part of `rate + fractional`, returning it together with the
/// new fractional carry. Negative totals emit nothing and carry nothing.
pub(crate) fn carry_fraction(rate: f64, fractional: f64) -> (u64, f64) {
    let total = rate + fractional;
    if !total.is_finite() || total <= 0.0 {
        return (0, 0.0);
    }
    let emitted = total.floor();
    if emitted >= u64::MAX as f64 {
        return (u64::MAX, 0.0);
    }
    (emitted as u64, total - emitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod carry_fraction {
        use super::*;

        #[test]
        fn fractional_accumulation() {
            let mut carry = 0.;
            let expected = [(0, 0.25), (0, 0.5), (0, 0.75), (1, 0.)];
            for i in 0..12 {
                let (n, f) = carry_fraction(0.25, carry);
                carry = f;
                assert_eq!((n, f), expected[i % 4]);
            }
        }

        #[test]
        fn negative_value_returns_0() {
            assert_eq!(carry_fraction(-100., 0.5), (0, 0.));
        }

        #[test]
        fn extreme_rate_saturates() {
            assert_eq!(carry_fraction(f64::MAX, 0.), (u64::MAX, 0.));
        }

        #[test]
        fn nan_is_ignored() {
            assert_eq!(carry_fraction(f64::NAN, 0.3), (0, 0.));
        }
    }

    #[test]
    fn closures_are_rate_functions() {
        let mut calls = 0u64;
        let mut rate = move |_: Instant| {
            calls += 1;
            calls
        };
        let now = Instant::now();
        assert_eq!(RateFunction::rate(&mut rate, now), 1);
        assert_eq!(RateFunction::rate(&mut rate, now), 2);
        assert_eq!(rate.next_interval(), None);
    }
}
