//! Bell-shaped rate repeating over a fixed window.
//!
//! The rate follows the probability density function of a normal distribution
//! centred on `peak` (an offset into the repeat window) with standard deviation
//! `std_dev`. The curve is scaled so that one full window emits `volume`
//! iterations:
//!
//! ```text
//! covered    = Φ((repeat - interval - peak) / σ) - Φ((0 - peak) / σ)
//! multiplier = volume / covered
//! rate(t)    = multiplier * weight * pdf(t) * interval
//! ```
//!
//! `covered` is the probability mass that actually falls inside the sampled part
//! of the window `[0, repeat - interval]`; dividing by it compensates for peaks
//! close to the window edges or spreads wider than the window.
//!
//! Optional per-repetition weights (for example a weekday profile with a daily
//! window) scale each window by `weights[i % len] / mean(weights)`, so a full
//! weight cycle still emits `volume * len` iterations.
use std::{
    f64::consts::{PI, SQRT_2},
    time::Duration,
};

use tokio::time::Instant;

use super::{carry_fraction, BoxRateFunction, Generator, RateFunction};
use crate::error::ConfigError;

/// Parameters of a [`GaussianRate`].
#[derive(Clone, Debug, PartialEq)]
pub struct GaussianParams {
    /// Iterations to emit over one repeat window.
    pub volume: f64,
    /// Length of the window the curve repeats over.
    pub repeat: Duration,
    /// Offset of the peak into the window.
    pub peak: Duration,
    pub std_dev: Duration,
    /// Tick interval at which the curve is sampled.
    pub interval: Duration,
    /// Per-repetition scaling, cycled through window by window.
    pub weights: Vec<f64>,
}

/// Rate function emitting a repeated gaussian-shaped volume.
#[derive(Clone, Debug)]
pub struct GaussianRate {
    params: GaussianParams,
    multiplier: f64,
    mean_weight: f64,
    start: Option<Instant>,
    remainder: f64,
}

impl GaussianRate {
    pub fn new(params: GaussianParams) -> Result<Self, ConfigError> {
        let invalid = |field, reason: &str| ConfigError::InvalidGaussian {
            field,
            reason: reason.to_string(),
        };
        if !params.volume.is_finite() || params.volume < 0.0 {
            return Err(invalid("volume", "must be a finite, non-negative number"));
        }
        if params.std_dev.is_zero() {
            return Err(invalid("standard-deviation", "must be greater than zero"));
        }
        if params.interval.is_zero() {
            return Err(invalid("iteration-frequency", "must be greater than zero"));
        }
        if params.repeat <= params.interval {
            return Err(invalid(
                "repeat",
                "must be longer than the iteration frequency",
            ));
        }
        if params.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("weights", "must be finite, non-negative numbers"));
        }
        let mean_weight = if params.weights.is_empty() {
            1.0
        } else {
            params.weights.iter().sum::<f64>() / params.weights.len() as f64
        };
        if mean_weight <= 0.0 {
            return Err(invalid("weights", "at least one weight must be positive"));
        }

        let mean = params.peak.as_secs_f64();
        let sigma = params.std_dev.as_secs_f64();
        let last = (params.repeat - params.interval).as_secs_f64();
        let covered = normal_cdf(last, mean, sigma) - normal_cdf(0.0, mean, sigma);
        if covered <= f64::EPSILON {
            return Err(invalid(
                "peak",
                "places no volume inside the repeat window",
            ));
        }

        Ok(Self {
            multiplier: params.volume / covered,
            mean_weight,
            params,
            start: None,
            remainder: 0.0,
        })
    }

    /// Anchor the first window at `start` instead of the first evaluation.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.start = Some(start);
        self
    }

    pub fn params(&self) -> &GaussianParams {
        &self.params
    }

    fn weight(&self, window: u128) -> f64 {
        if self.params.weights.is_empty() {
            return 1.0;
        }
        let i = (window % self.params.weights.len() as u128) as usize;
        self.params.weights[i] / self.mean_weight
    }
}

impl RateFunction for GaussianRate {
    fn rate(&mut self, now: Instant) -> u64 {
        let start = *self.start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start).as_nanos();
        let repeat = self.params.repeat.as_nanos();
        let window = elapsed / repeat;
        let offset = Duration::from_nanos((elapsed % repeat) as u64).as_secs_f64();

        let density = normal_pdf(
            offset,
            self.params.peak.as_secs_f64(),
            self.params.std_dev.as_secs_f64(),
        );
        let rate = self.multiplier
            * self.weight(window)
            * density
            * self.params.interval.as_secs_f64();

        let (emitted, remainder) = carry_fraction(rate, self.remainder);
        self.remainder = remainder;
        emitted
    }
}

impl Generator for GaussianRate {
    fn interval(&self) -> Duration {
        self.params.interval
    }

    fn describe(&self) -> String {
        format!(
            "gaussian {} iterations every {} peaking at {} (σ {})",
            self.params.volume,
            humantime::format_duration(self.params.repeat),
            humantime::format_duration(self.params.peak),
            humantime::format_duration(self.params.std_dev),
        )
    }

    fn into_rate(self: Box<Self>) -> BoxRateFunction {
        self
    }
}

fn normal_pdf(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
}

fn normal_cdf(x: f64, mean: f64, sigma: f64) -> f64 {
    0.5 * (1.0 + erf((x - mean) / (sigma * SQRT_2)))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn params() -> GaussianParams {
        GaussianParams {
            volume: 10_000.0,
            repeat: MINUTE * 10,
            peak: MINUTE * 5,
            std_dev: MINUTE,
            interval: Duration::from_secs(1),
            weights: vec![],
        }
    }

    fn window_total(rate: &mut GaussianRate, start: Instant, window: u32) -> u64 {
        let p = rate.params().clone();
        let ticks = (p.repeat.as_nanos() / p.interval.as_nanos()) as u32;
        (0..ticks)
            .map(|k| rate.rate(start + p.repeat * window + p.interval * k))
            .sum()
    }

    fn assert_close(actual: u64, expected: f64) {
        let error = (actual as f64 - expected).abs() / expected;
        assert!(error < 0.0015, "{actual} is not within 0.15% of {expected}");
    }

    #[test]
    fn erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 2e-7);
        assert!((erf(-2.0) + 0.995_322_27).abs() < 2e-7);
    }

    #[test]
    fn window_volume_matches_target() {
        let start = Instant::now();
        let mut rate = GaussianRate::new(params()).unwrap().starting_at(start);
        assert_close(window_total(&mut rate, start, 0), 10_000.0);
        assert_close(window_total(&mut rate, start, 1), 10_000.0);
    }

    #[test]
    fn wide_spread_is_compensated() {
        // most of the mass falls outside the window, the multiplier scales it back
        let start = Instant::now();
        let mut rate = GaussianRate::new(GaussianParams {
            repeat: MINUTE * 60,
            peak: MINUTE * 30,
            std_dev: MINUTE * 60,
            ..params()
        })
        .unwrap()
        .starting_at(start);
        assert_close(window_total(&mut rate, start, 0), 10_000.0);
    }

    #[test]
    fn peaks_at_the_configured_offset() {
        let start = Instant::now();
        let mut rate = GaussianRate::new(params()).unwrap().starting_at(start);
        let at = |rate: &mut GaussianRate, secs: u64| rate.rate(start + Duration::from_secs(secs));
        let early = at(&mut rate, 60);
        let peak = at(&mut rate, 300);
        let late = at(&mut rate, 540);
        assert!(peak > early && peak > late);
        // 10000 / (σ√2π) per second at the peak
        assert!((65..=67).contains(&peak), "peak {peak}");
    }

    #[test]
    fn weights_scale_each_window() {
        let start = Instant::now();
        let mut rate = GaussianRate::new(GaussianParams {
            weights: vec![1.0, 3.0],
            ..params()
        })
        .unwrap()
        .starting_at(start);
        assert_close(window_total(&mut rate, start, 0), 5_000.0);
        assert_close(window_total(&mut rate, start, 1), 15_000.0);
        assert_close(window_total(&mut rate, start, 2), 5_000.0);
    }

    #[test]
    fn rejects_invalid_parameters() {
        let cases = [
            GaussianParams {
                std_dev: Duration::ZERO,
                ..params()
            },
            GaussianParams {
                interval: Duration::ZERO,
                ..params()
            },
            GaussianParams {
                repeat: Duration::from_secs(1),
                ..params()
            },
            GaussianParams {
                volume: -1.0,
                ..params()
            },
            GaussianParams {
                weights: vec![0.0, 0.0],
                ..params()
            },
            GaussianParams {
                weights: vec![1.0, f64::NAN],
                ..params()
            },
            GaussianParams {
                peak: Duration::from_secs(60 * 60 * 24),
                std_dev: Duration::from_secs(1),
                ..params()
            },
        ];
        for case in cases {
            assert!(
                matches!(
                    GaussianRate::new(case.clone()),
                    Err(ConfigError::InvalidGaussian { .. })
                ),
                "{case:?} should be rejected"
            );
        }
    }
}
