//! Surge: rate-driven load generation for Rust.
//!
//! Surge starts iterations of your test logic at a shaped rate, on a bounded
//! pool of workers, and reports what happened. When the pool cannot keep up it
//! does not queue: start signals that find no free worker are *dropped* and
//! counted, so a saturated system shows up in the results instead of being
//! hidden behind a growing backlog.
//!
//! # Architecture
//!
//! - [`rate`]: rate functions, "how many iterations should start on this tick",
//!   and the generators that produce them (constant, ramp, staged, gaussian and
//!   a file-driven sequence of stages), plus jitter and sub-tick distribution.
//! - [`trigger`]: turns a [`LoadShape`] and its decorations into a [`Trigger`],
//!   and the trigger worker that evaluates the rate every tick and pushes start
//!   signals.
//! - [`executor`]: the worker pools. The triggered pool runs one iteration per
//!   start signal; the continuous pool keeps a fixed population of workers busy.
//! - [`run`]: the orchestrator tying a [`Scenario`], a trigger and
//!   [`RunOptions`] together: setup, running, draining, teardown.
//! - [`report`]: the [`Reporter`] capability a run reports through, and the
//!   progress and summary reports it receives.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use surge::{BasicScenario, BoxError, Run, RunOptions, StdoutReporter, TriggerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     surge::logging::init("surge=info")?;
//!     // NEVER build heavy objects like clients inside the iteration
//!     let client = reqwest::Client::new();
//!
//!     let result = Run::builder()
//!         .scenario(
//!             BasicScenario::builder()
//!                 .name("http")
//!                 .iteration(move || {
//!                     let client = client.clone();
//!                     async move {
//!                         client
//!                             .get("http://localhost:3000")
//!                             .send()
//!                             .await?
//!                             .error_for_status()?;
//!                         Ok::<(), BoxError>(())
//!                     }
//!                 })
//!                 .build(),
//!         )
//!         // ramp from 0 to 100 per second over 30s, then hold for a minute
//!         .trigger(
//!             TriggerOptions::staged("0s:0, 30s:100, 1m:100", "1s")?.build()?,
//!         )
//!         .options(RunOptions::builder().concurrency(200).build())
//!         .reporter(StdoutReporter)
//!         .build()
//!         .execute()
//!         .await;
//!
//!     assert!(result.passed(), "{:?}", result.verdict().reasons);
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: [`BasicScenario`] and [`StdoutReporter`]. (Enabled by default)

pub mod aggregate;
pub mod error;
/// Worker pools that run iterations
pub mod executor;
pub mod logging;
pub mod metric;
/// Rate functions and load shapes
pub mod rate;
/// Reports and reporters
pub mod report;
pub mod result;
/// The run orchestrator
pub mod run;
pub mod scenario;
/// Triggers and the trigger worker
pub mod trigger;

pub use aggregate::Aggregate;
pub use error::{BoxError, ConfigError, RunError};
pub use metric::{IterationMetric, Outcome, Step};
pub use rate::{Distribution, FileSchedule, GaussianParams, RateFunction, RateSpec};
pub use report::{NoopReporter, ProgressReport, Reporter, RunSummary, TracingReporter};
pub use result::{RunResult, StopReason, Thresholds, Verdict};
pub use run::{Run, RunOptions};
pub use scenario::{Iteration, IterationContext, Scenario};
pub use trigger::{LoadShape, Trigger, TriggerOptions};

#[cfg(feature = "builtins")]
pub use report::StdoutReporter;
#[cfg(feature = "builtins")]
pub use scenario::BasicScenario;
