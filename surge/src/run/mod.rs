//! The run orchestrator.
//!
//! A [`Run`] walks through **setup → running → draining → teardown → done**:
//!
//! - *setup* calls [`Scenario::setup`] once. A failure skips straight to
//!   teardown and no iteration is attempted.
//! - *running* starts the worker pool and the trigger together and waits for
//!   the first of: the interrupt, the iteration ceiling, or the duration timer.
//!   The timer fires slightly before the configured duration so that one more
//!   tick cannot sneak in at the boundary.
//! - *draining* stops the trigger, closes the pool and waits for in-flight
//!   iterations, at most [`RunOptions::drain_timeout`]; workers still running
//!   after that are aborted and the overrun is recorded, without failing the
//!   run.
//! - *teardown* calls [`Scenario::teardown`] exactly once, whatever happened
//!   before.
//! - *done* merges every worker's statistics into a [`RunResult`] and hands
//!   its summary to the reporter.
//!
//! ```rust
//! use std::time::Duration;
//! use surge::{BasicScenario, NoopReporter, Run, RunOptions, TriggerOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let result = Run::builder()
//!     .scenario(
//!         BasicScenario::builder()
//!             .name("noop")
//!             .iteration(|| async { Ok::<(), surge::BoxError>(()) })
//!             .build(),
//!     )
//!     .trigger(TriggerOptions::constant("10/100ms").unwrap().build().unwrap())
//!     .options(
//!         RunOptions::builder()
//!             .max_duration(Duration::from_millis(100))
//!             .concurrency(100)
//!             .build(),
//!     )
//!     .reporter(NoopReporter)
//!     .build()
//!     .execute()
//!     .await;
//! assert_eq!(result.started, 10);
//! # }
//! ```
pub mod progress;

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::{future::join_all, FutureExt};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    error::{BoxError, RunError},
    executor::{panic_message, ContinuousPool, PoolManager, TriggeredPool},
    metric::{IterationMetric, Outcome, Step},
    rate::FileLimits,
    report::{Reporter, TracingReporter},
    result::{RunResult, StopReason, Thresholds},
    scenario::{Iteration, Scenario},
    trigger::{Trigger, TriggerKind, TriggerStats, TriggerWorker},
};

/// How long before the configured duration the run timer fires.
pub const TIMER_SLACK: Duration = Duration::from_millis(10);

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Limits and thresholds of a run.
#[derive(Clone, Debug, TypedBuilder)]
pub struct RunOptions {
    /// Stop after this long. Shapes with a finite duration also stop the run
    /// when they end, whichever comes first.
    #[builder(default, setter(strip_option))]
    pub max_duration: Option<Duration>,
    // 120 workers per cpu seems like a good default number
    #[builder(default = num_cpus::get() * 120)]
    pub concurrency: usize,
    /// Stop once this many iterations have started; 0 means unbounded.
    #[builder(default)]
    pub max_iterations: u64,
    #[builder(default, setter(strip_option))]
    pub max_failures: Option<u64>,
    /// Percentage of started iterations.
    #[builder(default, setter(strip_option))]
    pub max_failures_rate: Option<f64>,
    #[builder(default)]
    pub ignore_dropped: bool,
    #[builder(default = DEFAULT_DRAIN_TIMEOUT)]
    pub drain_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunOptions {
    /// Options from the `limits` section of a schedule file; anything it
    /// leaves out keeps its default.
    pub fn from_limits(limits: &FileLimits) -> Self {
        let defaults = Self::default();
        Self {
            max_duration: limits.max_duration,
            concurrency: limits.concurrency.unwrap_or(defaults.concurrency),
            max_iterations: limits.max_iterations.unwrap_or(defaults.max_iterations),
            max_failures: limits.max_failures,
            max_failures_rate: limits.max_failures_rate,
            ignore_dropped: limits.ignore_dropped.unwrap_or(defaults.ignore_dropped),
            drain_timeout: defaults.drain_timeout,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_failures: self.max_failures,
            max_failures_rate: self.max_failures_rate,
            ignore_dropped: self.ignore_dropped,
        }
    }
}

/// Phases of a run, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Running,
    Draining,
    Teardown,
    Done,
}

/// One load test: a scenario, the trigger driving it, and its limits.
#[derive(TypedBuilder)]
pub struct Run {
    #[builder(setter(transform = |scenario: impl Scenario + 'static| Arc::new(scenario) as Arc<dyn Scenario>))]
    scenario: Arc<dyn Scenario>,
    trigger: Trigger,
    #[builder(default)]
    options: RunOptions,
    #[builder(
        default = Arc::new(TracingReporter),
        setter(transform = |reporter: impl Reporter + 'static| Arc::new(reporter) as Arc<dyn Reporter>)
    )]
    reporter: Arc<dyn Reporter>,
    /// Stops the run when cancelled. Without one the run listens for Ctrl-C.
    #[builder(default, setter(strip_option))]
    interrupt: Option<CancellationToken>,
}

enum Pool {
    Triggered {
        pool: Arc<TriggeredPool>,
        trigger: JoinHandle<TriggerStats>,
        stop: CancellationToken,
        dispatcher: JoinHandle<()>,
    },
    Continuous(Arc<ContinuousPool>),
}

impl Pool {
    fn start(
        kind: TriggerKind,
        manager: &Arc<PoolManager>,
        concurrency: usize,
        iteration: Arc<dyn Iteration>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        match kind {
            TriggerKind::Rate { rate, interval } => {
                let pool = TriggeredPool::new(manager.clone());
                let workers = pool.spawn_workers(concurrency, iteration);
                let (tx, rx) = mpsc::channel(1);
                let dispatcher = pool.spawn_dispatcher(rx);
                let stop = CancellationToken::new();
                let worker = TriggerWorker::new(rate, interval, tx, stop.clone());
                let trigger = tokio::spawn(worker.run());
                let pool = Pool::Triggered {
                    pool,
                    trigger,
                    stop,
                    dispatcher,
                };
                (pool, workers)
            }
            TriggerKind::Users => {
                let pool = ContinuousPool::new(manager.clone());
                let workers = pool.spawn_workers(concurrency, iteration);
                (Pool::Continuous(pool), workers)
            }
        }
    }

    /// Stop starting iterations and return how many start signals the trigger
    /// emitted. Pending start signals count as dropped unless the ceiling ended
    /// the run.
    async fn close(self, reason: StopReason) -> Option<u64> {
        match self {
            Pool::Triggered {
                pool,
                trigger,
                stop,
                dispatcher,
            } => {
                stop.cancel();
                let emitted = match trigger.await {
                    Ok(stats) => {
                        debug!(?stats, "trigger joined");
                        Some(stats.emitted)
                    }
                    Err(e) => {
                        warn!(error = %e, "trigger task failed");
                        None
                    }
                };
                pool.close(reason != StopReason::IterationsReached);
                // the trigger dropped its sender, so this drains the channel and ends
                if let Err(e) = dispatcher.await {
                    warn!(error = %e, "dispatcher task failed");
                }
                emitted
            }
            Pool::Continuous(pool) => {
                pool.close();
                None
            }
        }
    }
}

impl Run {
    /// Run to completion. Never fails: problems are recorded in the result.
    pub async fn execute(self) -> RunResult {
        let Run {
            scenario,
            trigger,
            options,
            reporter,
            interrupt,
        } = self;
        let name = scenario.name().to_string();
        let description = trigger.description().to_string();
        let started_at = SystemTime::now();
        let clock = Instant::now();
        let manager = Arc::new(PoolManager::new(
            name.as_str(),
            options.max_iterations,
            reporter.clone(),
        ));
        let mut errors = Vec::new();

        info!(scenario = %name, trigger = %description, "starting run");
        enter(Phase::Setup);
        let (setup, took) = guarded(scenario.setup()).await;
        let setup_error = setup.as_ref().err().cloned();
        report_step(&*reporter, &name, Step::Setup, took, setup_error.as_deref());

        let (stop_reason, emitted) = match setup {
            Err(e) => {
                error!(error = %e, "setup failed, skipping iterations");
                errors.push(RunError::Setup(e));
                (StopReason::SetupFailed, None)
            }
            Ok(iteration) => {
                run_iterations(
                    trigger,
                    &options,
                    &manager,
                    &reporter,
                    interrupt,
                    iteration,
                    &mut errors,
                )
                .await
            }
        };

        enter(Phase::Teardown);
        let (teardown, took) = guarded(scenario.teardown()).await;
        let teardown_error = teardown.err();
        report_step(&*reporter, &name, Step::Teardown, took, teardown_error.as_deref());
        if let Some(e) = teardown_error {
            error!(error = %e, "teardown failed");
            errors.push(RunError::Teardown(e));
        }

        enter(Phase::Done);
        let result = RunResult {
            scenario: name,
            trigger: description,
            started_at,
            elapsed: clock.elapsed(),
            stop_reason,
            started: manager.started(),
            dropped: manager.dropped(),
            emitted,
            aggregate: manager.snapshot().await,
            errors,
            thresholds: options.thresholds(),
        };
        if let Err(e) = reporter.report(&result.summary()).await {
            warn!(error = %e, "reporter failed");
        }
        result
    }
}

/// The running and draining phases. Returns why the run stopped and the start
/// signals emitted, when a trigger drove it.
async fn run_iterations(
    trigger: Trigger,
    options: &RunOptions,
    manager: &Arc<PoolManager>,
    reporter: &Arc<dyn Reporter>,
    interrupt: Option<CancellationToken>,
    iteration: Arc<dyn Iteration>,
    errors: &mut Vec<RunError>,
) -> (StopReason, Option<u64>) {
    enter(Phase::Running);
    let trigger_duration = trigger.duration();
    let start = Instant::now();
    let limit = match (options.max_duration, trigger_duration) {
        (Some(max), Some(shape)) => Some(max.min(shape)),
        (max, shape) => max.or(shape),
    };
    // the shape ending first is the trigger finishing, not the clock running out
    let finished_reason = match (options.max_duration, trigger_duration) {
        (Some(max), Some(shape)) if shape < max => StopReason::TriggerFinished,
        (None, Some(_)) => StopReason::TriggerFinished,
        _ => StopReason::DurationElapsed,
    };

    let concurrency = options.concurrency.max(1);
    let (pool, mut workers) = Pool::start(trigger.into_kind(), manager, concurrency, iteration);
    let progress_stop = CancellationToken::new();
    let progress = progress::spawn(
        manager.clone(),
        reporter.clone(),
        start,
        progress_stop.clone(),
    );

    let timer = async {
        match limit {
            Some(limit) => sleep_until(start + limit.saturating_sub(TIMER_SLACK)).await,
            None => std::future::pending().await,
        }
    };
    let interrupted = async {
        match &interrupt {
            Some(token) => token.cancelled().await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    let reason = tokio::select! {
        biased;
        _ = interrupted => StopReason::Interrupted,
        _ = manager.ceiling_reached() => StopReason::IterationsReached,
        _ = timer => finished_reason,
    };
    info!(?reason, elapsed = ?start.elapsed(), "stopping run");

    enter(Phase::Draining);
    let emitted = pool.close(reason).await;
    let drained = timeout(options.drain_timeout, join_all(workers.iter_mut())).await;
    match drained {
        Ok(joined) => {
            for e in joined.into_iter().filter_map(Result::err) {
                warn!(error = %e, "worker task failed");
            }
        }
        Err(_) => {
            warn!(
                grace = ?options.drain_timeout,
                "iterations still running after the drain grace period, aborting"
            );
            for worker in &workers {
                worker.abort();
            }
            errors.push(RunError::DrainTimeout(options.drain_timeout));
        }
    }
    progress_stop.cancel();
    if let Err(e) = progress.await {
        warn!(error = %e, "progress task failed");
    }
    (reason, emitted)
}

fn enter(phase: Phase) {
    debug!(?phase, "run phase");
}

/// Await a setup or teardown call, turning errors and panics into messages.
async fn guarded<T>(
    call: impl Future<Output = Result<T, BoxError>>,
) -> (Result<T, String>, Duration) {
    let start = Instant::now();
    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(&*panic))),
    };
    (result, start.elapsed())
}

fn report_step(
    reporter: &dyn Reporter,
    scenario: &str,
    step: Step,
    duration: Duration,
    error: Option<&str>,
) {
    reporter.iteration(&IterationMetric {
        scenario,
        step,
        outcome: if error.is_some() {
            Outcome::Fail
        } else {
            Outcome::Success
        },
        duration,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    mod run_options {
        use super::*;

        #[test]
        fn defaults() {
            let options = RunOptions::default();
            assert_eq!(options.concurrency, num_cpus::get() * 120);
            assert_eq!(options.max_iterations, 0);
            assert_eq!(options.max_duration, None);
            assert_eq!(options.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
            assert_eq!(options.thresholds(), Thresholds::default());
        }

        #[test]
        fn file_limits_override_defaults() {
            let limits = FileLimits {
                max_duration: Some(Duration::from_secs(30)),
                concurrency: Some(8),
                max_failures_rate: Some(2.5),
                ignore_dropped: Some(true),
                ..Default::default()
            };
            let options = RunOptions::from_limits(&limits);
            assert_eq!(options.max_duration, Some(Duration::from_secs(30)));
            assert_eq!(options.concurrency, 8);
            assert_eq!(options.max_iterations, 0);
            assert_eq!(
                options.thresholds(),
                Thresholds {
                    max_failures: None,
                    max_failures_rate: Some(2.5),
                    ignore_dropped: true,
                }
            );
        }
    }

    #[tokio::test]
    async fn guarded_catches_errors_and_panics() {
        let (ok, _) = guarded(async { Ok::<_, BoxError>(7) }).await;
        assert_eq!(ok, Ok(7));
        let (err, _) = guarded(async { Err::<(), BoxError>("nope".into()) }).await;
        assert_eq!(err, Err("nope".to_string()));
        let (panicked, _) = guarded(async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), BoxError>(())
        })
        .await;
        assert_eq!(panicked, Err("panicked: kaboom".to_string()));
    }
}
