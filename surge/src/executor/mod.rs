//! Executor: the worker pools that actually run iterations.
//!
//! Two pools share one [`PoolManager`]:
//!
//! - [`TriggeredPool`]: a fixed number of workers that start one iteration per
//!   start signal received from a trigger. Signals that find every worker busy
//!   are dropped and counted, never queued.
//! - [`ContinuousPool`]: a fixed number of workers that loop back to back with
//!   no trigger at all (the "users" mode).
//!
//! # Iteration ceiling
//!
//! The manager hands out iteration numbers from a shared atomic counter. With a
//! ceiling of `n`, numbers `0..n` are handed out exactly once across all
//! workers; the call that hands out the last one trips the ceiling, and every
//! later call gets [`CeilingReached`]. A ceiling of 0 means unbounded.
//!
//! # Worker-local aggregation
//!
//! Each worker owns an [`Aggregate`] registered with the manager. Workers only
//! ever lock their own, and [`PoolManager::snapshot`] merges all of them for
//! progress reports and the final result.
//!
//! # Panics
//!
//! Iterations run under `catch_unwind`. A panicking iteration is recorded as a
//! failure carrying the panic message and the worker moves on.
pub mod continuous;
pub mod triggered;

pub use continuous::ContinuousPool;
pub use triggered::TriggeredPool;

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::{
    aggregate::Aggregate,
    metric::{IterationMetric, Outcome, Step},
    report::Reporter,
    scenario::{Iteration, IterationContext},
};

/// Returned once the iteration ceiling has been handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("iteration ceiling reached")]
pub struct CeilingReached;

/// State shared by every worker of a pool.
pub struct PoolManager {
    scenario: String,
    next: AtomicU64,
    max_iterations: u64,
    dropped: AtomicU64,
    ceiling: CancellationToken,
    aggregates: std::sync::Mutex<Vec<Arc<Mutex<Aggregate>>>>,
    reporter: Arc<dyn Reporter>,
}

impl PoolManager {
    /// `max_iterations` of 0 means unbounded.
    pub fn new(
        scenario: impl Into<String>,
        max_iterations: u64,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            next: AtomicU64::new(0),
            max_iterations,
            dropped: AtomicU64::new(0),
            ceiling: CancellationToken::new(),
            aggregates: std::sync::Mutex::new(Vec::new()),
            reporter,
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Claim the next iteration number.
    pub fn next_iteration(&self) -> Result<u64, CeilingReached> {
        if self.ceiling.is_cancelled() {
            return Err(CeilingReached);
        }
        let n = self.next.fetch_add(1, Ordering::AcqRel);
        if self.max_iterations == 0 {
            return Ok(n);
        }
        if n >= self.max_iterations {
            self.ceiling.cancel();
            return Err(CeilingReached);
        }
        if n + 1 == self.max_iterations {
            debug!(max_iterations = self.max_iterations, "iteration ceiling reached");
            self.ceiling.cancel();
        }
        Ok(n)
    }

    pub fn max_iterations_reached(&self) -> bool {
        self.ceiling.is_cancelled()
    }

    /// Resolves once the last iteration allowed by the ceiling has started.
    /// Never resolves without a ceiling.
    pub fn ceiling_reached(&self) -> WaitForCancellationFuture<'_> {
        self.ceiling.cancelled()
    }

    /// Iterations started so far.
    pub fn started(&self) -> u64 {
        let handed_out = self.next.load(Ordering::Acquire);
        match self.max_iterations {
            0 => handed_out,
            max => handed_out.min(max),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Count `count` start signals as dropped.
    pub fn record_dropped(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped.fetch_add(count, Ordering::AcqRel);
        debug!(count, "start signals dropped, no free worker");
        self.reporter.dropped(&self.scenario, count);
    }

    /// Merged view of every worker's aggregate.
    pub async fn snapshot(&self) -> Aggregate {
        let aggregates = match self.aggregates.lock() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let mut merged = Aggregate::new();
        for aggregate in aggregates {
            merged.merge(&*aggregate.lock().await);
        }
        merged
    }

    fn register(&self) -> Arc<Mutex<Aggregate>> {
        let aggregate = Arc::new(Mutex::new(Aggregate::new()));
        match self.aggregates.lock() {
            Ok(mut list) => list.push(aggregate.clone()),
            Err(poisoned) => poisoned.into_inner().push(aggregate.clone()),
        }
        aggregate
    }
}

/// One worker's view of a pool: its context, its aggregate, and the iteration
/// to call.
pub(crate) struct Worker {
    ctx: IterationContext,
    aggregate: Arc<Mutex<Aggregate>>,
    iteration: Arc<dyn Iteration>,
    manager: Arc<PoolManager>,
}

impl Worker {
    pub(crate) fn new(id: usize, manager: Arc<PoolManager>, iteration: Arc<dyn Iteration>) -> Self {
        Self {
            ctx: IterationContext::new(id),
            aggregate: manager.register(),
            iteration,
            manager,
        }
    }

    pub(crate) fn manager(&self) -> &PoolManager {
        &self.manager
    }

    /// Claim an iteration number and run it.
    pub(crate) async fn run_next(&mut self) -> Result<(), CeilingReached> {
        let number = self.manager.next_iteration()?;
        self.run(number).await;
        Ok(())
    }

    async fn run(&mut self, number: u64) {
        self.ctx.reset(number);
        let start = Instant::now();
        let result = AssertUnwindSafe(self.iteration.run(&mut self.ctx))
            .catch_unwind()
            .await;
        let duration = start.elapsed();

        let error = match result {
            Ok(Ok(())) => self.ctx.take_failure(),
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("iteration panicked: {}", panic_message(&*panic))),
        };
        let metric = IterationMetric {
            scenario: self.manager.scenario(),
            step: Step::Iteration,
            outcome: if error.is_some() {
                Outcome::Fail
            } else {
                Outcome::Success
            },
            duration,
            error: error.as_deref(),
        };
        if let Some(error) = &error {
            debug!(worker = self.ctx.worker(), iteration = number, %error, "iteration failed");
        }
        self.aggregate.lock().await.consume(&metric);
        self.manager.reporter.iteration(&metric);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BoxError, report::NoopReporter};

    fn manager(max_iterations: u64) -> Arc<PoolManager> {
        Arc::new(PoolManager::new("test", max_iterations, Arc::new(NoopReporter)))
    }

    mod next_iteration {
        use super::*;

        #[test]
        fn unbounded_never_trips() {
            let manager = manager(0);
            for i in 0..1_000 {
                assert_eq!(manager.next_iteration(), Ok(i));
            }
            assert!(!manager.max_iterations_reached());
            assert_eq!(manager.started(), 1_000);
        }

        #[test]
        fn ceiling_hands_out_exactly_n() {
            let manager = manager(3);
            assert_eq!(manager.next_iteration(), Ok(0));
            assert_eq!(manager.next_iteration(), Ok(1));
            assert!(!manager.max_iterations_reached());
            assert_eq!(manager.next_iteration(), Ok(2));
            assert!(manager.max_iterations_reached());
            assert_eq!(manager.next_iteration(), Err(CeilingReached));
            assert_eq!(manager.started(), 3);
        }

        #[tokio::test]
        async fn concurrent_claims_never_exceed_the_ceiling() {
            let manager = manager(500);
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let mut claimed = 0u64;
                        while manager.next_iteration().is_ok() {
                            claimed += 1;
                            tokio::task::yield_now().await;
                        }
                        claimed
                    })
                })
                .collect();
            let total: u64 = futures::future::join_all(handles)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .sum();
            assert_eq!(total, 500);
            assert_eq!(manager.started(), 500);
        }
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }

    #[tokio::test]
    async fn worker_records_every_outcome() {
        struct Mixed;

        #[async_trait::async_trait]
        impl Iteration for Mixed {
            async fn run(&self, ctx: &mut IterationContext) -> Result<(), BoxError> {
                match ctx.iteration() {
                    0 => Ok(()),
                    1 => Err("returned".into()),
                    2 => {
                        ctx.fail("flagged");
                        Ok(())
                    }
                    _ => panic!("boom"),
                }
            }
        }

        let manager = manager(4);
        let mut worker = Worker::new(0, manager.clone(), Arc::new(Mixed));
        while worker.run_next().await.is_ok() {}

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 3);
        assert_eq!(worker.manager().started(), 4);
    }
}
