//! The contract between the engine and user test logic.
//!
//! A [`Scenario`] is set up once, hands back an [`Iteration`] that the workers
//! call over and over, and is torn down once at the end of the run. Iterations
//! fail by returning an error, by calling [`IterationContext::fail`], or by
//! panicking; the engine recovers from all three and keeps going.
use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use crate::error::BoxError;

/// State handed to every iteration.
///
/// Each worker owns one context and reuses it for all its iterations; it is
/// reset before every call.
#[derive(Debug)]
pub struct IterationContext {
    worker: usize,
    iteration: u64,
    failure: Option<String>,
}

impl IterationContext {
    pub(crate) fn new(worker: usize) -> Self {
        Self {
            worker,
            iteration: 0,
            failure: None,
        }
    }

    pub(crate) fn reset(&mut self, iteration: u64) {
        self.iteration = iteration;
        self.failure = None;
    }

    pub(crate) fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }

    /// Index of the worker running this iteration.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Run-wide sequence number of this iteration, starting at 0.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Mark the iteration failed without returning an error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// The body of a load test, called once per started iteration.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<(), BoxError>>`
/// closure; implement the trait directly to use the [`IterationContext`].
#[async_trait]
pub trait Iteration: Send + Sync + 'static {
    async fn run(&self, ctx: &mut IterationContext) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Iteration for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn run(&self, _ctx: &mut IterationContext) -> Result<(), BoxError> {
        self().await
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare shared state and return the iteration to run. A failure aborts
    /// the run before any iteration starts; teardown still runs.
    async fn setup(&self) -> Result<Arc<dyn Iteration>, BoxError>;

    /// Called exactly once when the run ends, whatever the reason.
    async fn teardown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use typed_builder::TypedBuilder;

    use super::*;

    /// A scenario with no setup or teardown of its own, just an iteration.
    ///
    /// ```rust
    /// use surge::BasicScenario;
    ///
    /// let scenario = BasicScenario::builder()
    ///     .name("ping")
    ///     .iteration(|| async { Ok::<(), surge::BoxError>(()) })
    ///     .build();
    /// ```
    #[derive(TypedBuilder)]
    pub struct BasicScenario {
        #[builder(setter(into))]
        pub name: String,
        #[builder(setter(transform = |iteration: impl Iteration| Arc::new(iteration) as Arc<dyn Iteration>))]
        pub iteration: Arc<dyn Iteration>,
    }

    #[async_trait]
    impl Scenario for BasicScenario {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&self) -> Result<Arc<dyn Iteration>, BoxError> {
            Ok(self.iteration.clone())
        }
    }
}
