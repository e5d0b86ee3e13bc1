//! Pool with no trigger: every worker loops iterations back to back until the
//! pool is closed or the iteration ceiling is reached.
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{PoolManager, Worker};
use crate::scenario::Iteration;

pub struct ContinuousPool {
    manager: Arc<PoolManager>,
    closed: CancellationToken,
}

impl ContinuousPool {
    pub fn new(manager: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            closed: CancellationToken::new(),
        })
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        concurrency: usize,
        iteration: Arc<dyn Iteration>,
    ) -> Vec<JoinHandle<()>> {
        info!(concurrency, "spawning continuous workers");
        (0..concurrency)
            .map(|id| {
                let pool = self.clone();
                let worker = Worker::new(id, self.manager.clone(), iteration.clone());
                tokio::spawn(pool.work(worker))
            })
            .collect()
    }

    /// Workers finish their current iteration and stop.
    pub fn close(&self) {
        self.closed.cancel();
        info!("continuous pool closed");
    }

    async fn work(self: Arc<Self>, mut worker: Worker) {
        while !self.closed.is_cancelled() {
            if worker.run_next().await.is_err() {
                break;
            }
            // an iteration that never awaits would otherwise starve the runtime
            tokio::task::consume_budget().await;
        }
    }
}
