//! Pool fed by a trigger.
//!
//! The trigger sends batches of start signals over a bounded channel; the
//! pool's dispatcher turns each batch into pending jobs that idle workers claim
//! one at a time with a CAS decrement. A batch is only accepted up to the number
//! of free workers: the rest is dropped and counted on the spot. Nothing is ever
//! queued, so a saturated pool sheds load instead of building a backlog.
//!
//! The dispatcher does not take the next batch off the channel until a worker is
//! free. While the pool is saturated the channel fills and the trigger blocks
//! on its send, skipping the ticks it misses, instead of emitting batches that
//! could only be dropped.
//!
//! Once the dispatcher has finished `started + dropped == emitted`, unless the
//! iteration ceiling cut the run short.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PoolManager, Worker};
use crate::scenario::Iteration;

pub struct TriggeredPool {
    manager: Arc<PoolManager>,
    pending: AtomicU64,
    /// Workers parked waiting for a job.
    idle: AtomicU64,
    /// Wakes workers when jobs arrive.
    wake: Notify,
    /// Wakes the dispatcher when a worker parks.
    freed: Notify,
    closed: CancellationToken,
    drop_late: AtomicBool,
}

impl TriggeredPool {
    pub fn new(manager: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pending: AtomicU64::new(0),
            idle: AtomicU64::new(0),
            wake: Notify::new(),
            freed: Notify::new(),
            closed: CancellationToken::new(),
            drop_late: AtomicBool::new(true),
        })
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    /// Start signals waiting for a free worker.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Parked workers not already promised a pending job.
    pub fn free(&self) -> u64 {
        self.idle
            .load(Ordering::Acquire)
            .saturating_sub(self.pending.load(Ordering::Acquire))
    }

    /// Spawn `concurrency` workers running `iteration`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        concurrency: usize,
        iteration: Arc<dyn Iteration>,
    ) -> Vec<JoinHandle<()>> {
        info!(concurrency, "spawning triggered workers");
        (0..concurrency)
            .map(|id| {
                let pool = self.clone();
                let worker = Worker::new(id, self.manager.clone(), iteration.clone());
                tokio::spawn(pool.work(worker))
            })
            .collect()
    }

    /// Consume batches from the trigger until its channel closes, taking the
    /// next one only once a worker is free to start it.
    ///
    /// After [`close`](Self::close) the dispatcher stops waiting and drains the
    /// channel, so batches still buffered there are counted exactly once.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut batches: mpsc::Receiver<u64>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                pool.worker_freed().await;
                match batches.recv().await {
                    Some(batch) => pool.offer(batch),
                    None => break,
                }
            }
            debug!("dispatcher finished");
        })
    }

    /// Hand a batch to the free workers. Signals no free worker can take are
    /// dropped.
    pub fn offer(&self, batch: u64) {
        if self.closed.is_cancelled() {
            if self.drop_late.load(Ordering::Acquire) {
                self.manager.record_dropped(batch);
            }
            return;
        }
        let accepted = batch.min(self.free());
        self.pending.fetch_add(accepted, Ordering::AcqRel);
        self.manager.record_dropped(batch - accepted);
        if accepted > 0 {
            self.wake.notify_waiters();
        }
        // a close racing this offer already swept pending
        if self.closed.is_cancelled() {
            self.discard_pending();
        }
    }

    /// Stop handing out jobs. In-flight iterations run to completion.
    ///
    /// Jobs still pending, and batches offered from now on, are counted as
    /// dropped when `drop_pending` is set; after a ceiling stop they are simply
    /// discarded.
    pub fn close(&self, drop_pending: bool) {
        self.drop_late.store(drop_pending, Ordering::Release);
        self.closed.cancel();
        let leftover = self.discard_pending();
        info!(leftover, "triggered pool closed");
    }

    fn discard_pending(&self) -> u64 {
        let leftover = self.pending.swap(0, Ordering::AcqRel);
        if self.drop_late.load(Ordering::Acquire) {
            self.manager.record_dropped(leftover);
        }
        leftover
    }

    /// Resolve once a worker is free or the pool is closed.
    async fn worker_freed(&self) {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.closed.is_cancelled() || self.free() > 0 {
                return;
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return,
                _ = &mut freed => {}
            }
        }
    }

    fn claim(&self) -> bool {
        !self.closed.is_cancelled()
            && self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
    }

    async fn work(self: Arc<Self>, mut worker: Worker) {
        loop {
            // register interest before looking, so a batch landing in between
            // still wakes us
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.claim() {
                if worker.run_next().await.is_err() {
                    break;
                }
                continue;
            }

            self.idle.fetch_add(1, Ordering::AcqRel);
            self.freed.notify_waiters();
            let stop = tokio::select! {
                biased;
                _ = self.closed.cancelled() => true,
                _ = worker.manager().ceiling_reached() => true,
                _ = &mut notified => false,
            };
            self.idle.fetch_sub(1, Ordering::AcqRel);
            if stop {
                break;
            }
        }
    }
}
