//! The ticking task that turns a rate function into start signals.
//!
//! The worker is an explicit state machine, `Idle -> Running -> Stopped`, driven
//! by [`TriggerEvent`]s. Every transition is decided by [`TriggerState::on`], so
//! the two behaviours that matter most are testable on their own:
//!
//! - **burst catch-up**: `Start` evaluates the rate once for "now" and emits it
//!   immediately, before the first tick,
//! - **stop beats tick**: when a stop and a tick are both ready the stop wins,
//!   and a stop that lands while a batch is waiting on a full channel abandons
//!   the batch.
//!
//! Batches are sent over a bounded channel. A full channel blocks the worker
//! instead of discarding the batch, which back-pressures the rate at its source.
//! Deadlines missed while blocked are skipped rather than replayed.
use std::time::Duration;

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rate::BoxRateFunction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerEvent {
    Start,
    Tick,
    Stop,
    /// The consumer dropped its end of the channel.
    ConsumerClosed,
}

/// What the worker does in response to a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerAction {
    /// Evaluate the rate for "now" and emit before the first tick.
    Burst,
    /// Evaluate the rate for the tick deadline and emit.
    Emit,
    Halt,
    Ignore,
}

impl TriggerState {
    /// Transition table.
    pub fn on(self, event: TriggerEvent) -> (TriggerState, TriggerAction) {
        use TriggerAction::*;
        use TriggerEvent::*;
        use TriggerState::*;

        match (self, event) {
            (Idle, Start) => (Running, Burst),
            (Idle, Tick) => (Idle, Ignore),
            (Idle, Stop | ConsumerClosed) => (Stopped, Halt),
            (Running, Tick) => (Running, Emit),
            (Running, Start) => (Running, Ignore),
            (Running, Stop | ConsumerClosed) => (Stopped, Halt),
            (Stopped, _) => (Stopped, Ignore),
        }
    }
}

/// Counters returned when the worker terminates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerStats {
    /// Rate evaluations, the initial burst included.
    pub evaluations: u64,
    /// Start signals handed to the consumer.
    pub emitted: u64,
    /// Deadlines skipped because the worker was blocked past them.
    pub missed_ticks: u64,
}

pub struct TriggerWorker {
    rate: BoxRateFunction,
    interval: Duration,
    sender: mpsc::Sender<u64>,
    stop: CancellationToken,
    state: TriggerState,
    stats: TriggerStats,
}

impl TriggerWorker {
    pub fn new(
        rate: BoxRateFunction,
        interval: Duration,
        sender: mpsc::Sender<u64>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            rate,
            interval,
            sender,
            stop,
            state: TriggerState::Idle,
            stats: TriggerStats::default(),
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// Run until stopped or until the consumer goes away.
    pub async fn run(mut self) -> TriggerStats {
        let mut deadline = Instant::now();
        info!(interval = ?self.interval, "trigger started");
        self.handle(TriggerEvent::Start, deadline).await;

        while self.state == TriggerState::Running {
            deadline = self.next_deadline(deadline);
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => TriggerEvent::Stop,
                _ = sleep_until(deadline) => TriggerEvent::Tick,
            };
            self.handle(event, deadline).await;
        }

        info!(
            emitted = self.stats.emitted,
            evaluations = self.stats.evaluations,
            missed_ticks = self.stats.missed_ticks,
            "trigger stopped"
        );
        self.stats
    }

    async fn handle(&mut self, event: TriggerEvent, at: Instant) {
        match self.transition(event) {
            TriggerAction::Burst => self.emit(Instant::now()).await,
            TriggerAction::Emit => self.emit(at).await,
            TriggerAction::Halt | TriggerAction::Ignore => {}
        }
    }

    fn transition(&mut self, event: TriggerEvent) -> TriggerAction {
        let (state, action) = self.state.on(event);
        if state != self.state {
            debug!(from = ?self.state, to = ?state, ?event, "trigger transition");
        }
        self.state = state;
        action
    }

    async fn emit(&mut self, at: Instant) {
        // a stop that arrived together with the tick wins
        if self.stop.is_cancelled() {
            self.transition(TriggerEvent::Stop);
            return;
        }
        let count = self.rate.rate(at);
        self.stats.evaluations += 1;

        let sent = match self.sender.try_send(count) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(count)) => {
                debug!(count, "consumer busy, trigger blocked");
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => {
                        self.transition(TriggerEvent::Stop);
                        return;
                    }
                    sent = self.sender.send(count) => sent.map_err(|_| ()),
                }
            }
            Err(TrySendError::Closed(_)) => Err(()),
        };
        match sent {
            Ok(()) => self.stats.emitted += count,
            Err(()) => {
                self.transition(TriggerEvent::ConsumerClosed);
            }
        }
    }

    fn next_deadline(&mut self, previous: Instant) -> Instant {
        let interval = self.rate.next_interval().unwrap_or(self.interval);
        let mut next = previous + interval;
        let now = Instant::now();
        if next <= now && !interval.is_zero() {
            let missed = ((now - next).as_nanos() / interval.as_nanos()) as u32 + 1;
            self.stats.missed_ticks += missed as u64;
            debug!(missed, "skipping missed ticks");
            next += interval * missed;
        }
        next
    }
}
