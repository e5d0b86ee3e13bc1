//! Periodic progress snapshots: frequent at the start of a run, sparse later on.
use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    executor::PoolManager,
    report::{ProgressReport, Reporter},
};

/// Delay until the next snapshot, given how long the run has been going.
pub fn interval_at(elapsed: Duration) -> Duration {
    match elapsed.as_secs() {
        0..=9 => Duration::from_secs(1),
        10..=59 => Duration::from_secs(5),
        60..=599 => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    }
}

pub(crate) fn spawn(
    manager: Arc<PoolManager>,
    reporter: Arc<dyn Reporter>,
    start: Instant,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = start + interval_at(Duration::ZERO);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = sleep_until(next) => {}
            }
            let elapsed = next - start;
            let aggregate = manager.snapshot().await;
            reporter.progress(&ProgressReport::new(
                manager.scenario(),
                elapsed,
                manager.started(),
                manager.dropped(),
                &aggregate,
            ));
            next += interval_at(elapsed);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{error::BoxError, report::RunSummary};

    #[test]
    fn schedule_slows_down_over_time() {
        let at = |secs| interval_at(Duration::from_secs(secs)).as_secs();
        assert_eq!(at(0), 1);
        assert_eq!(at(9), 1);
        assert_eq!(at(10), 5);
        assert_eq!(at(59), 5);
        assert_eq!(at(60), 15);
        assert_eq!(at(599), 15);
        assert_eq!(at(600), 60);
        assert_eq!(at(86_400), 60);
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<f64>>);

    #[async_trait]
    impl Reporter for Recording {
        fn progress(&self, report: &ProgressReport) {
            self.0.lock().unwrap().push(report.elapsed_secs);
        }

        async fn report(&self, _summary: &RunSummary) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_follow_the_schedule() {
        let reporter = Arc::new(Recording::default());
        let manager = Arc::new(PoolManager::new("test", 0, reporter.clone()));
        let stop = CancellationToken::new();
        let task = spawn(manager, reporter.clone(), Instant::now(), stop.clone());

        tokio::time::sleep(Duration::from_millis(25_500)).await;
        stop.cancel();
        task.await.unwrap();

        let seen = reporter.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 15.0, 20.0, 25.0]
        );
    }
}
