use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// One unit of periodic background work: a relay, an inbox processor or a
/// sweeper. A cycle returns how many records it handled.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run_cycle(&self) -> Result<usize>;
}

/// Owns a poll task and the cadence it runs at.
///
/// `run_once` executes a single cycle inline, which is what tests drive.
/// `start` spawns the fixed-delay loop and hands back a [`WorkerHandle`];
/// the loop ends when the handle is stopped or dropped.
pub struct PollingWorker<T> {
    task: Arc<T>,
    interval: Duration,
}

impl<T: PollTask> PollingWorker<T> {
    pub fn new(task: T, interval: Duration) -> Self {
        Self {
            task: Arc::new(task),
            interval,
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub async fn run_once(&self) -> Result<usize> {
        self.task.run_cycle().await
    }

    pub fn start(&self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = Arc::clone(&self.task);
        let period = self.interval;

        let join = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("{} started, polling every {:?}", task.name(), period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match task.run_cycle().await {
                            Ok(0) => {}
                            Ok(count) => debug!("{} handled {} records", task.name(), count),
                            Err(e) => error!("Error in {} cycle: {}", task.name(), e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("{} stopped", task.name());
        });

        WorkerHandle {
            name: self.task.name().to_string(),
            shutdown: shutdown_tx,
            join,
        }
    }
}

pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signals the loop and waits for the in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("Worker {} terminated abnormally: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTask {
        cycles: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PollTask for CountingTask {
        fn name(&self) -> &str {
            "counting-task"
        }

        async fn run_cycle(&self) -> Result<usize> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cycle failed");
            }
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_run_once_executes_a_single_cycle() {
        let worker = PollingWorker::new(CountingTask::default(), Duration::from_secs(60));

        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.task().cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_started_worker_polls_until_stopped() {
        let worker = PollingWorker::new(CountingTask::default(), Duration::from_millis(5));
        let handle = worker.start();
        assert_eq!(handle.name(), "counting-task");

        time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_running());
        handle.stop().await;

        let after_stop = worker.task().cycles.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected several cycles, got {after_stop}");

        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(worker.task().cycles.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_failing_cycle_does_not_end_the_loop() {
        let task = CountingTask {
            fail: true,
            ..Default::default()
        };
        let worker = PollingWorker::new(task, Duration::from_millis(5));
        let handle = worker.start();

        time::sleep(Duration::from_millis(40)).await;
        assert!(handle.is_running());
        handle.stop().await;

        assert!(worker.task().cycles.load(Ordering::SeqCst) >= 2);
    }
}
