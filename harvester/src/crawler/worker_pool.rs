//! Fixed-size pool of workers draining the task queue.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::executor::{UnitExecutor, UnitOutcome};
use super::progress::ProgressTracker;
use super::task::TaskUnit;

/// Configuration for the crawl workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Bound of the channel between the feeder and the workers.
    pub queue_capacity: usize,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// How long a worker waits for a credential to leave cooldown.
    /// Zero fails fast.
    pub credential_wait_ms: u64,
    /// Credential switches allowed per unit after authentication rejections.
    pub max_credential_retries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            max_workers: cpus * 2,
            queue_capacity: 1024,
            request_timeout_ms: 30_000,
            credential_wait_ms: 60_000,
            max_credential_retries: 3,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_workers == 0 {
            return Err(crate::Error::config("worker.max_workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(crate::Error::config(
                "worker.queue_capacity must be at least 1",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(crate::Error::config(
                "worker.request_timeout_ms must be positive",
            ));
        }
        Ok(())
    }
}

/// Units waiting for a worker, shared with whoever feeds the pool.
pub type UnitQueue = Arc<parking_lot::Mutex<VecDeque<TaskUnit>>>;

/// Receiving end shared by all workers.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<TaskUnit>>>;

/// Workers sharing one receiver; each takes the next unit when idle.
pub struct CrawlWorkerPool {
    config: WorkerPoolConfig,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl CrawlWorkerPool {
    pub fn new(config: WorkerPoolConfig, cancellation_token: CancellationToken) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token,
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers. They exit when the channel closes or on cancellation.
    ///
    /// A unit abandoned on cancellation goes back to the front of `requeue`.
    pub fn start(
        &self,
        receiver: SharedReceiver,
        executor: UnitExecutor,
        progress: Arc<ProgressTracker>,
        requeue: UnitQueue,
    ) {
        info!(
            "Starting crawl worker pool with {} workers",
            self.config.max_workers
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };
        for i in 0..self.config.max_workers {
            let receiver = receiver.clone();
            let executor = executor.clone();
            let progress = progress.clone();
            let cancel = self.cancellation_token.clone();
            let active = self.active_workers.clone();
            let requeue = requeue.clone();

            join_set.spawn(async move {
                debug!("Crawl worker {} started", i);
                loop {
                    let next = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            unit = rx.recv() => unit,
                        }
                    };
                    let Some(unit) = next else {
                        break;
                    };

                    active.fetch_add(1, Ordering::SeqCst);
                    let outcome = executor.execute(&unit, &cancel).await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    match outcome {
                        UnitOutcome::Succeeded { .. } => progress.record_success(),
                        UnitOutcome::Failed(_) => progress.record_failure(),
                        UnitOutcome::Skipped => progress.record_skip(),
                        UnitOutcome::Unrecorded { .. } => progress.record_unrecorded(),
                        UnitOutcome::Abandoned => {
                            debug!(task = %unit.key(), "Unit abandoned, returning it to the queue");
                            requeue.lock().push_front(unit);
                            break;
                        }
                    }
                }
                debug!("Crawl worker {} stopped", i);
            });
        }
    }

    /// Wait for every worker to exit.
    pub async fn join(&self) {
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
    }

    /// Cancel the workers and wait for them to exit.
    pub async fn stop(&self) {
        info!("Stopping crawl worker pool");
        self.cancellation_token.cancel();
        self.join().await;
        info!("Crawl worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
