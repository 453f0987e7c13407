//! Run control: submission, start, stop and progress.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::CrawlContext;
use super::executor::UnitExecutor;
use super::progress::{ProgressSnapshot, ProgressTracker};
use super::retry::RetryPolicy;
use super::task::{DataKind, TaskUnit, TimeWindow, expand};
use super::worker_pool::{CrawlWorkerPool, SharedReceiver, UnitQueue, WorkerPoolConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker: WorkerPoolConfig,
    pub retry: RetryPolicy,
}

struct ActiveRun {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Drives a crawl: expands submissions into units, feeds them to the
/// workers and reports progress.
pub struct Orchestrator {
    ctx: CrawlContext,
    config: OrchestratorConfig,
    pending: UnitQueue,
    submitted: parking_lot::Mutex<HashSet<String>>,
    running: Arc<AtomicBool>,
    progress: Arc<ProgressTracker>,
    run: parking_lot::Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    pub fn new(ctx: CrawlContext, config: OrchestratorConfig) -> Self {
        Self {
            ctx,
            config,
            pending: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            submitted: parking_lot::Mutex::new(HashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(ProgressTracker::new()),
            run: parking_lot::Mutex::new(None),
        }
    }

    /// Queue the cross product of the inputs.
    ///
    /// Units already submitted in this run or already successful in the
    /// ledger are dropped; the latter count as skipped. Returns how many
    /// units were queued.
    #[instrument(skip_all, fields(keywords = keywords.len(), areas = areas.len()))]
    pub fn submit_tasks(
        &self,
        keywords: &[String],
        areas: &[String],
        windows: &[TimeWindow],
        kinds: &[DataKind],
    ) -> usize {
        let units = expand(keywords, areas, windows, kinds);
        let expanded = units.len();

        let mut submitted = self.submitted.lock();
        let mut queued = Vec::with_capacity(expanded);
        let mut skipped = 0;
        for unit in units {
            let key = unit.key();
            if submitted.contains(&key) {
                continue;
            }
            if self.ctx.ledger.is_completed(&key) {
                skipped += 1;
                continue;
            }
            submitted.insert(key);
            queued.push(unit);
        }
        drop(submitted);

        let count = queued.len();
        self.pending.lock().extend(queued);
        self.progress.add_queued(count);
        self.progress.add_skipped_on_submit(skipped);

        info!(expanded, queued = count, skipped, "Submitted tasks");
        count
    }

    /// Launch the workers and the feeder for everything queued so far.
    ///
    /// Fails while a run is active, including one that was stopped but whose
    /// workers have not exited yet.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut active = self.run.lock();
        if let Some(run) = active.as_ref()
            && !run.supervisor.is_finished()
        {
            let reason = if self.is_running() {
                "Orchestrator is already running"
            } else {
                "Previous run is still stopping"
            };
            return Err(Error::validation(reason));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::validation("Orchestrator is already running"));
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.worker.queue_capacity.max(1));
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = CrawlWorkerPool::new(self.config.worker.clone(), cancel.clone());
        let executor = UnitExecutor::new(
            self.ctx.clone(),
            self.config.worker.clone(),
            self.config.retry.clone(),
        );
        workers.start(rx.clone(), executor, self.progress.clone(), self.pending.clone());

        let feeder = tokio::spawn(feed(
            self.pending.clone(),
            tx,
            self.running.clone(),
            cancel.clone(),
        ));

        let running = self.running.clone();
        let pending = self.pending.clone();
        let supervisor = tokio::spawn(async move {
            if let Err(e) = feeder.await {
                warn!(error = %e, "Feeder task failed");
            }
            workers.join().await;
            let returned = return_undelivered(&rx, &pending).await;
            if returned > 0 {
                info!(returned, "Returned undelivered units to the queue");
            }
            running.store(false, Ordering::SeqCst);
        });

        *active = Some(ActiveRun { cancel, supervisor });
        drop(active);
        info!(
            workers = self.config.worker.max_workers,
            pending = self.pending.lock().len(),
            "Crawl started"
        );
        Ok(())
    }

    /// Stop feeding and let idle workers exit. In-flight units finish their
    /// current request. Units not yet dequeued, and units abandoned while
    /// backing off, go back to pending for the next `start`.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(run) = self.run.lock().as_ref() {
            run.cancel.cancel();
        }
        info!("Crawl stop requested");
    }

    /// Wait for the current run to finish, then flush the sink and ledger.
    #[instrument(skip(self))]
    pub async fn wait(&self) -> Result<ProgressSnapshot> {
        let run = self.run.lock().take();
        if let Some(run) = run {
            run.supervisor
                .await
                .map_err(|e| Error::Other(format!("Crawl supervisor failed: {e}")))?;
        }

        self.ctx.sink.flush().await?;
        self.ctx.ledger.flush().await?;

        let snapshot = self.progress.snapshot();
        info!(
            total = snapshot.total,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            skipped = snapshot.skipped,
            "Crawl finished"
        );
        Ok(snapshot)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Units queued but not yet handed to a worker.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Move units left in the worker channel back to the front of `pending`,
/// keeping their order.
async fn return_undelivered(rx: &SharedReceiver, pending: &UnitQueue) -> usize {
    let mut rx = rx.lock().await;
    rx.close();
    let mut undelivered = Vec::new();
    while let Ok(unit) = rx.try_recv() {
        undelivered.push(unit);
    }
    let count = undelivered.len();
    let mut pending = pending.lock();
    for unit in undelivered.into_iter().rev() {
        pending.push_front(unit);
    }
    count
}

/// Move pending units into the worker channel until drained or stopped.
async fn feed(
    pending: UnitQueue,
    tx: mpsc::Sender<TaskUnit>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        if !running.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }
        let Some(unit) = pending.lock().pop_front() else {
            break;
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => permit.send(unit),
            None => {
                pending.lock().push_front(unit);
                break;
            }
        }
    }
}
