//! Runs one task unit to a final outcome.

use std::time::Duration;
use subst_cipher::{FieldShape, decrypt_checked};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::CrawlContext;
use super::error::CrawlError;
use super::retry::RetryPolicy;
use super::task::TaskUnit;
use super::worker_pool::WorkerPoolConfig;
use crate::credentials::CredentialLease;
use crate::ledger::LedgerStatus;
use crate::source::{
    FetchError, FetchOutcome, SeriesPayload, SeriesRecord, parse_values, records_from_values,
};

/// Final result of [`UnitExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Records were written and the unit marked successful.
    Succeeded { records: usize },
    /// Records were written but the success could not be recorded in the
    /// ledger; a later run fetches the unit again.
    Unrecorded { records: usize },
    /// Retries ran out; the unit is marked failed.
    Failed(CrawlError),
    /// The ledger already had a success for this unit.
    Skipped,
    /// Stopped before an outcome was recorded; a later run picks it up.
    Abandoned,
}

#[derive(Clone)]
pub struct UnitExecutor {
    ctx: CrawlContext,
    config: WorkerPoolConfig,
    retry: RetryPolicy,
}

impl UnitExecutor {
    pub fn new(ctx: CrawlContext, config: WorkerPoolConfig, retry: RetryPolicy) -> Self {
        Self { ctx, config, retry }
    }

    /// Fetch, decode and store `task`, retrying per the taxonomy:
    /// credential rejections switch credentials at once, everything else that
    /// is retryable backs off.
    pub async fn execute(&self, task: &TaskUnit, cancel: &CancellationToken) -> UnitOutcome {
        let key = task.key();
        if self.ctx.ledger.is_completed(&key) {
            debug!(task = %key, "Already completed, skipping");
            return UnitOutcome::Skipped;
        }

        let mut backoff_attempt = 0u32;
        let mut credential_retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return UnitOutcome::Abandoned;
            }

            let err = match self.attempt(task).await {
                Ok(records) => return self.complete(&key, records).await,
                Err(err) => err,
            };

            if err.retries_immediately() {
                if credential_retries >= self.config.max_credential_retries {
                    return self.fail(&key, err).await;
                }
                credential_retries += 1;
                debug!(task = %key, error = %err, "Credential rejected, switching credential");
                continue;
            }

            if !err.is_retryable() || !self.retry.should_retry(backoff_attempt) {
                return self.fail(&key, err).await;
            }

            let delay = self.retry.delay_for_attempt(backoff_attempt);
            backoff_attempt += 1;
            warn!(
                task = %key,
                error = %err,
                attempt = backoff_attempt,
                max = self.retry.max_retries,
                "Attempt failed, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return UnitOutcome::Abandoned,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, task: &TaskUnit) -> Result<Vec<SeriesRecord>, CrawlError> {
        let lease = self.acquire().await?;
        self.ctx.limiter.wait().await;

        let fetched = tokio::time::timeout(
            self.request_timeout(),
            self.ctx.source.fetch_series(task, &lease),
        )
        .await
        .unwrap_or_else(|_| Err(FetchError::Transient("request timed out".to_string())));

        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(fetch_err) => {
                let err = CrawlError::from_fetch(fetch_err, &lease.id);
                self.penalize(&lease, &err).await;
                return Err(err);
            }
        };

        self.reward(&lease).await;

        match outcome {
            FetchOutcome::NoData => Ok(Vec::new()),
            FetchOutcome::Data(SeriesPayload::Plain(values)) => records_from_values(task, &values),
            FetchOutcome::Data(SeriesPayload::Encrypted {
                key_id,
                cipher_text,
            }) => {
                let key = self.fetch_key(&key_id).await?;
                let shape = FieldShape::numeric_csv(task.window.days());
                let plain = decrypt_checked(&key, &cipher_text, &shape)?;
                records_from_values(task, &parse_values(&plain)?)
            }
        }
    }

    /// Resolve a decryption key with a fresh credential and limiter slot.
    async fn fetch_key(&self, key_id: &str) -> Result<String, CrawlError> {
        let lease = self.acquire().await?;
        self.ctx.limiter.wait().await;

        let fetched = tokio::time::timeout(
            self.request_timeout(),
            self.ctx.source.fetch_key(key_id, &lease),
        )
        .await
        .unwrap_or_else(|_| Err(FetchError::Transient("key request timed out".to_string())));

        match fetched {
            Ok(key) => Ok(key),
            Err(err) => {
                // A rejected session is still a bad credential, whatever it was used for.
                if matches!(err, FetchError::CredentialInvalid(_)) {
                    self.report(&lease.id, false, true).await;
                }
                Err(CrawlError::from_key_fetch(err))
            }
        }
    }

    async fn acquire(&self) -> Result<CredentialLease, CrawlError> {
        let wait = self.credential_wait();
        let lease = if wait.is_zero() {
            self.ctx.pool.acquire()?
        } else {
            self.ctx.pool.acquire_within(wait).await?
        };
        Ok(lease)
    }

    async fn reward(&self, lease: &CredentialLease) {
        self.report(&lease.id, true, false).await;
        self.ctx.limiter.report_success();
    }

    async fn penalize(&self, lease: &CredentialLease, err: &CrawlError) {
        if !err.penalizes_credential() {
            return;
        }
        match err {
            CrawlError::CredentialInvalid { .. } => self.report(&lease.id, false, true).await,
            _ => {
                self.report(&lease.id, false, false).await;
                self.ctx.limiter.report_failure();
            }
        }
    }

    async fn report(&self, id: &str, success: bool, permanent: bool) {
        if let Err(e) = self.ctx.pool.report(id, success, permanent).await {
            warn!(credential = %id, error = %e, "Failed to report credential outcome");
        }
    }

    async fn complete(&self, key: &str, records: Vec<SeriesRecord>) -> UnitOutcome {
        let count = records.len();
        if let Err(e) = self.ctx.sink.append(records).await {
            error!(task = %key, error = %e, "Failed to store records");
            return self.fail(key, CrawlError::Storage(e.to_string())).await;
        }
        if let Err(e) = self.ctx.ledger.mark_completed(key, LedgerStatus::Success).await {
            warn!(task = %key, error = %e, "Records stored but success not recorded in ledger");
            return UnitOutcome::Unrecorded { records: count };
        }
        debug!(task = %key, records = count, "Unit completed");
        UnitOutcome::Succeeded { records: count }
    }

    async fn fail(&self, key: &str, err: CrawlError) -> UnitOutcome {
        warn!(task = %key, error = %err, "Unit failed");
        if let Err(e) = self.ctx.ledger.mark_completed(key, LedgerStatus::Failed).await {
            error!(task = %key, error = %e, "Failed to record failure in ledger");
        }
        UnitOutcome::Failed(err)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms.max(1))
    }

    fn credential_wait(&self) -> Duration {
        Duration::from_millis(self.config.credential_wait_ms)
    }
}
