//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use harvester::config::HarvesterConfig;
use harvester::crawler::TaskUnit;
use harvester::credentials::{Credential, CredentialLease, CredentialState, CredentialStore};
use harvester::database::repositories::SqlxCredentialStore;
use harvester::database::{self, DbPool, WritePool};
use harvester::source::{AnalyticsSource, FetchError, FetchOutcome, SeriesPayload};

type SeriesFn =
    dyn Fn(&TaskUnit, &CredentialLease, usize) -> Result<FetchOutcome, FetchError> + Send + Sync;

/// One recorded `fetch_series` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_key: String,
    pub credential_id: String,
}

/// Analytics source answering from a closure.
///
/// The closure also receives how many calls preceded this one for the same
/// task, so tests can script "fail twice, then succeed".
pub struct FakeSource {
    series: Box<SeriesFn>,
    key: Result<String, FetchError>,
    calls: Mutex<Vec<Call>>,
}

impl FakeSource {
    pub fn new(
        series: impl Fn(&TaskUnit, &CredentialLease, usize) -> Result<FetchOutcome, FetchError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            series: Box::new(series),
            key: Ok(String::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every unit returns one value per day of its window.
    pub fn plain() -> Self {
        Self::new(|task, _, _| {
            let values = (0..task.window.days()).map(|i| Some(i as i64)).collect();
            Ok(FetchOutcome::Data(SeriesPayload::Plain(values)))
        })
    }

    pub fn with_key(mut self, key: Result<String, FetchError>) -> Self {
        self.key = key;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl AnalyticsSource for FakeSource {
    async fn fetch_series(
        &self,
        task: &TaskUnit,
        lease: &CredentialLease,
    ) -> Result<FetchOutcome, FetchError> {
        let key = task.key();
        let previous = {
            let mut calls = self.calls.lock();
            let previous = calls.iter().filter(|c| c.task_key == key).count();
            calls.push(Call {
                task_key: key,
                credential_id: lease.id.clone(),
            });
            previous
        };
        (self.series)(task, lease, previous)
    }

    async fn fetch_key(
        &self,
        _key_id: &str,
        _lease: &CredentialLease,
    ) -> Result<String, FetchError> {
        self.key.clone()
    }
}

pub fn database_url(dir: &Path) -> String {
    format!(
        "sqlite:{}?mode=rwc",
        dir.join("harvester.db").to_string_lossy().replace('\\', "/")
    )
}

/// Open the database with migrations applied.
pub async fn setup_test_db(dir: &Path) -> (DbPool, WritePool) {
    database::open(&database_url(dir))
        .await
        .expect("Failed to open test database")
}

/// Provision credentials directly in the store, optionally with a state.
pub async fn provision(dir: &Path, credentials: &[(&str, CredentialState)]) {
    let (pool, write_pool) = setup_test_db(dir).await;
    let store = SqlxCredentialStore::new(pool.clone(), write_pool.clone());
    for (id, state) in credentials {
        let fields = [("SESSION", format!("token-{id}"))].into_iter().collect();
        store
            .upsert_credential(&Credential::new(*id, fields))
            .await
            .unwrap();
        if *state != CredentialState::Available {
            store
                .save_state(id, *state, chrono::Utc::now().timestamp_millis())
                .await
                .unwrap();
        }
    }
    write_pool.close().await;
    pool.close().await;
}

/// Config tuned for tests: no pacing, no waiting, millisecond backoff.
pub fn fast_config(dir: &Path) -> HarvesterConfig {
    let mut config = HarvesterConfig {
        database_url: database_url(dir),
        log_dir: dir.join("logs").to_string_lossy().into_owned(),
        ..Default::default()
    };
    config.rate_limiter.min_interval_ms = 0;
    config.rate_limiter.max_interval_ms = 0;
    config.worker.max_workers = 2;
    config.worker.credential_wait_ms = 0;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.use_jitter = false;
    config.ledger.flush_threshold = 1;
    config.ledger.journal_dir = dir.join("ledger");
    config.sink.batch_size = 16;
    config
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn shared(source: FakeSource) -> Arc<FakeSource> {
    Arc::new(source)
}
