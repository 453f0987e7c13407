//! End-to-end runs through the service container against a scripted source.

mod common;

use chrono::NaiveDate;
use tempfile::TempDir;

use common::{FakeSource, fast_config, provision, setup_test_db, shared, strings};
use harvester::crawler::{DataKind, TaskUnit, TimeWindow};
use harvester::credentials::{CredentialState, CredentialStore};
use harvester::database::repositories::{
    SeriesRecordRepository, SqlxCredentialStore, SqlxSeriesRecordRepository,
};
use harvester::ledger::{LedgerBackend, LedgerStatus};
use harvester::services::ServiceContainer;
use harvester::source::{FetchError, FetchOutcome, SeriesPayload};

fn window() -> TimeWindow {
    let d = |n| NaiveDate::from_ymd_opt(2024, 2, n).unwrap();
    TimeWindow::new(d(1), d(3)).unwrap()
}

#[tokio::test]
async fn banned_credential_is_never_used() {
    let dir = TempDir::new().unwrap();
    provision(
        dir.path(),
        &[
            ("acct-a", CredentialState::PermanentlyBanned),
            ("acct-b", CredentialState::Available),
        ],
    )
    .await;

    let source = shared(FakeSource::plain());
    let services = ServiceContainer::with_source(&fast_config(dir.path()), source.clone())
        .await
        .unwrap();
    let orch = services.orchestrator.clone();

    let queued = orch.submit_tasks(
        &strings(&["k1", "k2", "k3"]),
        &strings(&["10", "20"]),
        &[window()],
        &[DataKind::Search],
    );
    assert_eq!(queued, 6);
    orch.start().unwrap();
    let summary = orch.wait().await.unwrap();

    assert_eq!(summary.succeeded, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.percent, 100.0);
    assert_eq!(source.call_count(), 6);
    assert!(source.calls().iter().all(|c| c.credential_id == "acct-b"));

    services.shutdown().await.unwrap();

    let (pool, write_pool) = setup_test_db(dir.path()).await;
    let repo = SqlxSeriesRecordRepository::new(pool, write_pool);
    assert_eq!(repo.count().await.unwrap(), 18);
    let series = repo.find_series("k2", "20", DataKind::Search).await.unwrap();
    let values: Vec<_> = series.iter().map(|r| r.value).collect();
    assert_eq!(values, vec![Some(0), Some(1), Some(2)]);
}

async fn resume_skips_completed_units(backend: LedgerBackend) {
    let dir = TempDir::new().unwrap();
    provision(dir.path(), &[("acct-a", CredentialState::Available)]).await;
    let mut config = fast_config(dir.path());
    config.ledger.backend = backend;

    // First run completes 4 of the 6 units.
    let first = shared(FakeSource::plain());
    let services = ServiceContainer::with_source(&config, first.clone())
        .await
        .unwrap();
    services.orchestrator.submit_tasks(
        &strings(&["k1", "k2"]),
        &strings(&["10", "20"]),
        &[window()],
        &[DataKind::Feed],
    );
    services.orchestrator.start().unwrap();
    services.orchestrator.wait().await.unwrap();
    services.shutdown().await.unwrap();
    assert_eq!(first.call_count(), 4);

    let second = shared(FakeSource::plain());
    let services = ServiceContainer::with_source(&config, second.clone())
        .await
        .unwrap();
    let queued = services.orchestrator.submit_tasks(
        &strings(&["k1", "k2", "k3"]),
        &strings(&["10", "20"]),
        &[window()],
        &[DataKind::Feed],
    );
    assert_eq!(queued, 2);
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();
    services.shutdown().await.unwrap();

    assert_eq!(second.call_count(), 2);
    assert!(second.calls().iter().all(|c| c.task_key.ends_with("k3")));
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 4);
}

#[tokio::test]
async fn resume_with_sqlite_ledger() {
    resume_skips_completed_units(LedgerBackend::Sqlite).await;
}

#[tokio::test]
async fn resume_with_journal_ledger() {
    resume_skips_completed_units(LedgerBackend::Journal).await;
}

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let dir = TempDir::new().unwrap();
    provision(dir.path(), &[("acct-a", CredentialState::Available)]).await;
    let mut config = fast_config(dir.path());
    // Cooldown expires at once so the single credential can be reused.
    config.credentials.cooldown_secs = 0;
    config.retry.max_retries = 3;

    let source = shared(FakeSource::new(|task, _, previous| {
        if previous < 2 {
            Err(FetchError::Transient("HTTP 429".into()))
        } else {
            Ok(FetchOutcome::Data(SeriesPayload::Plain(vec![
                Some(5);
                task.window.days()
            ])))
        }
    }));
    let services = ServiceContainer::with_source(&config, source.clone())
        .await
        .unwrap();
    services
        .orchestrator
        .submit_tasks(&strings(&["k"]), &strings(&["1"]), &[window()], &[DataKind::News]);
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(source.call_count(), 3);
    assert_eq!(services.limiter.consecutive_failures(), 0);
    let snap = &services.credentials.snapshot()[0];
    assert_eq!(snap.failure_count, 2);
    assert_eq!(snap.success_count, 1);
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_mark_unit_failed() {
    let dir = TempDir::new().unwrap();
    provision(dir.path(), &[("acct-a", CredentialState::Available)]).await;
    let mut config = fast_config(dir.path());
    config.retry.max_retries = 2;

    let source = shared(FakeSource::new(|_, _, _| {
        Err(FetchError::Transient("HTTP 503".into()))
    }));
    let services = ServiceContainer::with_source(&config, source.clone())
        .await
        .unwrap();
    services
        .orchestrator
        .submit_tasks(&strings(&["k"]), &strings(&["1"]), &[window()], &[DataKind::Search]);
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    let key = TaskUnit::new("k", "1", window(), DataKind::Search).key();
    assert_eq!(services.ledger.status(&key), Some(LedgerStatus::Failed));
    // The one credential went into cooldown; later attempts found none free.
    assert_eq!(source.call_count(), 1);
    assert!(matches!(
        services.credentials.snapshot()[0].state,
        CredentialState::Cooldown { .. }
    ));
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn incomplete_data_does_not_penalize_credential() {
    let dir = TempDir::new().unwrap();
    provision(dir.path(), &[("acct-a", CredentialState::Available)]).await;
    let mut config = fast_config(dir.path());
    config.retry.max_retries = 1;

    // Two fields for a three-day window.
    let source = shared(
        FakeSource::new(|_, _, _| {
            Ok(FetchOutcome::Data(SeriesPayload::Encrypted {
                key_id: "uniq".into(),
                cipher_text: "a,b".into(),
            }))
        })
        .with_key(Ok("ab12".into())),
    );
    let services = ServiceContainer::with_source(&config, source.clone())
        .await
        .unwrap();
    services
        .orchestrator
        .submit_tasks(&strings(&["k"]), &strings(&["1"]), &[window()], &[DataKind::Search]);
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(source.call_count(), 2);
    let snap = &services.credentials.snapshot()[0];
    assert_eq!(snap.state, CredentialState::Available);
    assert_eq!(snap.failure_count, 0);
    services.shutdown().await.unwrap();
}

#[tokio::test]
async fn encrypted_payload_is_decoded_and_stored() {
    let dir = TempDir::new().unwrap();
    provision(dir.path(), &[("acct-a", CredentialState::Available)]).await;

    let source = shared(
        FakeSource::new(|_, _, _| {
            Ok(FetchOutcome::Data(SeriesPayload::Encrypted {
                key_id: "uniq".into(),
                cipher_text: "xy,,yx".into(),
            }))
        })
        .with_key(Ok("xy47".into())),
    );
    let services = ServiceContainer::with_source(&fast_config(dir.path()), source.clone())
        .await
        .unwrap();
    services
        .orchestrator
        .submit_tasks(&strings(&["k"]), &strings(&["1"]), &[window()], &[DataKind::Search]);
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    services.shutdown().await.unwrap();

    let (pool, write_pool) = setup_test_db(dir.path()).await;
    let repo = SqlxSeriesRecordRepository::new(pool, write_pool);
    let values: Vec<_> = repo
        .find_series("k", "1", DataKind::Search)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(values, vec![Some(47), None, Some(74)]);
}

#[tokio::test]
async fn rejected_credential_is_banned_durably() {
    let dir = TempDir::new().unwrap();
    provision(
        dir.path(),
        &[
            ("acct-a", CredentialState::Available),
            ("acct-b", CredentialState::Available),
        ],
    )
    .await;

    let source = shared(FakeSource::new(|task, lease, _| {
        if lease.id == "acct-a" {
            Err(FetchError::CredentialInvalid("not logged in".into()))
        } else {
            Ok(FetchOutcome::Data(SeriesPayload::Plain(vec![
                Some(1);
                task.window.days()
            ])))
        }
    }));
    let services = ServiceContainer::with_source(&fast_config(dir.path()), source.clone())
        .await
        .unwrap();
    services.orchestrator.submit_tasks(
        &strings(&["k1", "k2"]),
        &strings(&["1"]),
        &[window()],
        &[DataKind::Search],
    );
    services.orchestrator.start().unwrap();
    let summary = services.orchestrator.wait().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    services.shutdown().await.unwrap();

    let (pool, write_pool) = setup_test_db(dir.path()).await;
    let store = SqlxCredentialStore::new(pool, write_pool);
    let loaded = store.load_all().await.unwrap();
    let a = loaded.iter().find(|c| c.id == "acct-a").unwrap();
    let b = loaded.iter().find(|c| c.id == "acct-b").unwrap();
    assert_eq!(a.state, CredentialState::PermanentlyBanned);
    assert_eq!(b.state, CredentialState::Available);
    assert_eq!(b.success_count, 2);
}
