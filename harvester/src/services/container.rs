//! Service container.
//!
//! Builds every long-lived service once and hands them out as `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CacheBackend, HarvesterConfig, SinkKind};
use crate::credentials::{CredentialCache, CredentialPool, MemoryCredentialCache, PoolEvent};
use crate::crawler::{CrawlContext, Orchestrator, RateLimiter};
use crate::database::repositories::{
    SqlxCredentialStore, SqlxLedgerStore, SqlxSeriesRecordRepository,
};
use crate::database::{self, BatchWriterConfig, DbPool, WritePool};
use crate::ledger::{JournalLedgerStore, LedgerBackend, LedgerStore, ProgressLedger};
use crate::sink::{JsonLinesSink, RecordSink, SqlxRecordSink};
use crate::source::{AnalyticsSource, HttpAnalyticsSource};
use crate::{Error, Result};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServiceContainer {
    pub pool: DbPool,
    pub write_pool: WritePool,
    pub credentials: Arc<CredentialPool>,
    pub limiter: Arc<RateLimiter>,
    pub ledger: Arc<ProgressLedger>,
    pub source: Arc<dyn AnalyticsSource>,
    pub sink: Arc<dyn RecordSink>,
    pub orchestrator: Arc<Orchestrator>,
    cancellation_token: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Open the database and build services with the HTTP source.
    pub async fn new(config: &HarvesterConfig) -> Result<Self> {
        let source = Arc::new(HttpAnalyticsSource::new(config.source.clone())?);
        Self::with_source(config, source).await
    }

    /// Build services around a caller-provided source.
    pub async fn with_source(
        config: &HarvesterConfig,
        source: Arc<dyn AnalyticsSource>,
    ) -> Result<Self> {
        info!("Initializing service container");
        let (pool, write_pool) = database::open(&config.database_url).await?;

        let cache = build_cache(config).await?;
        let store = Arc::new(SqlxCredentialStore::new(pool.clone(), write_pool.clone()));
        let credentials =
            Arc::new(CredentialPool::load(store, cache, config.credentials.clone()).await?);
        if credentials.is_empty() {
            warn!("No credentials provisioned; every unit will fail until some are added");
        }

        let limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));

        let ledger_store: Arc<dyn LedgerStore> = match config.ledger.backend {
            LedgerBackend::Sqlite => Arc::new(SqlxLedgerStore::new(pool.clone(), write_pool.clone())),
            LedgerBackend::Journal => Arc::new(JournalLedgerStore::new(
                &config.ledger.journal_dir,
                config.ledger.segment_max_entries,
                config.ledger.compact_after_segments,
            )),
        };
        let ledger = Arc::new(
            ProgressLedger::open(&config.ledger.name, ledger_store, &config.ledger).await?,
        );

        let sink: Arc<dyn RecordSink> = match config.sink.kind {
            SinkKind::Sqlite => {
                let repo = Arc::new(SqlxSeriesRecordRepository::new(
                    pool.clone(),
                    write_pool.clone(),
                ));
                Arc::new(SqlxRecordSink::new(
                    repo,
                    BatchWriterConfig {
                        max_buffer_size: config.sink.batch_size,
                        flush_interval: config.sink.flush_interval(),
                    },
                ))
            }
            SinkKind::JsonLines => Arc::new(JsonLinesSink::open(&config.sink.jsonl_path).await?),
        };

        let ctx = CrawlContext {
            pool: credentials.clone(),
            limiter: limiter.clone(),
            ledger: ledger.clone(),
            source: source.clone(),
            sink: sink.clone(),
        };
        let orchestrator = Arc::new(Orchestrator::new(ctx, config.orchestrator()));

        info!(
            credentials = credentials.len(),
            available = credentials.available_count(),
            completed = ledger.stats().succeeded,
            "Service container initialized"
        );

        Ok(Self {
            pool,
            write_pool,
            credentials,
            limiter,
            ledger,
            source,
            sink,
            orchestrator,
            cancellation_token: CancellationToken::new(),
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start background maintenance: credential resync and pool event logging.
    pub fn initialize(&self) {
        let resync = self
            .credentials
            .spawn_resync(self.cancellation_token.child_token());
        let events = self.spawn_event_logger();
        self.background.lock().extend([resync, events]);
        debug!("Background services started");
    }

    fn spawn_event_logger(&self) -> JoinHandle<()> {
        let mut rx = self.credentials.subscribe();
        let cancel = self.cancellation_token.child_token();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(PoolEvent::Degraded { available, minimum }) => {
                        warn!(available, minimum, "Credential pool degraded")
                    }
                    Ok(PoolEvent::Recovered { available }) => {
                        info!(available, "Credential pool recovered")
                    }
                    Ok(PoolEvent::Banned { id }) => warn!(credential = %id, "Credential banned"),
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "Pool event logger lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop the crawl, flush outputs and close the database.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.orchestrator.stop();
        self.cancellation_token.cancel();

        let drained = tokio::time::timeout(timeout, async {
            let snapshot = self.orchestrator.wait().await;
            let handles = std::mem::take(&mut *self.background.lock());
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task failed");
                }
            }
            snapshot
        })
        .await;

        let result = match drained {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Shutdown timeout reached, forcing shutdown");
                Err(Error::Other("Shutdown timed out".to_string()))
            }
        };

        if let Err(e) = self.ledger.shutdown().await {
            warn!(error = %e, "Failed to flush ledger on shutdown");
        }
        if let Err(e) = self.credentials.resync().await {
            warn!(error = %e, "Failed to persist credential counters on shutdown");
        }

        self.write_pool.close().await;
        self.pool.close().await;
        info!("Services shut down");
        result
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

async fn build_cache(config: &HarvesterConfig) -> Result<Option<Arc<dyn CredentialCache>>> {
    match config.cache.backend {
        CacheBackend::Memory => Ok(Some(Arc::new(MemoryCredentialCache::new()))),
        #[cfg(feature = "redis-cache")]
        CacheBackend::Redis => {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .ok_or_else(|| Error::config("cache.redis_url is required"))?;
            let cache = crate::credentials::RedisCredentialCache::connect(
                url,
                config.cache.prefix.clone(),
                config.cache.state_ttl_secs,
            )
            .await?;
            info!("Using Redis credential cache");
            Ok(Some(Arc::new(cache)))
        }
        #[cfg(not(feature = "redis-cache"))]
        CacheBackend::Redis => Err(Error::config(
            "cache.backend = redis needs the redis-cache feature",
        )),
    }
}
