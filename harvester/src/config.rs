//! Process configuration.
//!
//! Loaded from an optional JSON file named by `HARVESTER_CONFIG`, then
//! overridden by `DATABASE_URL`, `HARVESTER_LOG_DIR` and `HARVESTER_WORKERS`.
//! Every field has a default so an empty file (or none) is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::CredentialPoolConfig;
use crate::crawler::{OrchestratorConfig, RateLimiterConfig, RetryPolicy, WorkerPoolConfig};
use crate::ledger::LedgerConfig;
use crate::source::HttpSourceConfig;
use crate::{Error, Result};

pub const CONFIG_PATH_ENV: &str = "HARVESTER_CONFIG";

/// Where credential usage counters are shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Memory,
    /// Requires the `redis-cache` feature.
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix, so several deployments can share one server.
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

fn default_cache_prefix() -> String {
    "harvester".to_string()
}

fn default_state_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: None,
            prefix: default_cache_prefix(),
            state_ttl_secs: default_state_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Rows in the `series_record` table.
    #[default]
    Sqlite,
    JsonLines,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default = "default_jsonl_path")]
    pub jsonl_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sink_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_jsonl_path() -> PathBuf {
    PathBuf::from("data/records.jsonl")
}

fn default_batch_size() -> usize {
    500
}

fn default_sink_flush_interval_ms() -> u64 {
    1000
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            jsonl_path: default_jsonl_path(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_sink_flush_interval_ms(),
        }
    }
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub credentials: CredentialPoolConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub worker: WorkerPoolConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub source: HttpSourceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_database_url() -> String {
    "sqlite:harvester.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            credentials: CredentialPoolConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            ledger: LedgerConfig::default(),
            worker: WorkerPoolConfig::default(),
            retry: RetryPolicy::default(),
            source: HttpSourceConfig::default(),
            cache: CacheConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl HarvesterConfig {
    /// Load from the process environment. Call `dotenvy::dotenv()` first.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = lookup("HARVESTER_LOG_DIR") {
            self.log_dir = dir;
        }
        if let Some(workers) = lookup("HARVESTER_WORKERS") {
            self.worker.max_workers = workers.trim().parse().map_err(|_| {
                Error::config(format!("HARVESTER_WORKERS is not a number: {workers}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        self.rate_limiter.validate()?;
        self.retry.validate()?;
        self.ledger.validate()?;
        self.worker.validate()?;
        self.source.validate()?;
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(Error::config("cache.redis_url is required for the redis backend"));
        }
        if self.sink.batch_size == 0 {
            return Err(Error::config("sink.batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            worker: self.worker.clone(),
            retry: self.retry.clone(),
        }
    }
}
