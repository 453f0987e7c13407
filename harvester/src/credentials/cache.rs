//! Shared usage cache.
//!
//! The cache spreads usage counters across processes so selection stays
//! balanced when several harvesters share one credential set. It is never
//! consulted for availability state, and every error is swallowed by the pool.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use super::error::CredentialError;
use super::types::CredentialSnapshot;

/// Usage counters as seen by the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedUsage {
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl CachedUsage {
    fn record(&mut self, success: bool) {
        if success {
            self.usage_count += 1;
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }
}

#[async_trait]
pub trait CredentialCache: Send + Sync {
    /// Count one reported use.
    async fn record_use(&self, id: &str, success: bool) -> Result<(), CredentialError>;

    /// Counters for the given ids. Missing ids are simply absent from the map.
    async fn usage(&self, ids: &[String]) -> Result<HashMap<String, CachedUsage>, CredentialError>;

    /// Mirror the latest state of a credential.
    async fn put_state(&self, snapshot: &CredentialSnapshot) -> Result<(), CredentialError>;
}

/// In-process cache.
#[derive(Default)]
pub struct MemoryCredentialCache {
    usage: DashMap<String, CachedUsage>,
    states: DashMap<String, CredentialSnapshot>,
}

impl MemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: &str) -> Option<CredentialSnapshot> {
        self.states.get(id).map(|s| s.clone())
    }

    /// Seed counters, e.g. to simulate another process.
    pub fn set_usage(&self, id: impl Into<String>, usage: CachedUsage) {
        self.usage.insert(id.into(), usage);
    }
}

#[async_trait]
impl CredentialCache for MemoryCredentialCache {
    async fn record_use(&self, id: &str, success: bool) -> Result<(), CredentialError> {
        self.usage.entry(id.to_string()).or_default().record(success);
        Ok(())
    }

    async fn usage(&self, ids: &[String]) -> Result<HashMap<String, CachedUsage>, CredentialError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.usage.get(id).map(|u| (id.clone(), *u)))
            .collect())
    }

    async fn put_state(&self, snapshot: &CredentialSnapshot) -> Result<(), CredentialError> {
        self.states.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }
}

#[cfg(feature = "redis-cache")]
pub use redis_cache::RedisCredentialCache;

#[cfg(feature = "redis-cache")]
mod redis_cache {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Client};

    fn cache_err(e: redis::RedisError) -> CredentialError {
        CredentialError::Cache(e.to_string())
    }

    /// Redis-backed cache shared by every harvester pointed at the same server.
    #[derive(Clone)]
    pub struct RedisCredentialCache {
        conn: ConnectionManager,
        prefix: String,
        state_ttl_secs: u64,
    }

    impl RedisCredentialCache {
        /// Connect to `redis_url` (e.g. "redis://127.0.0.1:6379").
        pub async fn connect(
            redis_url: &str,
            prefix: impl Into<String>,
            state_ttl_secs: u64,
        ) -> Result<Self, CredentialError> {
            let client = Client::open(redis_url).map_err(cache_err)?;
            let conn = ConnectionManager::new(client).await.map_err(cache_err)?;
            Ok(Self {
                conn,
                prefix: prefix.into(),
                state_ttl_secs: state_ttl_secs.max(1),
            })
        }

        fn usage_key(&self, id: &str) -> String {
            format!("{}:usage:{}", self.prefix, id)
        }

        fn state_key(&self, id: &str) -> String {
            format!("{}:state:{}", self.prefix, id)
        }
    }

    #[async_trait]
    impl CredentialCache for RedisCredentialCache {
        async fn record_use(&self, id: &str, success: bool) -> Result<(), CredentialError> {
            let key = self.usage_key(id);
            let mut conn = self.conn.clone();
            if success {
                let _: i64 = conn.hincr(&key, "usage", 1).await.map_err(cache_err)?;
                let _: i64 = conn.hincr(&key, "success", 1).await.map_err(cache_err)?;
            } else {
                let _: i64 = conn.hincr(&key, "failure", 1).await.map_err(cache_err)?;
            }
            Ok(())
        }

        async fn usage(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, CachedUsage>, CredentialError> {
            let mut conn = self.conn.clone();
            let mut out = HashMap::with_capacity(ids.len());
            for id in ids {
                let fields: HashMap<String, u64> = conn
                    .hgetall(self.usage_key(id))
                    .await
                    .map_err(cache_err)?;
                if fields.is_empty() {
                    continue;
                }
                let get = |name: &str| fields.get(name).copied().unwrap_or(0);
                out.insert(
                    id.clone(),
                    CachedUsage {
                        usage_count: get("usage"),
                        success_count: get("success"),
                        failure_count: get("failure"),
                    },
                );
            }
            Ok(out)
        }

        async fn put_state(&self, snapshot: &CredentialSnapshot) -> Result<(), CredentialError> {
            let payload = serde_json::to_string(snapshot)
                .map_err(|e| CredentialError::Internal(e.to_string()))?;
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(self.state_key(&snapshot.id))
                .arg(payload)
                .arg("EX")
                .arg(self.state_ttl_secs)
                .query_async(&mut conn)
                .await
                .map_err(cache_err)?;
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_counts() {
        let cache = MemoryCredentialCache::new();
        cache.record_use("a", true).await.unwrap();
        cache.record_use("a", true).await.unwrap();
        cache.record_use("a", false).await.unwrap();

        let usage = cache
            .usage(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(
            usage["a"],
            CachedUsage {
                usage_count: 2,
                success_count: 2,
                failure_count: 1
            }
        );
    }
}
