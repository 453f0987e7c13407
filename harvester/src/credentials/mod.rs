//! Credential management.
//!
//! # Architecture
//!
//! - [`Credential`]: typed credential with ordered [`SecretFields`] and a [`CredentialState`]
//! - [`CredentialPool`]: selection, cooldown/ban bookkeeping, resync and pool events
//! - [`CredentialStore`]: durable persistence (SQL implementation in the repository layer)
//! - [`CredentialCache`]: best-effort shared usage counters

mod cache;
mod error;
mod pool;
mod store;
mod types;

#[cfg(feature = "redis-cache")]
pub use cache::RedisCredentialCache;
pub use cache::{CachedUsage, CredentialCache, MemoryCredentialCache};
pub use error::CredentialError;
pub use pool::{CredentialPool, ResyncReport};
pub use store::{CredentialStore, MemoryCredentialStore};
pub(crate) use store::last_used_ms;
pub use types::{
    CounterDelta, Credential, CredentialLease, CredentialPoolConfig, CredentialSnapshot,
    CredentialState, PoolEvent, SecretFields,
};
