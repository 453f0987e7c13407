//! Credential persistence abstraction.
//!
//! The SQL implementation lives in the database repository layer
//! (`database::repositories::credential`).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::error::CredentialError;
use super::types::{CounterDelta, Credential, CredentialState};
use crate::database::time::{datetime_to_ms, now_ms};

/// Durable source of truth for credentials across restarts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load every provisioned credential with its persisted state and counters.
    async fn load_all(&self) -> Result<Vec<Credential>, CredentialError>;

    /// Persist a state transition. `changed_at` is epoch ms.
    ///
    /// A stored ban is never overwritten here: returns `Ok(false)` and leaves
    /// the row alone when the credential is already banned. Only
    /// [`unban`](Self::unban) lifts a ban.
    async fn save_state(
        &self,
        id: &str,
        state: CredentialState,
        changed_at: i64,
    ) -> Result<bool, CredentialError>;

    /// Add counter increments and advance `last_used_at`. Unknown ids are ignored.
    async fn save_counters(&self, deltas: &[CounterDelta]) -> Result<(), CredentialError>;

    /// Insert or replace a credential's secret fields. State and counters of an
    /// existing row are left alone.
    async fn upsert_credential(&self, credential: &Credential) -> Result<(), CredentialError>;

    /// Administrative unban: back to `Available` with a fresh `state_changed_at`.
    async fn unban(&self, id: &str) -> Result<(), CredentialError>;
}

/// In-process store for dry runs and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let store = Self::new();
        {
            let mut map = store.credentials.lock();
            for c in credentials {
                map.insert(c.id.clone(), c);
            }
        }
        store
    }

    /// Drop a credential as an administrator would.
    pub fn remove(&self, id: &str) -> Option<Credential> {
        self.credentials.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        self.credentials.lock().get(id).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_all(&self) -> Result<Vec<Credential>, CredentialError> {
        let mut all: Vec<Credential> = self.credentials.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn save_state(
        &self,
        id: &str,
        state: CredentialState,
        changed_at: i64,
    ) -> Result<bool, CredentialError> {
        let mut map = self.credentials.lock();
        let cred = map
            .get_mut(id)
            .ok_or_else(|| CredentialError::UnknownCredential(id.to_string()))?;
        if cred.state.is_banned() {
            return Ok(false);
        }
        cred.state = state;
        cred.state_changed_at = changed_at;
        Ok(true)
    }

    async fn save_counters(&self, deltas: &[CounterDelta]) -> Result<(), CredentialError> {
        let mut map = self.credentials.lock();
        for delta in deltas {
            if let Some(cred) = map.get_mut(&delta.id) {
                cred.usage_count += delta.usage;
                cred.success_count += delta.success;
                cred.failure_count += delta.failure;
                cred.last_used_at = cred.last_used_at.max(delta.last_used_at);
            }
        }
        Ok(())
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), CredentialError> {
        self.credentials
            .lock()
            .entry(credential.id.clone())
            .and_modify(|c| c.secret_fields = credential.secret_fields.clone())
            .or_insert_with(|| credential.clone());
        Ok(())
    }

    async fn unban(&self, id: &str) -> Result<(), CredentialError> {
        let mut map = self.credentials.lock();
        let cred = map
            .get_mut(id)
            .ok_or_else(|| CredentialError::UnknownCredential(id.to_string()))?;
        cred.state = CredentialState::Available;
        cred.state_changed_at = now_ms();
        Ok(())
    }
}

/// Persisted form of `last_used_at`.
pub(crate) fn last_used_ms(delta: &CounterDelta) -> Option<i64> {
    delta.last_used_at.map(datetime_to_ms)
}
