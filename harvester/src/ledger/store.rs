//! Durable ledger storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::types::{LedgerEntry, merge_into};
use crate::Result;

/// Durable backing store for a [`ProgressLedger`](super::ProgressLedger).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Every entry recorded under `ledger`, one per key.
    async fn load(&self, ledger: &str) -> Result<Vec<LedgerEntry>>;

    /// Merge a batch into durable state. Never overwrites blindly: per key,
    /// success beats failure and otherwise the newest entry wins.
    async fn merge(&self, ledger: &str, entries: Vec<LedgerEntry>) -> Result<()>;
}

/// Non-durable store, handy for dry runs and tests.
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledgers: Mutex<HashMap<String, HashMap<String, LedgerEntry>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self, ledger: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .ledgers
            .lock()
            .get(ledger)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn merge(&self, ledger: &str, entries: Vec<LedgerEntry>) -> Result<()> {
        let mut ledgers = self.ledgers.lock();
        let map = ledgers.entry(ledger.to_string()).or_default();
        for entry in entries {
            merge_into(map, entry);
        }
        Ok(())
    }
}
