//! In-memory view of task outcomes with batched durable writes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::store::LedgerStore;
use super::types::{LedgerConfig, LedgerEntry, LedgerStats, LedgerStatus, coalesce, merge_into};
use crate::Result;
use crate::database::{BatchWriter, BatchWriterConfig};

/// Resumable record of which task keys have completed.
///
/// Reads are served from memory. Writes update memory immediately and are
/// queued to a single flush task that merges them into the store.
pub struct ProgressLedger {
    name: String,
    entries: Mutex<HashMap<String, LedgerEntry>>,
    store: Arc<dyn LedgerStore>,
    writer: BatchWriter<LedgerEntry>,
}

impl ProgressLedger {
    /// Load ledger `name` from `store`.
    #[instrument(skip(store, config))]
    pub async fn open(
        name: &str,
        store: Arc<dyn LedgerStore>,
        config: &LedgerConfig,
    ) -> Result<Self> {
        let loaded = store.load(name).await?;
        let mut entries = HashMap::with_capacity(loaded.len());
        for entry in loaded {
            merge_into(&mut entries, entry);
        }

        let writer = {
            let store = Arc::clone(&store);
            let ledger = name.to_string();
            BatchWriter::new(
                BatchWriterConfig {
                    max_buffer_size: config.flush_threshold.max(1),
                    flush_interval: config.flush_interval(),
                },
                move |batch: Vec<LedgerEntry>| {
                    let store = Arc::clone(&store);
                    let ledger = ledger.clone();
                    async move {
                        let batch = coalesce(batch);
                        debug!(ledger = %ledger, entries = batch.len(), "Flushing ledger batch");
                        store.merge(&ledger, batch).await
                    }
                },
            )
        };

        let ledger = Self {
            name: name.to_string(),
            entries: Mutex::new(entries),
            store,
            writer,
        };
        let stats = ledger.stats();
        info!(
            ledger = %name,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Progress ledger opened"
        );
        Ok(ledger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True only when `key` has been recorded as a success.
    pub fn is_completed(&self, key: &str) -> bool {
        self.status(key) == Some(LedgerStatus::Success)
    }

    pub fn status(&self, key: &str) -> Option<LedgerStatus> {
        self.entries.lock().get(key).map(|e| e.status)
    }

    /// Record an outcome for `key`.
    ///
    /// A failure never replaces a recorded success. Entries that change the
    /// in-memory state are queued for the next flush.
    pub async fn mark_completed(&self, key: &str, status: LedgerStatus) -> Result<()> {
        let entry = LedgerEntry::new(key, status);
        let changed = merge_into(&mut self.entries.lock(), entry.clone());
        if changed {
            self.writer.add(entry).await?;
        }
        Ok(())
    }

    /// Write pending entries now.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// Flush and stop the writer. The ledger stays readable.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Merge durable state written by others into memory. Returns how many keys changed.
    pub async fn refresh(&self) -> Result<usize> {
        let loaded = self.store.load(&self.name).await?;
        let mut entries = self.entries.lock();
        Ok(loaded
            .into_iter()
            .filter(|e| merge_into(&mut entries, e.clone()))
            .count())
    }

    pub fn stats(&self) -> LedgerStats {
        let entries = self.entries.lock();
        let succeeded = entries
            .values()
            .filter(|e| e.status == LedgerStatus::Success)
            .count();
        LedgerStats {
            succeeded,
            failed: entries.len() - succeeded,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;

    fn config() -> LedgerConfig {
        LedgerConfig {
            flush_threshold: 100,
            flush_interval_ms: 60_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mark_and_resume() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ProgressLedger::open("run", store.clone(), &config())
            .await
            .unwrap();

        ledger.mark_completed("a", LedgerStatus::Success).await.unwrap();
        ledger.mark_completed("b", LedgerStatus::Failed).await.unwrap();
        assert!(ledger.is_completed("a"));
        assert!(!ledger.is_completed("b"));
        assert!(!ledger.is_completed("c"));

        // Nothing durable until flushed.
        assert!(store.load("run").await.unwrap().is_empty());
        ledger.flush().await.unwrap();

        let reopened = ProgressLedger::open("run", store, &config()).await.unwrap();
        assert!(reopened.is_completed("a"));
        assert_eq!(reopened.status("b"), Some(LedgerStatus::Failed));
        assert_eq!(
            reopened.stats(),
            LedgerStats {
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failure_after_success_is_ignored() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ProgressLedger::open("run", store.clone(), &config())
            .await
            .unwrap();

        ledger.mark_completed("a", LedgerStatus::Success).await.unwrap();
        ledger.mark_completed("a", LedgerStatus::Failed).await.unwrap();
        assert!(ledger.is_completed("a"));

        ledger.mark_completed("b", LedgerStatus::Failed).await.unwrap();
        ledger.mark_completed("b", LedgerStatus::Success).await.unwrap();
        assert!(ledger.is_completed("b"));

        ledger.shutdown().await.unwrap();
        let durable = store.load("run").await.unwrap();
        assert!(durable.iter().all(|e| e.status == LedgerStatus::Success));
    }

    #[tokio::test]
    async fn test_flush_on_threshold() {
        let store = Arc::new(MemoryLedgerStore::new());
        let config = LedgerConfig {
            flush_threshold: 2,
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        let ledger = ProgressLedger::open("run", store.clone(), &config)
            .await
            .unwrap();
        ledger.mark_completed("a", LedgerStatus::Success).await.unwrap();
        ledger.mark_completed("b", LedgerStatus::Success).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.load("run").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_other_writers() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ProgressLedger::open("run", store.clone(), &config())
            .await
            .unwrap();
        ledger.mark_completed("a", LedgerStatus::Failed).await.unwrap();

        store
            .merge("run", vec![LedgerEntry::new("a", LedgerStatus::Success)])
            .await
            .unwrap();
        assert_eq!(ledger.refresh().await.unwrap(), 1);
        assert!(ledger.is_completed("a"));
    }
}
