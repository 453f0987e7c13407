//! Ledger entries and the merge rule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::database::time::now_ms;

/// Outcome recorded for a task key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: String,
    pub status: LedgerStatus,
    /// Unix epoch milliseconds (UTC).
    pub updated_at: i64,
}

impl LedgerEntry {
    pub fn new(key: impl Into<String>, status: LedgerStatus) -> Self {
        Self {
            key: key.into(),
            status,
            updated_at: now_ms(),
        }
    }

    /// True if `self` should replace `current` for the same key.
    ///
    /// Success beats failure regardless of time; between equal statuses the
    /// newer timestamp wins.
    pub fn supersedes(&self, current: &LedgerEntry) -> bool {
        match (current.status, self.status) {
            (LedgerStatus::Success, LedgerStatus::Failed) => false,
            (LedgerStatus::Failed, LedgerStatus::Success) => true,
            _ => self.updated_at > current.updated_at,
        }
    }
}

/// Merge `incoming` into `map`. Returns true if the map changed.
pub fn merge_into(map: &mut HashMap<String, LedgerEntry>, incoming: LedgerEntry) -> bool {
    match map.get(&incoming.key) {
        Some(current) if !incoming.supersedes(current) => false,
        _ => {
            map.insert(incoming.key.clone(), incoming);
            true
        }
    }
}

/// Collapse a batch to one entry per key using the merge rule.
pub fn coalesce(entries: impl IntoIterator<Item = LedgerEntry>) -> Vec<LedgerEntry> {
    let mut map = HashMap::new();
    for entry in entries {
        merge_into(&mut map, entry);
    }
    let mut out: Vec<LedgerEntry> = map.into_values().collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub succeeded: usize,
    pub failed: usize,
}

/// Where the ledger keeps its durable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Journal,
}

/// Progress ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger name; runs sharing a name share progress.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub backend: LedgerBackend,

    /// Pending entries that trigger a flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Directory for the journal backend.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,

    /// Maximum lines per journal segment.
    #[serde(default = "default_segment_max_entries")]
    pub segment_max_entries: usize,

    /// Compact once this many segments accumulate.
    #[serde(default = "default_compact_after_segments")]
    pub compact_after_segments: usize,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_flush_threshold() -> usize {
    50
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from("data/ledger")
}

fn default_segment_max_entries() -> usize {
    500
}

fn default_compact_after_segments() -> usize {
    32
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            backend: LedgerBackend::default(),
            flush_threshold: default_flush_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            journal_dir: default_journal_dir(),
            segment_max_entries: default_segment_max_entries(),
            compact_after_segments: default_compact_after_segments(),
        }
    }
}

impl LedgerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::config("ledger.name must not be empty"));
        }
        if self.flush_threshold == 0 || self.segment_max_entries == 0 {
            return Err(crate::Error::config(
                "ledger.flush_threshold and ledger.segment_max_entries must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, status: LedgerStatus, at: i64) -> LedgerEntry {
        LedgerEntry {
            key: key.to_string(),
            status,
            updated_at: at,
        }
    }

    #[test]
    fn test_success_is_sticky() {
        let mut map = HashMap::new();
        assert!(merge_into(&mut map, entry("k", LedgerStatus::Success, 1)));
        // A later failure does not overwrite.
        assert!(!merge_into(&mut map, entry("k", LedgerStatus::Failed, 99)));
        assert_eq!(map["k"].status, LedgerStatus::Success);
    }

    #[test]
    fn test_success_overrides_failed() {
        let mut map = HashMap::new();
        merge_into(&mut map, entry("k", LedgerStatus::Failed, 50));
        // Even with an older timestamp.
        assert!(merge_into(&mut map, entry("k", LedgerStatus::Success, 10)));
        assert_eq!(map["k"].status, LedgerStatus::Success);
    }

    #[test]
    fn test_same_status_newest_wins() {
        let mut map = HashMap::new();
        merge_into(&mut map, entry("k", LedgerStatus::Failed, 50));
        assert!(!merge_into(&mut map, entry("k", LedgerStatus::Failed, 40)));
        assert!(merge_into(&mut map, entry("k", LedgerStatus::Failed, 60)));
        assert_eq!(map["k"].updated_at, 60);
    }

    #[test]
    fn test_coalesce_batch() {
        let batch = vec![
            entry("a", LedgerStatus::Failed, 1),
            entry("b", LedgerStatus::Failed, 1),
            entry("a", LedgerStatus::Success, 2),
            entry("a", LedgerStatus::Failed, 3),
        ];
        let out = coalesce(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "a");
        assert_eq!(out[0].status, LedgerStatus::Success);
        assert_eq!(out[1].status, LedgerStatus::Failed);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(LedgerStatus::Success.to_string(), "success");
        assert_eq!("failed".parse::<LedgerStatus>().unwrap(), LedgerStatus::Failed);
    }
}
