//! File-backed ledger store.
//!
//! Each ledger lives in its own directory as a `snapshot.jsonl` plus
//! append-only `segment-NNNNNNNN.jsonl` files, one JSON entry per line. A flush
//! writes only its batch, split into segments of at most `segment_max_entries`
//! lines. Compaction folds the snapshot and every segment into a new snapshot
//! (write-then-rename) and removes the folded segments.
//!
//! Several processes may share a ledger directory. Segment names are claimed
//! with a hard link, which fails instead of replacing an existing file, and only
//! the holder of `compact.lock` compacts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::LedgerStore;
use super::types::{LedgerEntry, merge_into};
use crate::{Error, Result};

const SNAPSHOT_FILE: &str = "snapshot.jsonl";
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const COMPACT_LOCK: &str = "compact.lock";
/// A compaction lock older than this was left by a writer that died.
const STALE_COMPACT_LOCK: Duration = Duration::from_secs(300);

pub struct JournalLedgerStore {
    root: PathBuf,
    segment_max_entries: usize,
    compact_after_segments: usize,
    // One writer at a time within this process.
    io_lock: Mutex<()>,
}

impl JournalLedgerStore {
    pub fn new(
        root: impl Into<PathBuf>,
        segment_max_entries: usize,
        compact_after_segments: usize,
    ) -> Self {
        Self {
            root: root.into(),
            segment_max_entries: segment_max_entries.max(1),
            compact_after_segments: compact_after_segments.max(1),
            io_lock: Mutex::new(()),
        }
    }

    fn ledger_dir(&self, ledger: &str) -> Result<PathBuf> {
        if ledger.is_empty()
            || ledger
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(Error::validation(format!(
                "ledger name '{ledger}' must be non-empty and use only [A-Za-z0-9_-]"
            )));
        }
        Ok(self.root.join(ledger))
    }

    /// Fold every segment of `ledger` into its snapshot.
    pub async fn compact(&self, ledger: &str) -> Result<()> {
        let _guard = self.io_lock.lock().await;
        self.compact_locked(ledger).await
    }

    /// Number of uncompacted segments.
    pub async fn segment_count(&self, ledger: &str) -> Result<usize> {
        let dir = self.ledger_dir(ledger)?;
        Ok(list_segments(&dir).await?.len())
    }

    async fn compact_locked(&self, ledger: &str) -> Result<()> {
        let dir = self.ledger_dir(ledger)?;
        if list_segments(&dir).await?.is_empty() {
            return Ok(());
        }
        if !claim_compaction(&dir).await? {
            debug!(ledger, "Another writer is compacting, skipping");
            return Ok(());
        }

        let result = self.fold_segments(ledger, &dir).await;
        if let Err(e) = fs::remove_file(dir.join(COMPACT_LOCK)).await {
            warn!(ledger, error = %e, "Failed to release compaction lock");
        }
        result
    }

    async fn fold_segments(&self, ledger: &str, dir: &Path) -> Result<()> {
        let segments = list_segments(dir).await?;
        if segments.is_empty() {
            return Ok(());
        }

        let mut state = HashMap::new();
        read_entries(&dir.join(SNAPSHOT_FILE), &mut state).await?;
        for (_, path) in &segments {
            read_entries(path, &mut state).await?;
        }

        let mut entries: Vec<LedgerEntry> = state.into_values().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        write_atomically(dir, SNAPSHOT_FILE, &entries).await?;

        for (_, path) in &segments {
            fs::remove_file(path).await?;
        }
        info!(
            ledger,
            segments = segments.len(),
            entries = entries.len(),
            "Compacted ledger journal"
        );
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for JournalLedgerStore {
    async fn load(&self, ledger: &str) -> Result<Vec<LedgerEntry>> {
        let dir = self.ledger_dir(ledger)?;
        let _guard = self.io_lock.lock().await;

        let mut state = HashMap::new();
        read_entries(&dir.join(SNAPSHOT_FILE), &mut state).await?;
        for (_, path) in list_segments(&dir).await? {
            read_entries(&path, &mut state).await?;
        }
        Ok(state.into_values().collect())
    }

    async fn merge(&self, ledger: &str, entries: Vec<LedgerEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let dir = self.ledger_dir(ledger)?;
        let _guard = self.io_lock.lock().await;
        fs::create_dir_all(&dir).await?;

        let mut next_seq = list_segments(&dir)
            .await?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0);

        for chunk in entries.chunks(self.segment_max_entries) {
            let seq = write_segment(&dir, next_seq, chunk).await?;
            debug!(ledger, seq, entries = chunk.len(), "Wrote ledger segment");
            next_seq = seq + 1;
        }

        if list_segments(&dir).await?.len() >= self.compact_after_segments {
            self.compact_locked(ledger).await?;
        }
        Ok(())
    }
}

fn segment_name(seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{seq:08}{SEGMENT_SUFFIX}")
}

fn segment_seq(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segments of a ledger directory, ordered by sequence number.
async fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut segments = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if let Some(seq) = segment_seq(&path) {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Merge every entry of a JSON-lines file into `state`. A missing file is empty.
async fn read_entries(path: &Path, state: &mut HashMap<String, LedgerEntry>) -> Result<()> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                merge_into(state, entry);
            }
            Err(e) => warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping malformed ledger line"
            ),
        }
    }
    Ok(())
}

/// Write `entries` to a temporary file private to this writer.
async fn write_temp(dir: &Path, entries: &[LedgerEntry]) -> Result<PathBuf> {
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&serde_json::to_string(entry)?);
        buf.push('\n');
    }

    let tmp = dir.join(format!(
        ".{}-{:016x}.tmp",
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(buf.as_bytes()).await?;
    file.sync_all().await?;
    Ok(tmp)
}

async fn write_atomically(dir: &Path, name: &str, entries: &[LedgerEntry]) -> Result<()> {
    let tmp = write_temp(dir, entries).await?;
    fs::rename(&tmp, dir.join(name)).await?;
    Ok(())
}

/// Write `entries` as a new segment under the first free sequence number at
/// or after `seq`, never replacing an existing segment. Returns the number used.
async fn write_segment(dir: &Path, mut seq: u64, entries: &[LedgerEntry]) -> Result<u64> {
    let tmp = write_temp(dir, entries).await?;
    loop {
        match fs::hard_link(&tmp, dir.join(segment_name(seq))).await {
            Ok(()) => break,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => seq += 1,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        }
    }
    fs::remove_file(&tmp).await?;
    Ok(seq)
}

/// Take the directory's compaction lock. `false` if another writer holds it.
async fn claim_compaction(dir: &Path) -> Result<bool> {
    let path = dir.join(COMPACT_LOCK);
    for _ in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let stale = fs::metadata(&path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.elapsed().ok())
                    .is_some_and(|age| age > STALE_COMPACT_LOCK);
                if !stale {
                    return Ok(false);
                }
                warn!(path = %path.display(), "Removing stale compaction lock");
                let _ = fs::remove_file(&path).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStatus;

    fn entry(key: &str, status: LedgerStatus, at: i64) -> LedgerEntry {
        LedgerEntry {
            key: key.to_string(),
            status,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_segments_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 2, 100);

        let batch: Vec<_> = (0..5)
            .map(|i| entry(&format!("k{i}"), LedgerStatus::Success, i))
            .collect();
        store.merge("run", batch).await.unwrap();
        assert_eq!(store.segment_count("run").await.unwrap(), 3);

        for (_, path) in list_segments(&dir.path().join("run")).await.unwrap() {
            let lines = std::fs::read_to_string(path).unwrap().lines().count();
            assert!(lines <= 2);
        }
        assert_eq!(store.load("run").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_merge_rule_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 10, 100);

        store
            .merge("run", vec![entry("a", LedgerStatus::Success, 1), entry("b", LedgerStatus::Failed, 1)])
            .await
            .unwrap();
        store
            .merge("run", vec![entry("a", LedgerStatus::Failed, 5), entry("b", LedgerStatus::Success, 2)])
            .await
            .unwrap();

        let mut loaded = store.load("run").await.unwrap();
        loaded.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(loaded[0].status, LedgerStatus::Success);
        assert_eq!(loaded[1].status, LedgerStatus::Success);
    }

    #[tokio::test]
    async fn test_compaction_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 1, 3);

        store
            .merge("run", vec![entry("a", LedgerStatus::Failed, 1), entry("b", LedgerStatus::Success, 1)])
            .await
            .unwrap();
        // Third segment triggers compaction.
        store
            .merge("run", vec![entry("a", LedgerStatus::Success, 2)])
            .await
            .unwrap();

        assert_eq!(store.segment_count("run").await.unwrap(), 0);
        assert!(dir.path().join("run").join(SNAPSHOT_FILE).exists());

        let mut loaded = store.load("run").await.unwrap();
        loaded.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|e| e.status == LedgerStatus::Success));

        // Appends after compaction still merge against the snapshot.
        store
            .merge("run", vec![entry("b", LedgerStatus::Failed, 9)])
            .await
            .unwrap();
        let b = store
            .load("run")
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.key == "b")
            .unwrap();
        assert_eq!(b.status, LedgerStatus::Success);
    }

    #[tokio::test]
    async fn test_malformed_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 10, 100);
        store
            .merge("run", vec![entry("a", LedgerStatus::Success, 1)])
            .await
            .unwrap();

        let seg = dir.path().join("run").join("segment-00000001.jsonl");
        std::fs::write(&seg, "{\"key\":\"b\",\"status\":\"succ").unwrap();
        assert_eq!(store.load("run").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_segment_number_from_two_writers_keeps_both() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run");
        std::fs::create_dir_all(&run).unwrap();

        // Both writers listed the directory before either wrote.
        let first = write_segment(&run, 0, &[entry("a", LedgerStatus::Success, 1)])
            .await
            .unwrap();
        let second = write_segment(&run, 0, &[entry("b", LedgerStatus::Success, 1)])
            .await
            .unwrap();
        assert_eq!((first, second), (0, 1));

        let store = JournalLedgerStore::new(dir.path(), 10, 100);
        assert_eq!(store.load("run").await.unwrap().len(), 2);
        // No temporary files are left behind.
        assert_eq!(std::fs::read_dir(&run).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_two_stores_on_one_directory_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = JournalLedgerStore::new(dir.path(), 1, 100);
        let b = JournalLedgerStore::new(dir.path(), 1, 100);

        let batch = |prefix: &str| -> Vec<LedgerEntry> {
            (0..5)
                .map(|i| entry(&format!("{prefix}{i}"), LedgerStatus::Success, i))
                .collect()
        };
        let (ra, rb) = tokio::join!(a.merge("run", batch("a")), b.merge("run", batch("b")));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(a.segment_count("run").await.unwrap(), 10);
        assert_eq!(b.load("run").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_compaction_waits_for_lock_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 1, 2);
        let run = dir.path().join("run");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join(COMPACT_LOCK), "").unwrap();

        store
            .merge("run", vec![entry("a", LedgerStatus::Success, 1), entry("b", LedgerStatus::Success, 1)])
            .await
            .unwrap();
        // Held by someone else: segments stay.
        assert_eq!(store.segment_count("run").await.unwrap(), 2);

        std::fs::remove_file(run.join(COMPACT_LOCK)).unwrap();
        store.compact("run").await.unwrap();
        assert_eq!(store.segment_count("run").await.unwrap(), 0);
        assert!(!run.join(COMPACT_LOCK).exists());
        assert_eq!(store.load("run").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalLedgerStore::new(dir.path(), 10, 100);
        assert!(store.load("../escape").await.is_err());
    }
}
