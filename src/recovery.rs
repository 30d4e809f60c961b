//! # Recovery Engine
//!
//! Everything that puts a cache back together after a crash: replay of
//! the pending-operation journal, index rebuild from the shard
//! directories, quarantine of unindexed files, and an integrity scan that
//! runs every indexed record back through the read pipeline. Journal
//! entries are written before an operation becomes durable and cleared
//! once it is, so whatever is left in the file at startup is exactly the
//! work that was interrupted.

use crate::cache::TieredCache;
use crate::ssd::SsdEntry;
use crate::{CacheError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Journal file name under the cache root.
const JOURNAL_FILE: &str = "recovery.journal";

/// Staging directory for pending put payloads.
const STAGING_DIR: &str = "journal";

/// Quarantine directory for orphaned files.
const ORPHAN_DIR: &str = "orphaned";

/// Operation recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalOp {
    /// A pending put; `data_path` holds the staged payload
    Put,

    /// A pending delete
    Delete,
}

/// One pending operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic id within the journal
    pub id: u64,

    /// Operation type
    pub op: JournalOp,

    /// Cache key
    pub key: String,

    /// Staged payload for puts
    pub data_path: Option<PathBuf>,

    /// When the operation began
    pub timestamp: DateTime<Utc>,
}

struct JournalInner {
    pending: Vec<JournalEntry>,
    next_id: u64,
}

/// Write-ahead journal of pending operations.
///
/// Serialized as one JSON object per line at `<root>/recovery.journal`;
/// the file exists only while operations are in flight.
pub struct RecoveryJournal {
    journal_path: PathBuf,
    staging_dir: PathBuf,
    inner: Mutex<JournalInner>,
}

impl RecoveryJournal {
    /// Create a journal rooted at the cache directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            journal_path: root.join(JOURNAL_FILE),
            staging_dir: root.join(STAGING_DIR),
            inner: Mutex::new(JournalInner {
                pending: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.journal_path
    }

    /// Whether the journal file currently exists.
    pub fn exists(&self) -> bool {
        self.journal_path.exists()
    }

    /// Record a pending put, staging its payload on disk first.
    pub fn begin_put(&self, key: &str, payload: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        fs::create_dir_all(&self.staging_dir)?;
        let staged = self.staging_dir.join(format!("{}.staged", id));
        fs::write(&staged, payload)?;

        inner.pending.push(JournalEntry {
            id,
            op: JournalOp::Put,
            key: key.to_string(),
            data_path: Some(staged),
            timestamp: Utc::now(),
        });
        self.persist(&inner.pending)?;
        Ok(id)
    }

    /// Record a pending delete.
    pub fn begin_delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.pending.push(JournalEntry {
            id,
            op: JournalOp::Delete,
            key: key.to_string(),
            data_path: None,
            timestamp: Utc::now(),
        });
        self.persist(&inner.pending)?;
        Ok(id)
    }

    /// Mark an operation durable: drop its entry and staged payload.
    pub fn complete(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.pending.iter().position(|e| e.id == id) {
            let entry = inner.pending.remove(pos);
            if let Some(staged) = entry.data_path {
                let _ = fs::remove_file(staged);
            }
        }
        self.persist(&inner.pending)
    }

    /// Parse the journal file. Corrupt lines are skipped with a warning
    /// so one torn write cannot block the rest of the replay.
    pub fn load(&self) -> Result<Vec<JournalEntry>> {
        if !self.journal_path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.journal_path)?;
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("skipping corrupt journal line: {}", e),
            }
        }
        Ok(entries)
    }

    /// Unlink the journal file and forget in-memory pending state.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        match fs::remove_file(&self.journal_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, pending: &[JournalEntry]) -> Result<()> {
        if pending.is_empty() {
            return match fs::remove_file(&self.journal_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let mut buf = String::new();
        for entry in pending {
            buf.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| CacheError::Serialization(e.to_string()))?,
            );
            buf.push('\n');
        }
        fs::write(&self.journal_path, buf)?;
        Ok(())
    }
}

/// Outcome of a journal replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Operations replayed successfully
    pub recovered: usize,

    /// Operations that could not be replayed
    pub failed: usize,
}

/// Outcome of an integrity or orphan scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Index entries examined
    pub scanned: usize,

    /// Keys whose records fail to read back or decode to the wrong size
    pub corrupted_keys: Vec<String>,

    /// Keys whose records are gone from disk
    pub missing_keys: Vec<String>,

    /// Files moved into quarantine
    pub orphaned_files: usize,

    /// Bytes reclaimed from quarantined files
    pub bytes_reclaimed: u64,
}

impl IntegrityReport {
    /// Whether the scan found nothing wrong.
    pub fn is_clean(&self) -> bool {
        self.corrupted_keys.is_empty() && self.missing_keys.is_empty()
    }
}

/// Crash-recovery operations over a [`TieredCache`].
pub struct RecoveryEngine {
    last_report: RwLock<Option<RecoveryReport>>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine {
    /// Create an engine.
    pub fn new() -> Self {
        Self {
            last_report: RwLock::new(None),
        }
    }

    /// Report from the most recent journal replay, if one ran.
    pub fn last_report(&self) -> Option<RecoveryReport> {
        self.last_report.read().clone()
    }

    /// Replay the pending-operation journal.
    ///
    /// Absence of the journal is not an error. Entries are replayed in
    /// order through the normal put/delete paths; the journal file is
    /// unlinked before replay so re-journaled operations do not
    /// accumulate.
    pub fn process_journal(&self, cache: &TieredCache) -> Result<RecoveryReport> {
        let entries = cache.journal().load()?;
        if entries.is_empty() {
            return Ok(RecoveryReport::default());
        }

        log::info!("replaying {} journaled operations", entries.len());
        cache.journal().reset()?;

        let mut report = RecoveryReport::default();
        for entry in entries {
            let outcome = match entry.op {
                JournalOp::Put => match &entry.data_path {
                    Some(staged) => fs::read(staged)
                        .map_err(CacheError::from)
                        .and_then(|payload| cache.put(&entry.key, &payload)),
                    None => Err(CacheError::Recovery(format!(
                        "journaled put for {} has no staged payload",
                        entry.key
                    ))),
                },
                JournalOp::Delete => cache.delete(&entry.key),
            };

            match outcome {
                Ok(()) => {
                    report.recovered += 1;
                    if let Some(staged) = entry.data_path {
                        let _ = fs::remove_file(staged);
                    }
                }
                Err(e) => {
                    log::warn!("journal replay of {} failed: {}", entry.key, e);
                    report.failed += 1;
                }
            }
        }

        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Rebuild the on-disk index from the shard directories.
    ///
    /// Every `*.cache` file whose key is not indexed gets a fresh entry
    /// from its file size and mtime. Sizes recovered this way are
    /// physical bytes; the logical size is recomputed the next time the
    /// record is rewritten.
    pub fn recover_index(&self, cache: &TieredCache) -> Result<usize> {
        let mut added = 0;
        for path in cache.ssd().scan()? {
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if cache.ssd().contains(key) {
                continue;
            }
            let meta = fs::metadata(&path)?;
            let mtime = meta.modified().unwrap_or_else(|_| SystemTime::now());
            cache.ssd().insert_raw(
                key,
                SsdEntry {
                    logical_size: meta.len(),
                    shard_path: path.clone(),
                    last_access: mtime,
                },
            );
            added += 1;
        }
        log::info!("index recovery added {} entries", added);
        Ok(added)
    }

    /// Move files the index does not reference into `<root>/orphaned/`.
    pub fn clean_orphaned_files(&self, cache: &TieredCache) -> Result<IntegrityReport> {
        let indexed = cache.ssd().indexed_paths();
        let orphan_dir = cache.config().root_dir.join(ORPHAN_DIR);
        fs::create_dir_all(&orphan_dir)?;

        let mut report = IntegrityReport::default();
        for path in cache.ssd().scan()? {
            if indexed.contains(&path) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut dest = orphan_dir.join(name);
            let mut n = 1;
            while dest.exists() {
                dest = orphan_dir.join(format!("{}.{}", name, n));
                n += 1;
            }
            fs::rename(&path, &dest)?;
            report.orphaned_files += 1;
            report.bytes_reclaimed += size;
        }

        if report.orphaned_files > 0 {
            log::info!(
                "quarantined {} orphaned files ({} bytes)",
                report.orphaned_files,
                report.bytes_reclaimed
            );
        }
        Ok(report)
    }

    /// Verify that every indexed record exists, reads, decrypts, and
    /// decodes back to its recorded logical size.
    pub fn check_integrity(&self, cache: &TieredCache) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for key in cache.ssd().keys() {
            report.scanned += 1;
            let Some(entry) = cache.ssd().entry(&key) else {
                continue;
            };
            if !entry.shard_path.exists() {
                report.missing_keys.push(key);
                continue;
            }
            match cache.load_from_disk(&key) {
                Ok(Some(payload)) if payload.len() as u64 == entry.logical_size => {}
                Ok(Some(_)) => {
                    report.corrupted_keys.push(key);
                }
                Ok(None) => report.missing_keys.push(key),
                Err(_) => report.corrupted_keys.push(key),
            }
        }

        if !report.is_clean() {
            log::warn!(
                "integrity scan: {} corrupted, {} missing of {} entries",
                report.corrupted_keys.len(),
                report.missing_keys.len(),
                report.scanned
            );
        }
        Ok(report)
    }

    /// Drop the corrupted entries listed in `report` from both tiers and
    /// unlink their records.
    pub fn repair_corruption(&self, cache: &TieredCache, report: &IntegrityReport) -> Result<usize> {
        let mut fixed = 0;
        for key in &report.corrupted_keys {
            cache.remove_entry_everywhere(key)?;
            fixed += 1;
        }
        if fixed > 0 {
            log::info!("repaired {} corrupted entries", fixed);
        }
        Ok(fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use tempfile::tempdir;

    #[test]
    fn test_journal_lifecycle() {
        let dir = tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path());

        let id = journal.begin_put("k", b"payload").unwrap();
        assert!(journal.exists());

        let entries = journal.load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, JournalOp::Put);
        assert_eq!(entries[0].key, "k");
        let staged = entries[0].data_path.clone().unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"payload");

        journal.complete(id).unwrap();
        assert!(!journal.exists());
        assert!(!staged.exists());
    }

    #[test]
    fn test_journal_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let journal = RecoveryJournal::new(dir.path());
        journal.begin_delete("a").unwrap();

        let mut text = fs::read_to_string(journal.path()).unwrap();
        text.push_str("{not json\n");
        fs::write(journal.path(), text).unwrap();

        assert_eq!(journal.load().unwrap().len(), 1);
    }

    #[test]
    fn test_startup_replays_pending_operations() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");

        // Simulate a crash: journal entries exist but were never applied.
        fs::create_dir_all(&root).unwrap();
        let journal = RecoveryJournal::new(&root);
        journal.begin_put("interrupted", b"late write").unwrap();
        journal.begin_delete("gone").unwrap();

        let cache = TieredCache::new(1024, 10 * 1024 * 1024, &root).unwrap();
        let report = cache.last_recovery_report().unwrap();
        assert_eq!(report.recovered, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(cache.get("interrupted"), Some(b"late write".to_vec()));
        assert!(!cache.journal().exists());
    }

    #[test]
    fn test_recover_index_rebuilds_from_disk() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        {
            let cache = TieredCache::new(100, 10 * 1024 * 1024, &root).unwrap();
            cache.put("a", &vec![1u8; 80]).unwrap();
            cache.put("b", &vec![2u8; 80]).unwrap();
            cache.put("c", &vec![3u8; 80]).unwrap();
            assert!(cache.ssd().len() >= 2);
        }

        // A fresh cache starts with an empty index; the files survive.
        let cache = TieredCache::new(100, 10 * 1024 * 1024, &root).unwrap();
        assert_eq!(cache.ssd().len(), 0);

        let added = cache.recover_index().unwrap();
        assert!(added >= 2);
        assert_eq!(cache.get("a"), Some(vec![1u8; 80]));
    }

    #[test]
    fn test_clean_orphaned_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = TieredCache::new(100, 10 * 1024 * 1024, &root).unwrap();
        cache.put("live", &vec![1u8; 80]).unwrap();
        cache.put("live2", &vec![2u8; 80]).unwrap();

        // Drop a stray record nobody indexes.
        let stray = root.join("shard-0").join("stray.cache");
        fs::write(&stray, b"leftover bytes").unwrap();

        let report = cache.clean_orphaned_files().unwrap();
        assert_eq!(report.orphaned_files, 1);
        assert_eq!(report.bytes_reclaimed, 14);
        assert!(!stray.exists());
        assert!(root.join("orphaned").join("stray.cache").exists());
    }

    #[test]
    fn test_integrity_scan_and_repair() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = TieredCache::new(8, 10 * 1024 * 1024, &root).unwrap();
        cache.put("good", b"G").unwrap();
        cache.put("bad", b"B").unwrap();
        cache.put("filler", &vec![0u8; 16]).unwrap();

        assert!(cache.ssd().contains("good"));
        assert!(cache.ssd().contains("bad"));

        let bad_path = cache.ssd().entry("bad").unwrap().shard_path;
        fs::write(&bad_path, [0x13, 0x37, 0x42]).unwrap();

        let report = cache.check_integrity().unwrap();
        assert!(report.corrupted_keys.contains(&"bad".to_string()));
        assert!(!report.corrupted_keys.contains(&"good".to_string()));

        let fixed = cache.repair_corruption(&report).unwrap();
        assert_eq!(fixed, 1);
        assert_eq!(cache.get("good"), Some(b"G".to_vec()));
        assert_eq!(cache.get("bad"), None);
        assert!(!bad_path.exists());
    }

    #[test]
    fn test_integrity_detects_missing_file() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = TieredCache::new(8, 10 * 1024 * 1024, &root).unwrap();
        cache.put("vanishing", &vec![1u8; 32]).unwrap();
        cache.put("filler", &vec![2u8; 32]).unwrap();

        let path = cache.ssd().entry("vanishing").unwrap().shard_path;
        fs::remove_file(&path).unwrap();

        let report = cache.check_integrity().unwrap();
        assert!(report.missing_keys.contains(&"vanishing".to_string()));
    }
}
