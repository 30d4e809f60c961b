//! # SSD Store
//!
//! The slow tier: payload records spread over N shard directories, plus
//! the in-memory index that maps logical keys to their physical records.
//! The index is rebuilt from disk by the recovery engine after a crash;
//! nothing here is persisted besides the record files themselves.
//!
//! Accounting is in logical (plaintext, uncompressed) bytes. Physical
//! bytes on disk may be smaller after compression, or shared between keys
//! under deduplication; the `unlink` flag on [`SsdStore::remove`] lets the
//! tier controller keep shared records alive until the last reference is
//! gone.

use crate::shard::{ShardLayout, CACHE_FILE_EXT};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// On-disk index entry for one key.
#[derive(Debug, Clone)]
pub struct SsdEntry {
    /// Plaintext, uncompressed payload size; authoritative for accounting
    pub logical_size: u64,

    /// Physical record path (possibly shared under deduplication)
    pub shard_path: PathBuf,

    /// Last time the entry was read
    pub last_access: SystemTime,
}

struct SsdInner {
    index: HashMap<String, SsdEntry>,
    current_bytes: u64,
}

/// Sharded on-disk record store.
pub struct SsdStore {
    layout: Arc<ShardLayout>,
    inner: RwLock<SsdInner>,
}

impl SsdStore {
    /// Create a store over an existing shard layout.
    pub fn new(layout: Arc<ShardLayout>) -> Self {
        Self {
            layout,
            inner: RwLock::new(SsdInner {
                index: HashMap::new(),
                current_bytes: 0,
            }),
        }
    }

    /// Shard layout backing this store.
    pub fn layout(&self) -> &Arc<ShardLayout> {
        &self.layout
    }

    /// Write an encoded record for `key` and index it.
    ///
    /// Replacing an existing entry adjusts the byte total by the
    /// difference in logical sizes.
    pub fn write(&self, key: &str, encoded: &[u8], logical_size: u64) -> Result<PathBuf> {
        let shard = self.layout.shard_for(key);
        let path = self.layout.path_for(key);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, encoded)?;
        self.layout.record_write(shard);

        self.index_entry(key, path.clone(), logical_size);
        Ok(path)
    }

    /// Index `key` against an existing physical record (dedup share).
    pub fn write_at(&self, key: &str, shard_path: PathBuf, logical_size: u64) {
        self.index_entry(key, shard_path, logical_size);
    }

    fn index_entry(&self, key: &str, shard_path: PathBuf, logical_size: u64) {
        let mut inner = self.inner.write();
        let entry = SsdEntry {
            logical_size,
            shard_path,
            last_access: SystemTime::now(),
        };
        if let Some(old) = inner.index.insert(key.to_string(), entry) {
            inner.current_bytes -= old.logical_size;
        }
        inner.current_bytes += logical_size;
    }

    /// Read the encoded record for `key` without decoding it.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = match self.inner.read().index.get(key) {
            Some(entry) => entry.shard_path.clone(),
            None => return Ok(None),
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop `key` from the index, unlinking the record when `unlink`.
    ///
    /// The tier controller passes `unlink = false` while other keys still
    /// reference the same deduplicated record.
    pub fn remove(&self, key: &str, unlink: bool) -> Result<Option<SsdEntry>> {
        let entry = {
            let mut inner = self.inner.write();
            match inner.index.remove(key) {
                Some(entry) => {
                    inner.current_bytes -= entry.logical_size;
                    entry
                }
                None => return Ok(None),
            }
        };

        if unlink {
            match fs::remove_file(&entry.shard_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(entry))
    }

    /// Refresh `last_access` for `key`.
    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.inner.write().index.get_mut(key) {
            entry.last_access = SystemTime::now();
        }
    }

    /// Whether the index holds `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().index.contains_key(key)
    }

    /// Cloned index entry for `key`.
    pub fn entry(&self, key: &str) -> Option<SsdEntry> {
        self.inner.read().index.get(key).cloned()
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of indexed logical sizes.
    pub fn current_bytes(&self) -> u64 {
        self.inner.read().current_bytes
    }

    /// Every indexed key.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().index.keys().cloned().collect()
    }

    /// Every `*.cache` file under every shard directory, indexed or not.
    ///
    /// Used by the recovery engine for index rebuild and orphan sweeps.
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in self.layout.shard_dirs() {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(CACHE_FILE_EXT)
                {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// Set of physical paths the index currently references.
    pub fn indexed_paths(&self) -> HashSet<PathBuf> {
        self.inner
            .read()
            .index
            .values()
            .map(|e| e.shard_path.clone())
            .collect()
    }

    /// Insert an index entry without touching the filesystem.
    ///
    /// Recovery uses this to rebuild the index from scanned files.
    pub fn insert_raw(&self, key: &str, entry: SsdEntry) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.index.insert(key.to_string(), entry) {
            inner.current_bytes -= old.logical_size;
        }
        let size = inner.index[key].logical_size;
        inner.current_bytes += size;
    }
}
