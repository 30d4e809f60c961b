//! # Dedup Index
//!
//! Content-addressed deduplication for the on-disk tier. Payloads are
//! identified by their SHA-256; identical content is stored once and
//! reference-counted. Keys never hold a pointer to a block, only the hash
//! handle, so releasing a key is a table lookup followed by a decrement.

use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

/// A single physical copy of a payload shared by one or more keys.
#[derive(Debug, Clone)]
pub struct DedupBlock {
    /// Number of distinct keys mapping to this block
    pub refcount: u64,

    /// Plaintext, uncompressed payload size
    pub logical_size: u64,

    /// Physical record written for the first key
    pub shard_path: PathBuf,
}

/// Deduplication statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    /// Number of distinct content blocks
    pub unique_blocks: usize,

    /// Total key references across all blocks
    pub total_references: u64,

    /// Logical bytes saved: sum of size x (refcount - 1)
    pub space_saved: u64,
}

struct DedupInner {
    blocks: HashMap<String, DedupBlock>,
    key_to_hash: HashMap<String, String>,
}

/// Content-hash index with reference counting.
pub struct DedupIndex {
    inner: RwLock<DedupInner>,
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DedupInner {
                blocks: HashMap::new(),
                key_to_hash: HashMap::new(),
            }),
        }
    }

    /// Lowercase hex SHA-256 of a payload.
    pub fn content_hash(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Try to share an existing block for `key`.
    ///
    /// When a block for `hash` exists its refcount is bumped, the key is
    /// recorded against the hash, and the block's physical path is
    /// returned. Otherwise only the key-to-hash mapping is recorded and
    /// the caller must write the physical record and [`register`]
    /// the new block.
    ///
    /// [`register`]: DedupIndex::register
    pub fn intern(&self, key: &str, hash: &str, logical_size: u64) -> Option<PathBuf> {
        let mut inner = self.inner.write();
        inner.key_to_hash.insert(key.to_string(), hash.to_string());
        match inner.blocks.get_mut(hash) {
            Some(block) => {
                block.refcount += 1;
                debug_assert_eq!(block.logical_size, logical_size);
                Some(block.shard_path.clone())
            }
            None => None,
        }
    }

    /// Register a freshly written block with refcount 1.
    pub fn register(&self, hash: &str, shard_path: PathBuf, logical_size: u64) {
        self.inner.write().blocks.insert(
            hash.to_string(),
            DedupBlock {
                refcount: 1,
                logical_size,
                shard_path,
            },
        );
    }

    /// Release `key`'s reference to its block.
    ///
    /// Returns the block path and whether this was the last reference; on
    /// the last release the block is removed from the index and the caller
    /// must unlink the physical file. Returns `None` when the key was
    /// never interned.
    pub fn release(&self, key: &str) -> Option<(PathBuf, bool)> {
        let mut inner = self.inner.write();
        let hash = inner.key_to_hash.remove(key)?;
        let block = inner.blocks.get_mut(&hash)?;
        block.refcount -= 1;
        let path = block.shard_path.clone();
        if block.refcount == 0 {
            inner.blocks.remove(&hash);
            Some((path, true))
        } else {
            Some((path, false))
        }
    }

    /// Whether a key currently holds a block reference.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().key_to_hash.contains_key(key)
    }

    /// Look up a block by content hash.
    pub fn block(&self, hash: &str) -> Option<DedupBlock> {
        self.inner.read().blocks.get(hash).cloned()
    }

    /// Snapshot of deduplication statistics.
    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.read();
        let mut stats = DedupStats {
            unique_blocks: inner.blocks.len(),
            ..Default::default()
        };
        for block in inner.blocks.values() {
            stats.total_references += block.refcount;
            stats.space_saved += block.logical_size * block.refcount.saturating_sub(1);
        }
        stats
    }

    /// Drop every block and key mapping.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.blocks.clear();
        inner.key_to_hash.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let h1 = DedupIndex::content_hash(b"same bytes");
        let h2 = DedupIndex::content_hash(b"same bytes");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, DedupIndex::content_hash(b"other bytes"));
    }

    #[test]
    fn test_first_intern_misses() {
        let index = DedupIndex::new();
        let hash = DedupIndex::content_hash(b"payload");
        assert_eq!(index.intern("k1", &hash, 7), None);
        index.register(&hash, PathBuf::from("/tmp/shard-0/k1.cache"), 7);
        assert_eq!(index.stats().unique_blocks, 1);
    }

    #[test]
    fn test_shared_block_refcounting() {
        let index = DedupIndex::new();
        let hash = DedupIndex::content_hash(b"payload");
        let path = PathBuf::from("/tmp/shard-0/k1.cache");

        assert!(index.intern("k1", &hash, 7).is_none());
        index.register(&hash, path.clone(), 7);
        assert_eq!(index.intern("k2", &hash, 7), Some(path.clone()));
        assert_eq!(index.intern("k3", &hash, 7), Some(path.clone()));

        let stats = index.stats();
        assert_eq!(stats.unique_blocks, 1);
        assert_eq!(stats.total_references, 3);
        assert_eq!(stats.space_saved, 14);

        // Releasing two of three references keeps the block alive.
        assert_eq!(index.release("k1"), Some((path.clone(), false)));
        assert_eq!(index.release("k2"), Some((path.clone(), false)));
        assert_eq!(index.block(&hash).unwrap().refcount, 1);

        // The last release removes the block and asks for the unlink.
        assert_eq!(index.release("k3"), Some((path, true)));
        assert_eq!(index.stats().unique_blocks, 0);
    }

    #[test]
    fn test_release_unknown_key() {
        let index = DedupIndex::new();
        assert_eq!(index.release("ghost"), None);
    }

    #[test]
    fn test_clear() {
        let index = DedupIndex::new();
        let hash = DedupIndex::content_hash(b"x");
        index.intern("k", &hash, 1);
        index.register(&hash, PathBuf::from("/tmp/x.cache"), 1);
        index.clear().unwrap();
        assert_eq!(index.stats().unique_blocks, 0);
        assert!(!index.contains_key("k"));
    }
}
