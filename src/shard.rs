//! # Shard Layout
//!
//! Maps cache keys onto N sibling on-disk shard directories so that writes
//! spread evenly across the store. The mapping is a pure function of the
//! key, so the same key always lands in the same shard. Per-shard write
//! counters are kept for wear-leveling observation.

use crate::Result;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};

/// File extension for payload records inside a shard directory.
pub const CACHE_FILE_EXT: &str = "cache";

/// Maps keys to shard directories under a fixed root.
pub struct ShardLayout {
    /// Root directory containing the shard subdirectories
    root: PathBuf,

    /// Number of shards, fixed at creation
    shard_count: usize,

    /// Per-shard write counters
    write_counts: RwLock<Vec<u64>>,
}

impl ShardLayout {
    /// Default number of shard directories
    pub const DEFAULT_SHARD_COUNT: usize = 8;

    /// Create a new layout over `root` with `shard_count` shards.
    pub fn new(root: impl Into<PathBuf>, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            root: root.into(),
            shard_count,
            write_counts: RwLock::new(vec![0; shard_count]),
        }
    }

    /// Create the root and every shard directory if missing.
    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for i in 0..self.shard_count {
            fs::create_dir_all(self.shard_dir(i))?;
        }
        Ok(())
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Compute the shard index for a key.
    ///
    /// Polynomial rolling hash over the key bytes with multiplier 31,
    /// reduced modulo the shard count. Wrapping arithmetic keeps the
    /// result stable across platforms; the absolute value folds negative
    /// remainders back into range.
    pub fn shard_for(&self, key: &str) -> usize {
        let mut h: i64 = 0;
        for b in key.as_bytes() {
            h = h.wrapping_mul(31).wrapping_add(i64::from(*b));
        }
        (h % self.shard_count as i64).unsigned_abs() as usize
    }

    /// Directory of shard `i`.
    pub fn shard_dir(&self, i: usize) -> PathBuf {
        self.root.join(format!("shard-{}", i))
    }

    /// Every shard directory in index order.
    pub fn shard_dirs(&self) -> Vec<PathBuf> {
        (0..self.shard_count).map(|i| self.shard_dir(i)).collect()
    }

    /// Physical path of the record for `key`.
    ///
    /// Keys are used verbatim as file names; callers are expected to
    /// restrict keys to filesystem-safe characters.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.shard_dir(self.shard_for(key))
            .join(format!("{}.{}", key, CACHE_FILE_EXT))
    }

    /// Record a write against shard `i` for wear-leveling stats.
    pub fn record_write(&self, i: usize) {
        let mut counts = self.write_counts.write();
        if let Some(c) = counts.get_mut(i) {
            *c += 1;
        }
    }

    /// Snapshot of per-shard write counters.
    pub fn write_counts(&self) -> Vec<u64> {
        self.write_counts.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_is_stable() {
        let layout = ShardLayout::new("/tmp/shards", 8);
        let a = layout.shard_for("alpha");
        assert_eq!(a, layout.shard_for("alpha"));
        assert!(a < 8);
    }

    #[test]
    fn test_shard_for_in_range() {
        let layout = ShardLayout::new("/tmp/shards", 8);
        for i in 0..1000 {
            let key = format!("key-{}", i);
            assert!(layout.shard_for(&key) < 8);
        }
    }

    #[test]
    fn test_shard_distribution() {
        let layout = ShardLayout::new("/tmp/shards", 8);
        let mut buckets = [0usize; 8];
        for i in 0..800 {
            buckets[layout.shard_for(&format!("object/{}", i))] += 1;
        }
        // Every shard should see at least some of 800 uniform keys.
        assert!(buckets.iter().all(|&b| b > 0));
    }

    #[test]
    fn test_path_for_contains_shard_and_extension() {
        let layout = ShardLayout::new("/data/cache", 4);
        let path = layout.path_for("report");
        let s = path.to_string_lossy();
        assert!(s.starts_with("/data/cache/shard-"));
        assert!(s.ends_with("report.cache"));
    }

    #[test]
    fn test_write_counters() {
        let layout = ShardLayout::new("/tmp/shards", 4);
        layout.record_write(2);
        layout.record_write(2);
        layout.record_write(0);
        let counts = layout.write_counts();
        assert_eq!(counts[2], 2);
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 0);
    }

    #[test]
    fn test_single_shard_layout() {
        let layout = ShardLayout::new("/tmp/shards", 1);
        assert_eq!(layout.shard_for("anything"), 0);
    }
}
