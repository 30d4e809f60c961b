//! # Replication
//!
//! Best-effort mirroring of demoted records into a secondary shard tree,
//! and the failover switch that redirects reads to that tree. Replication
//! is deliberately simple: every record written to the primary store is
//! copied to the secondary as-is (already compressed and encrypted), and
//! copy failures are logged rather than propagated so the primary write
//! path never stalls on the mirror.

use crate::shard::ShardLayout;
use crate::Result;
use parking_lot::RwLock;
use std::fs;
use std::path::PathBuf;

/// Configuration for the secondary mirror.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Root directory of the secondary shard tree
    pub secondary_root: PathBuf,

    /// Mirror records as they are demoted (disable for read-only drills)
    pub sync_on_write: bool,
}

impl ReplicationConfig {
    /// Configuration mirroring into `secondary_root` on every write.
    pub fn new(secondary_root: impl Into<PathBuf>) -> Self {
        Self {
            secondary_root: secondary_root.into(),
            sync_on_write: true,
        }
    }
}

/// Mirror writer and failover switch.
pub struct Replicator {
    config: ReplicationConfig,
    secondary: ShardLayout,
    using_secondary: RwLock<bool>,
}

impl Replicator {
    /// Build a replicator whose secondary tree mirrors the primary shard
    /// count.
    pub fn new(config: ReplicationConfig, shard_count: usize) -> Result<Self> {
        let secondary = ShardLayout::new(&config.secondary_root, shard_count);
        secondary.create_dirs()?;
        log::info!(
            "replication enabled, secondary at {:?}",
            config.secondary_root
        );
        Ok(Self {
            config,
            secondary,
            using_secondary: RwLock::new(false),
        })
    }

    /// Mirror an encoded record for `key`. Best-effort: failures are
    /// logged and swallowed.
    pub fn replicate_write(&self, key: &str, encoded: &[u8]) {
        if !self.config.sync_on_write {
            return;
        }
        let path = self.secondary.path_for(key);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&path, encoded) {
            log::warn!("failed to mirror {} to secondary: {}", key, e);
        }
    }

    /// Remove `key`'s mirrored record. Best-effort.
    pub fn replicate_remove(&self, key: &str) {
        let path = self.secondary.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove mirror of {}: {}", key, e);
            }
        }
    }

    /// Read `key`'s encoded record from the secondary tree.
    pub fn read_secondary(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.secondary.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Redirect subsequent reads to the secondary tree.
    pub fn simulate_failure(&self) {
        *self.using_secondary.write() = true;
        log::warn!("primary store marked failed, reads redirected to secondary");
    }

    /// Route reads back to the primary tree.
    pub fn restore_primary(&self) {
        *self.using_secondary.write() = false;
        log::info!("primary store restored");
    }

    /// Whether reads are currently served from the secondary.
    pub fn using_secondary(&self) -> bool {
        *self.using_secondary.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mirror_round_trip() {
        let dir = tempdir().unwrap();
        let replicator =
            Replicator::new(ReplicationConfig::new(dir.path().join("secondary")), 4).unwrap();

        replicator.replicate_write("doc", b"encoded");
        assert_eq!(
            replicator.read_secondary("doc").unwrap(),
            Some(b"encoded".to_vec())
        );

        replicator.replicate_remove("doc");
        assert_eq!(replicator.read_secondary("doc").unwrap(), None);
    }

    #[test]
    fn test_failover_flag() {
        let dir = tempdir().unwrap();
        let replicator =
            Replicator::new(ReplicationConfig::new(dir.path().join("secondary")), 4).unwrap();

        assert!(!replicator.using_secondary());
        replicator.simulate_failure();
        assert!(replicator.using_secondary());
        replicator.restore_primary();
        assert!(!replicator.using_secondary());
    }

    #[test]
    fn test_sync_disabled_skips_mirror() {
        let dir = tempdir().unwrap();
        let mut config = ReplicationConfig::new(dir.path().join("secondary"));
        config.sync_on_write = false;
        let replicator = Replicator::new(config, 4).unwrap();

        replicator.replicate_write("doc", b"encoded");
        assert_eq!(replicator.read_secondary("doc").unwrap(), None);
    }
}
