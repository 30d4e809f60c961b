//! # Tier Controller
//!
//! The public face of the cache. Orchestrates the memory tier and the
//! on-disk store: writes land in memory and spill to disk under pressure,
//! reads reverse the on-disk pipeline and promote hot keys back into
//! memory, deletes release deduplicated blocks. Backup and recovery
//! operations are delegated to their engines but exposed here so callers
//! deal with a single handle.

use crate::access::{AccessRecorder, PromotionPolicy};
use crate::backup::{BackupEngine, BackupInfo};
use crate::compression::{CompressionPipeline, CompressionStats};
use crate::dedup::{DedupIndex, DedupStats};
use crate::encryption::EncryptionPipeline;
use crate::memory::MemoryTier;
use crate::monitor::{Operation, PerfMonitor, PerfReport};
use crate::recovery::{IntegrityReport, RecoveryEngine, RecoveryJournal, RecoveryReport};
use crate::replication::{ReplicationConfig, Replicator};
use crate::shard::ShardLayout;
use crate::ssd::SsdStore;
use crate::{CacheError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget of the memory tier
    pub mem_max_bytes: u64,

    /// Byte capacity reported for the on-disk tier (logical bytes)
    pub ssd_max_bytes: u64,

    /// Root directory of the on-disk tier
    pub root_dir: PathBuf,

    /// Number of shard directories, fixed at creation
    pub shard_count: usize,

    /// Write pending operations to the recovery journal
    pub journaling: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mem_max_bytes: 64 * 1024 * 1024,
            ssd_max_bytes: 1024 * 1024 * 1024,
            root_dir: PathBuf::from("./stratacache-data"),
            shard_count: ShardLayout::DEFAULT_SHARD_COUNT,
            journaling: true,
        }
    }
}

/// Point-in-time usage counters for both tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Bytes held in the memory tier
    pub mem_used: u64,

    /// Memory tier byte budget
    pub mem_capacity: u64,

    /// Logical bytes indexed on disk
    pub ssd_used: u64,

    /// Reported on-disk capacity
    pub ssd_capacity: u64,

    /// Items in the memory tier
    pub mem_items: usize,

    /// Items indexed on disk
    pub ssd_items: usize,
}

/// Policy for the cold-sweep maintenance pass.
#[derive(Debug, Clone)]
pub struct DemotionPolicy {
    /// Items idle for longer than this are demotion candidates
    pub max_age: Duration,

    /// Sweep target: stop once memory bytes drop to this mark
    pub low_water: u64,

    /// Sweep trigger: do nothing while memory bytes stay below this mark
    pub high_water: u64,
}

impl Default for DemotionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            low_water: 0,
            high_water: 0,
        }
    }
}

/// Tiered, content-addressed object cache.
pub struct TieredCache {
    config: CacheConfig,
    layout: Arc<ShardLayout>,
    memory: MemoryTier,
    ssd: SsdStore,
    compression: CompressionPipeline,
    encryption: EncryptionPipeline,
    dedup: DedupIndex,
    dedup_enabled: RwLock<bool>,
    access: AccessRecorder,
    monitor: PerfMonitor,
    backup: BackupEngine,
    recovery: RecoveryEngine,
    journal: RecoveryJournal,
    demotion_policy: RwLock<DemotionPolicy>,
    replicator: RwLock<Option<Arc<Replicator>>>,
}

impl TieredCache {
    /// Create a cache with byte budgets for both tiers rooted at
    /// `root_dir`.
    ///
    /// Creates the root and shard directories if missing and replays any
    /// pending recovery journal before returning.
    pub fn new(
        mem_max_bytes: u64,
        ssd_max_bytes: u64,
        root_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Self::with_config(CacheConfig {
            mem_max_bytes,
            ssd_max_bytes,
            root_dir: root_dir.into(),
            ..Default::default()
        })
    }

    /// Create a cache from a full configuration.
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        let layout = Arc::new(ShardLayout::new(&config.root_dir, config.shard_count));
        layout.create_dirs()?;
        fs::create_dir_all(config.root_dir.join("orphaned"))?;

        let mut demotion = DemotionPolicy::default();
        if demotion.low_water == 0 {
            demotion.low_water = config.mem_max_bytes / 2;
        }
        if demotion.high_water == 0 {
            demotion.high_water = config.mem_max_bytes * 3 / 4;
        }

        let cache = Self {
            memory: MemoryTier::new(config.mem_max_bytes),
            ssd: SsdStore::new(Arc::clone(&layout)),
            compression: CompressionPipeline::new(),
            encryption: EncryptionPipeline::new(),
            dedup: DedupIndex::new(),
            dedup_enabled: RwLock::new(false),
            access: AccessRecorder::new(),
            monitor: PerfMonitor::new(),
            backup: BackupEngine::new(),
            recovery: RecoveryEngine::new(),
            journal: RecoveryJournal::new(&config.root_dir),
            demotion_policy: RwLock::new(demotion),
            replicator: RwLock::new(None),
            layout,
            config,
        };

        let report = cache.recovery.process_journal(&cache)?;
        if report.recovered > 0 || report.failed > 0 {
            log::info!(
                "journal replay finished: {} recovered, {} failed",
                report.recovered,
                report.failed
            );
        }

        log::info!(
            "cache ready at {:?} ({} shards, mem budget {} bytes)",
            cache.config.root_dir,
            cache.config.shard_count,
            cache.config.mem_max_bytes
        );
        Ok(cache)
    }

    // ------------------------------------------------------------------
    // Primary operations
    // ------------------------------------------------------------------

    /// Store a payload under `key`.
    ///
    /// The payload always lands in the memory tier first. If that pushes
    /// the tier over budget, LRU tails are demoted synchronously through
    /// the write pipeline; a failed demotion aborts the put with
    /// [`CacheError::DemoteFailed`] and the evicted item is lost
    /// (demotion is best-effort by design of the eviction path).
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let start = Instant::now();
        let journal_id = if self.config.journaling {
            Some(self.journal.begin_put(key, value)?)
        } else {
            None
        };

        self.memory.insert(key, value.to_vec());

        // A key lives in exactly one tier; overwriting a demoted key
        // drops its stale on-disk record.
        if self.ssd.contains(key) {
            self.remove_disk_entry(key)?;
        }

        self.enforce_memory_budget()?;

        if let Some(id) = journal_id {
            self.journal.complete(id)?;
        }
        self.monitor.record_latency(Operation::Put, start.elapsed());
        Ok(())
    }

    /// Fetch the payload for `key`, or `None` when the key is absent or
    /// its on-disk record cannot be read back (corrupt entries surface
    /// through [`TieredCache::check_integrity`], not here).
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let start = Instant::now();
        self.access.record(key);

        if let Some(payload) = self.memory.get(key) {
            self.monitor.record_hit();
            self.monitor.record_latency(Operation::Get, start.elapsed());
            return Some(payload);
        }

        if !self.ssd.contains(key) {
            self.monitor.record_miss();
            self.monitor.record_latency(Operation::Get, start.elapsed());
            return None;
        }

        let payload = match self.load_from_disk(key) {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.monitor.record_miss();
                self.monitor.record_latency(Operation::Get, start.elapsed());
                return None;
            }
            Err(e) => {
                log::warn!("read pipeline failed for {}: {}", key, e);
                self.monitor.record_miss();
                self.monitor.record_latency(Operation::Get, start.elapsed());
                return None;
            }
        };

        self.ssd.touch(key);

        let policy = self.access.policy();
        if self.access.is_hot(key) && payload.len() as u64 <= policy.size_limit {
            if let Err(e) = self.promote(key, payload.clone()) {
                log::warn!("promotion of {} failed: {}", key, e);
            }
        }

        self.monitor.record_hit();
        self.monitor.record_latency(Operation::Get, start.elapsed());
        Some(payload)
    }

    /// Remove `key` from both tiers. Idempotent.
    pub fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let journal_id = if self.config.journaling {
            Some(self.journal.begin_delete(key)?)
        } else {
            None
        };

        self.memory.remove(key);
        self.remove_disk_entry(key)?;

        if let Some(id) = journal_id {
            self.journal.complete(id)?;
        }
        self.monitor
            .record_latency(Operation::Delete, start.elapsed());
        Ok(())
    }

    /// Usage counters for both tiers.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            mem_used: self.memory.current_bytes(),
            mem_capacity: self.config.mem_max_bytes,
            ssd_used: self.ssd.current_bytes(),
            ssd_capacity: self.config.ssd_max_bytes,
            mem_items: self.memory.len(),
            ssd_items: self.ssd.len(),
        }
    }

    // ------------------------------------------------------------------
    // Tier movement
    // ------------------------------------------------------------------

    /// Evict LRU tails until the memory tier is back under budget,
    /// demoting each through the write pipeline. The most recently used
    /// item is never evicted, so a single oversized payload stays in
    /// memory.
    fn enforce_memory_budget(&self) -> Result<()> {
        while self.memory.over_budget() && self.memory.len() > 1 {
            let Some((victim, payload)) = self.memory.pop_lru() else {
                break;
            };
            self.demote(&victim, &payload).map_err(|e| {
                CacheError::DemoteFailed(format!("evicting {}: {}", victim, e))
            })?;
        }
        Ok(())
    }

    /// Move one payload to the on-disk tier: dedup, compress, encrypt,
    /// write to its shard.
    fn demote(&self, key: &str, payload: &[u8]) -> Result<()> {
        let logical_size = payload.len() as u64;

        if self.is_deduplication_enabled() {
            let hash = DedupIndex::content_hash(payload);
            if let Some(existing) = self.dedup.intern(key, &hash, logical_size) {
                // Identical content already on disk: share the record.
                self.ssd.write_at(key, existing, logical_size);
                return Ok(());
            }
            let encoded = self.encode_record(payload)?;
            let path = self.ssd.write(key, &encoded, logical_size)?;
            self.dedup.register(&hash, path, logical_size);
            self.mirror_write(key, &encoded);
            return Ok(());
        }

        let encoded = self.encode_record(payload)?;
        self.ssd.write(key, &encoded, logical_size)?;
        self.mirror_write(key, &encoded);
        Ok(())
    }

    /// Move one payload back into the memory tier and drop its on-disk
    /// record. Skipped entirely when memory is already saturated well past
    /// its budget, so a burst of hot reads cannot thrash the tier.
    fn promote(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        if self.memory.current_bytes() + payload.len() as u64 > 2 * self.config.mem_max_bytes {
            log::debug!("promotion of {} skipped, memory saturated", key);
            return Ok(());
        }

        log::debug!("promoting hot key {}", key);
        self.memory.insert(key, payload);
        self.remove_disk_entry(key)?;
        self.enforce_memory_budget()
    }

    /// Sweep idle memory items down to the low-water mark.
    ///
    /// Does nothing below the high-water mark. Items accessed within the
    /// policy's `max_age` are kept even under pressure.
    pub fn demote_cold(&self) -> Result<usize> {
        let policy = self.demotion_policy.read().clone();
        if self.memory.current_bytes() <= policy.high_water {
            return Ok(0);
        }

        let mut demoted = 0;
        let budget = self.memory.len();
        for _ in 0..budget {
            if self.memory.current_bytes() <= policy.low_water || self.memory.len() <= 1 {
                break;
            }
            let Some((key, payload)) = self.memory.pop_lru() else {
                break;
            };
            let idle = self.access.idle_for(&key).unwrap_or(Duration::MAX);
            if idle < policy.max_age {
                // Still warm: back to the MRU end, look at the next tail.
                self.memory.insert(&key, payload);
                continue;
            }
            self.demote(&key, &payload)
                .map_err(|e| CacheError::DemoteFailed(format!("sweeping {}: {}", key, e)))?;
            demoted += 1;
        }

        if demoted > 0 {
            log::info!("cold sweep demoted {} items", demoted);
        }
        Ok(demoted)
    }

    /// Drop the on-disk record for `key`, honouring dedup refcounts.
    fn remove_disk_entry(&self, key: &str) -> Result<()> {
        if !self.ssd.contains(key) {
            return Ok(());
        }
        let unlink = if self.is_deduplication_enabled() {
            match self.dedup.release(key) {
                Some((_, last)) => last,
                // Written before dedup was enabled: sole owner.
                None => true,
            }
        } else {
            true
        };
        self.ssd.remove(key, unlink)?;
        if unlink {
            if let Some(replicator) = self.replicator.read().as_ref() {
                replicator.replicate_remove(key);
            }
        }
        Ok(())
    }

    fn encode_record(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compression.encode(payload)?;
        self.encryption.encrypt(&compressed)
    }

    /// Run the read pipeline for an on-disk key: read, decrypt, decode.
    pub(crate) fn load_from_disk(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let encoded = {
            let replicator = self.replicator.read();
            match replicator.as_ref() {
                Some(r) if r.using_secondary() => r.read_secondary(key)?,
                _ => self.ssd.read(key)?,
            }
        };
        let Some(encoded) = encoded else {
            return Ok(None);
        };
        let decrypted = self.encryption.decrypt(&encoded)?;
        let payload = self.compression.decode(&decrypted)?;
        Ok(Some(payload))
    }

    fn mirror_write(&self, key: &str, encoded: &[u8]) {
        if let Some(replicator) = self.replicator.read().as_ref() {
            replicator.replicate_write(key, encoded);
        }
    }

    // ------------------------------------------------------------------
    // Feature toggles
    // ------------------------------------------------------------------

    /// Select the at-rest compression codec (`none`, `gzip`, `snappy`).
    /// Unknown tags disable compression rather than failing.
    pub fn enable_compression(&self, codec: &str) {
        self.compression.set_codec(codec);
    }

    /// Enable at-rest encryption with a 32-byte key.
    pub fn enable_encryption(&self, key: &[u8]) -> Result<()> {
        self.encryption.enable(key)
    }

    /// Rotate the encryption key; records written with the old key remain
    /// readable until they are rewritten.
    pub fn rotate_encryption_key(&self, new_key: &[u8]) -> Result<()> {
        self.encryption.rotate(new_key)
    }

    /// Enable content deduplication for subsequent demotions.
    pub fn enable_deduplication(&self) {
        *self.dedup_enabled.write() = true;
        log::info!("deduplication enabled");
    }

    /// Whether deduplication is active.
    pub fn is_deduplication_enabled(&self) -> bool {
        *self.dedup_enabled.read()
    }

    /// Replace the promotion policy.
    pub fn set_promotion_policy(&self, policy: PromotionPolicy) {
        self.access.set_policy(policy);
    }

    /// Replace the cold-sweep demotion policy.
    pub fn set_demotion_policy(&self, policy: DemotionPolicy) {
        *self.demotion_policy.write() = policy;
    }

    /// Start collecting latency samples and hit/miss counters.
    pub fn enable_monitoring(&self) {
        self.monitor.enable();
    }

    /// Mirror demoted records into a secondary shard tree.
    pub fn set_replication(&self, config: ReplicationConfig) -> Result<()> {
        let replicator = Replicator::new(config, self.config.shard_count)?;
        *self.replicator.write() = Some(Arc::new(replicator));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backup and recovery
    // ------------------------------------------------------------------

    /// Create a full backup under `dir`.
    pub fn create_backup(&self, dir: impl AsRef<Path>) -> Result<BackupInfo> {
        self.backup.create_full(self, dir.as_ref())
    }

    /// Create an incremental backup against the manifest of `base_id`.
    pub fn create_incremental_backup(
        &self,
        dir: impl AsRef<Path>,
        base_id: &str,
    ) -> Result<BackupInfo> {
        self.backup.create_incremental(self, dir.as_ref(), base_id)
    }

    /// Create a full backup whose data file is sealed with `key`.
    pub fn create_encrypted_backup(
        &self,
        dir: impl AsRef<Path>,
        key: &[u8],
    ) -> Result<BackupInfo> {
        self.backup.create_encrypted(self, dir.as_ref(), key)
    }

    /// Verify a backup's data file against its manifest checksum.
    pub fn validate_backup(&self, dir: impl AsRef<Path>, id: &str) -> Result<bool> {
        self.backup.validate(dir.as_ref(), id)
    }

    /// Restore every item of a backup through the normal put path.
    pub fn restore_from_backup(&self, dir: impl AsRef<Path>, id: &str) -> Result<usize> {
        self.backup.restore(self, dir.as_ref(), id)
    }

    /// Restore an encrypted backup sealed with `key`.
    pub fn restore_from_encrypted_backup(
        &self,
        dir: impl AsRef<Path>,
        id: &str,
        key: &[u8],
    ) -> Result<usize> {
        self.backup.restore_encrypted(self, dir.as_ref(), id, key)
    }

    /// List backups under `dir`, newest first.
    pub fn list_backups(&self, dir: impl AsRef<Path>) -> Result<Vec<BackupInfo>> {
        self.backup.list_backups(dir.as_ref())
    }

    /// Rebuild the on-disk index from the shard directories, returning
    /// the number of entries added.
    pub fn recover_index(&self) -> Result<usize> {
        self.recovery.recover_index(self)
    }

    /// Quarantine on-disk files the index does not reference.
    pub fn clean_orphaned_files(&self) -> Result<IntegrityReport> {
        self.recovery.clean_orphaned_files(self)
    }

    /// Verify that every indexed record reads, decrypts, and decodes.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        self.recovery.check_integrity(self)
    }

    /// Remove the corrupted entries listed in a report, returning the
    /// number fixed.
    pub fn repair_corruption(&self, report: &IntegrityReport) -> Result<usize> {
        self.recovery.repair_corruption(self, report)
    }

    /// Report from the most recent journal replay, if any ran.
    pub fn last_recovery_report(&self) -> Option<RecoveryReport> {
        self.recovery.last_report()
    }

    /// Redirect reads to the secondary tree (requires replication).
    pub fn simulate_failure(&self) -> Result<()> {
        match self.replicator.read().as_ref() {
            Some(replicator) => {
                replicator.simulate_failure();
                Ok(())
            }
            None => Err(CacheError::Recovery(
                "replication is not configured".to_string(),
            )),
        }
    }

    /// Route reads back to the primary tree.
    pub fn restore_primary(&self) -> Result<()> {
        match self.replicator.read().as_ref() {
            Some(replicator) => {
                replicator.restore_primary();
                Ok(())
            }
            None => Err(CacheError::Recovery(
                "replication is not configured".to_string(),
            )),
        }
    }

    /// Whether reads are currently served from the secondary tree.
    pub fn using_secondary(&self) -> bool {
        self.replicator
            .read()
            .as_ref()
            .map(|r| r.using_secondary())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Deduplication statistics.
    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Compression statistics.
    pub fn compression_stats(&self) -> CompressionStats {
        self.compression.stats()
    }

    /// Latency and hit-rate report.
    pub fn perf_report(&self) -> PerfReport {
        self.monitor.report()
    }

    /// Per-shard write counters for wear-leveling observation.
    pub fn shard_write_counts(&self) -> Vec<u64> {
        self.layout.write_counts()
    }

    /// Drop every memory-tier item without demoting it. On-disk entries
    /// are untouched.
    pub fn clear_memory(&self) {
        self.memory.clear();
        log::info!("memory tier cleared");
    }

    /// Sweep access-recorder entries idle longer than `max_idle`.
    pub fn prune_access_patterns(&self, max_idle: Duration) -> usize {
        self.access.prune(max_idle)
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Memory tier.
    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    /// On-disk store.
    pub fn ssd(&self) -> &SsdStore {
        &self.ssd
    }

    /// Shard layout.
    pub fn layout(&self) -> &Arc<ShardLayout> {
        &self.layout
    }

    /// Access recorder.
    pub fn access(&self) -> &AccessRecorder {
        &self.access
    }

    pub(crate) fn journal(&self) -> &RecoveryJournal {
        &self.journal
    }

    pub(crate) fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    pub(crate) fn remove_entry_everywhere(&self, key: &str) -> Result<()> {
        self.memory.remove(key);
        self.remove_disk_entry(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_only_round_trip() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        cache.put("a", b"X").unwrap();
        assert_eq!(cache.get("a"), Some(b"X".to_vec()));

        let stats = cache.stats();
        assert!(stats.mem_used >= 1);
        assert_eq!(stats.ssd_used, 0);
    }

    #[test]
    fn test_overwrite_semantics() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        cache.put("k", b"first").unwrap();
        cache.put("k", b"second").unwrap();
        assert_eq!(cache.get("k"), Some(b"second".to_vec()));
        assert_eq!(cache.stats().mem_items, 1);
    }

    #[test]
    fn test_delete_then_miss() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        cache.put("k", b"payload").unwrap();
        cache.delete("k").unwrap();
        assert_eq!(cache.get("k"), None);

        // Idempotent.
        cache.delete("k").unwrap();
    }

    #[test]
    fn test_demotion_under_pressure() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        let payload = vec![0xAB; 200];
        for i in 0..10 {
            cache.put(&format!("k{}", i), &payload).unwrap();
        }

        let stats = cache.stats();
        assert!(stats.ssd_used > 0);
        assert!(stats.mem_used < 2000);

        for i in 0..10 {
            assert_eq!(cache.get(&format!("k{}", i)), Some(payload.clone()));
        }
    }

    #[test]
    fn test_memory_budget_holds_after_puts() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(500, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        for i in 0..50 {
            cache.put(&format!("k{}", i), &vec![1u8; 100]).unwrap();
        }
        assert!(cache.stats().mem_used <= 500);
    }

    #[test]
    fn test_single_oversized_item_stays_in_memory() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(100, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        cache.put("big", &vec![7u8; 400]).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.mem_items, 1);
        assert_eq!(stats.ssd_items, 0);
        assert_eq!(cache.get("big"), Some(vec![7u8; 400]));
    }

    #[test]
    fn test_overwrite_of_demoted_key_drops_disk_record() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(300, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();

        cache.put("victim", &vec![1u8; 200]).unwrap();
        cache.put("evictor", &vec![2u8; 200]).unwrap();
        assert!(cache.ssd().contains("victim"));

        cache.put("victim", b"fresh").unwrap();
        assert!(!cache.ssd().contains("victim"));
        assert_eq!(cache.get("victim"), Some(b"fresh".to_vec()));
    }

    #[test]
    fn test_dedup_refcounting_through_controller() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(200, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.enable_deduplication();

        let payload = vec![9u8; 57];
        cache.put("f1", &payload).unwrap();
        cache.put("f2", &payload).unwrap();
        cache.put("f3", &payload).unwrap();
        cache.put("evict", &vec![1u8; 300]).unwrap();

        let stats = cache.dedup_stats();
        assert_eq!(stats.unique_blocks, 1);
        assert_eq!(stats.total_references, 3);

        cache.delete("f1").unwrap();
        let stats = cache.dedup_stats();
        assert_eq!(stats.total_references, 2);

        assert_eq!(cache.get("f2"), Some(payload));
    }

    #[test]
    fn test_encrypted_record_on_disk() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(100, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.enable_encryption(&[42u8; 32]).unwrap();

        let secret = vec![b'S'; 52];
        cache.put("secret", &secret).unwrap();
        // Push it to disk.
        cache.put("filler", &vec![0u8; 200]).unwrap();

        let entry = cache.ssd().entry("secret").expect("secret demoted");
        let raw = std::fs::read(&entry.shard_path).unwrap();
        assert!(raw.len() > secret.len());
        assert!(!raw.windows(secret.len()).any(|w| w == secret.as_slice()));

        cache.clear_memory();
        assert_eq!(cache.get("secret"), Some(secret));
    }

    #[test]
    fn test_compression_round_trip_through_tiers() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(128, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.enable_compression("gzip");

        let payload = vec![b'z'; 4096];
        cache.put("doc", &payload).unwrap();
        cache.put("filler", &vec![1u8; 256]).unwrap();

        assert!(cache.ssd().contains("doc") || cache.memory().contains("doc"));
        cache.clear_memory();
        assert_eq!(cache.get("doc"), Some(payload));
        assert!(cache.compression_stats().ratio() < 1.0);
    }

    #[test]
    fn test_key_rotation_round_trip() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(64, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.enable_encryption(&[1u8; 32]).unwrap();

        let doc = b"rotated document".to_vec();
        cache.put("file", &doc).unwrap();
        cache.put("filler", &vec![0u8; 128]).unwrap();
        cache.clear_memory();

        cache.rotate_encryption_key(&[2u8; 32]).unwrap();
        assert_eq!(cache.get("file"), Some(doc));

        let fresh = b"written after rotation".to_vec();
        cache.put("new", &fresh).unwrap();
        cache.put("filler2", &vec![0u8; 128]).unwrap();
        cache.clear_memory();
        assert_eq!(cache.get("new"), Some(fresh));
    }

    #[test]
    fn test_monitoring_counters() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.enable_monitoring();

        cache.put("a", b"1").unwrap();
        cache.get("a");
        cache.get("missing");

        let report = cache.perf_report();
        assert_eq!(report.hits, 1);
        assert_eq!(report.misses, 1);
        assert!(report.operations.contains_key("put"));
        assert!(report.operations.contains_key("get"));
    }

    #[test]
    fn test_failover_requires_replication() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1024, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        assert!(cache.simulate_failure().is_err());
        assert!(!cache.using_secondary());
    }

    #[test]
    fn test_failover_serves_from_secondary() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(150, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache
            .set_replication(ReplicationConfig::new(dir.path().join("secondary")))
            .unwrap();

        cache.put("doc", &vec![5u8; 100]).unwrap();
        cache.put("filler", &vec![6u8; 120]).unwrap();
        assert!(cache.ssd().contains("doc"));

        cache.simulate_failure().unwrap();
        assert!(cache.using_secondary());
        assert_eq!(cache.get("doc"), Some(vec![5u8; 100]));

        cache.restore_primary().unwrap();
        assert!(!cache.using_secondary());
    }

    #[test]
    fn test_demote_cold_sweep() {
        let dir = tempdir().unwrap();
        let cache = TieredCache::new(1000, 10 * 1024 * 1024, dir.path().join("cache")).unwrap();
        cache.set_demotion_policy(DemotionPolicy {
            max_age: Duration::from_millis(0),
            low_water: 200,
            high_water: 400,
        });

        for i in 0..8 {
            cache.put(&format!("k{}", i), &vec![0u8; 100]).unwrap();
        }

        let demoted = cache.demote_cold().unwrap();
        assert!(demoted > 0);
        assert!(cache.stats().mem_used <= 400);

        // Everything still readable through the disk tier.
        for i in 0..8 {
            assert_eq!(cache.get(&format!("k{}", i)), Some(vec![0u8; 100]));
        }
    }
}
