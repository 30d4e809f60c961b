//! # Backup Engine
//!
//! Full, incremental, and encrypted backups of both tiers. A backup is a
//! directory holding a pretty-printed JSON manifest and a single
//! concatenated `data.bak` file; every manifest item records its key,
//! size, SHA-256, and offset into the data file, so restore can verify
//! each payload before it re-enters the cache through the normal write
//! path. A scheduler thread can fire full backups on a fixed interval and
//! retain only the newest N.

use crate::cache::{CacheStats, TieredCache};
use crate::encryption::{KEY_SIZE, NONCE_SIZE};
use crate::{CacheError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Manifest schema version.
const MANIFEST_VERSION: u32 = 1;

/// Name of the concatenated payload file inside a backup directory.
const DATA_FILE: &str = "data.bak";

/// Name of the manifest file inside a backup directory.
const MANIFEST_FILE: &str = "manifest.json";

/// Backup flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Complete snapshot of both tiers
    Full,

    /// Items changed since a base backup (memory tier only)
    Incremental,
}

/// One payload recorded in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupItem {
    /// Cache key
    pub key: String,

    /// Payload length in bytes
    pub size: u64,

    /// Lowercase hex SHA-256 of the payload
    pub sha256: String,

    /// When the item was captured
    pub timestamp: DateTime<Utc>,

    /// Byte offset into `data.bak`
    pub offset: u64,
}

/// Header of a backup manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup directory name, e.g. `backup-1719410000`
    pub id: String,

    /// Backup flavor
    pub kind: BackupKind,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Number of items captured
    pub item_count: usize,

    /// Sum of payload sizes
    pub total_bytes: u64,

    /// Lowercase hex SHA-256 of `data.bak` as written
    pub data_checksum: String,

    /// Whether `data.bak` is AEAD-sealed
    pub encrypted: bool,

    /// Base backup id for incrementals
    pub base_id: Option<String>,

    /// Cache usage counters at capture time
    pub cache_stats: CacheStats,
}

/// A backup manifest: header plus per-item records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Header
    pub info: BackupInfo,

    /// Items in data-file order
    pub items: Vec<BackupItem>,

    /// Schema version
    pub version: u32,
}

/// Creates, validates, and restores backups.
pub struct BackupEngine {
    // Serializes backup operations; concurrent backups of one cache
    // would interleave their tier snapshots.
    lock: RwLock<()>,
}

impl Default for BackupEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupEngine {
    /// Create an engine.
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    /// Create a full backup of both tiers under `dir`.
    pub fn create_full(&self, cache: &TieredCache, dir: &Path) -> Result<BackupInfo> {
        let _guard = self.lock.write();
        self.write_backup(cache, dir, BackupKind::Full, None)
    }

    /// Create an incremental backup against `base_id`'s manifest.
    ///
    /// Only memory-tier items are compared and captured; entries that
    /// changed exclusively on disk since the base are not picked up.
    pub fn create_incremental(
        &self,
        cache: &TieredCache,
        dir: &Path,
        base_id: &str,
    ) -> Result<BackupInfo> {
        let _guard = self.lock.write();
        let base = load_manifest(dir, base_id)?;
        self.write_backup(cache, dir, BackupKind::Incremental, Some(base))
    }

    /// Create a full backup and seal its data file with a 32-byte key.
    pub fn create_encrypted(
        &self,
        cache: &TieredCache,
        dir: &Path,
        key: &[u8],
    ) -> Result<BackupInfo> {
        if key.len() != KEY_SIZE {
            return Err(CacheError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let _guard = self.lock.write();
        let info = self.write_backup(cache, dir, BackupKind::Full, None)?;

        let backup_dir = dir.join(&info.id);
        let data_path = backup_dir.join(DATA_FILE);
        let plain = fs::read(&data_path)?;

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CacheError::InvalidKey(e.to_string()))?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| CacheError::Encryption("backup sealing failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        fs::write(&data_path, &sealed)?;

        // The manifest checksum covers the file as it sits on disk, so
        // validation keeps working on the sealed bytes.
        let mut manifest = load_manifest(dir, &info.id)?;
        manifest.info.encrypted = true;
        manifest.info.data_checksum = hex::encode(Sha256::digest(&sealed));
        write_manifest(&backup_dir, &manifest)?;

        log::info!("backup {} sealed", manifest.info.id);
        Ok(manifest.info)
    }

    fn write_backup(
        &self,
        cache: &TieredCache,
        dir: &Path,
        kind: BackupKind,
        base: Option<BackupManifest>,
    ) -> Result<BackupInfo> {
        let created_at = Utc::now();
        let id = unique_backup_id(dir, kind, created_at)?;
        let backup_dir = dir.join(&id);
        fs::create_dir_all(&backup_dir)?;

        let pairs = self.collect_items(cache, base.as_ref())?;

        let mut data = Vec::new();
        let mut items = Vec::with_capacity(pairs.len());
        let mut offset = 0u64;
        for (key, payload) in &pairs {
            items.push(BackupItem {
                key: key.clone(),
                size: payload.len() as u64,
                sha256: hex::encode(Sha256::digest(payload)),
                timestamp: created_at,
                offset,
            });
            data.extend_from_slice(payload);
            offset += payload.len() as u64;
        }

        let data_path = backup_dir.join(DATA_FILE);
        fs::write(&data_path, &data)?;

        let info = BackupInfo {
            id: id.clone(),
            kind,
            created_at,
            item_count: items.len(),
            total_bytes: offset,
            data_checksum: hex::encode(Sha256::digest(&data)),
            encrypted: false,
            base_id: base.map(|m| m.info.id),
            cache_stats: cache.stats(),
        };

        let manifest = BackupManifest {
            info: info.clone(),
            items,
            version: MANIFEST_VERSION,
        };
        write_manifest(&backup_dir, &manifest)?;

        log::info!(
            "backup {} created: {} items, {} bytes",
            id,
            info.item_count,
            info.total_bytes
        );
        Ok(info)
    }

    /// Gather (key, payload) pairs for a backup. Disk payloads are
    /// reconstructed through the read pipeline; unreadable entries are
    /// skipped with a warning rather than failing the whole backup.
    fn collect_items(
        &self,
        cache: &TieredCache,
        base: Option<&BackupManifest>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let memory_pairs = cache.memory().iter_snapshot();

        match base {
            Some(base) => {
                let mut base_hashes = std::collections::HashMap::new();
                for item in &base.items {
                    base_hashes.insert(item.key.clone(), item.sha256.clone());
                }

                let mut changed = Vec::new();
                for (key, payload) in memory_pairs {
                    let hash = hex::encode(Sha256::digest(&payload));
                    if base_hashes.get(&key) != Some(&hash) {
                        changed.push((key, payload));
                    }
                }
                Ok(changed)
            }
            None => {
                let mut pairs = memory_pairs;
                let in_memory: std::collections::HashSet<String> =
                    pairs.iter().map(|(k, _)| k.clone()).collect();

                for key in cache.ssd().keys() {
                    if in_memory.contains(&key) {
                        continue;
                    }
                    match cache.load_from_disk(&key) {
                        Ok(Some(payload)) => pairs.push((key, payload)),
                        Ok(None) => {
                            log::warn!("backup skipping {}: record missing", key);
                        }
                        Err(e) => {
                            log::warn!("backup skipping {}: {}", key, e);
                        }
                    }
                }
                Ok(pairs)
            }
        }
    }

    /// Recompute the data file checksum and compare to the manifest.
    pub fn validate(&self, dir: &Path, id: &str) -> Result<bool> {
        let _guard = self.lock.read();
        let manifest = load_manifest(dir, id)?;
        let data = fs::read(dir.join(id).join(DATA_FILE))?;
        Ok(hex::encode(Sha256::digest(&data)) == manifest.info.data_checksum)
    }

    /// Restore every item of a backup through the cache's normal put
    /// path, verifying each payload hash first.
    pub fn restore(&self, cache: &TieredCache, dir: &Path, id: &str) -> Result<usize> {
        let _guard = self.lock.write();
        let manifest = load_manifest(dir, id)?;
        if manifest.info.encrypted {
            return Err(CacheError::InvalidKey(
                "backup is sealed; restore it with its encryption key".to_string(),
            ));
        }
        let data = fs::read(dir.join(id).join(DATA_FILE))?;
        self.restore_items(cache, &manifest, &data)
    }

    /// Restore an encrypted backup sealed with `key`.
    pub fn restore_encrypted(
        &self,
        cache: &TieredCache,
        dir: &Path,
        id: &str,
        key: &[u8],
    ) -> Result<usize> {
        if key.len() != KEY_SIZE {
            return Err(CacheError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let _guard = self.lock.write();
        let manifest = load_manifest(dir, id)?;
        if !manifest.info.encrypted {
            return Err(CacheError::Backup(format!("backup {} is not sealed", id)));
        }

        let sealed = fs::read(dir.join(id).join(DATA_FILE))?;
        if sealed.len() < NONCE_SIZE {
            return Err(CacheError::Backup("sealed data file truncated".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CacheError::InvalidKey(e.to_string()))?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let data = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CacheError::Encryption("backup unsealing failed".to_string()))?;

        self.restore_items(cache, &manifest, &data)
    }

    fn restore_items(
        &self,
        cache: &TieredCache,
        manifest: &BackupManifest,
        data: &[u8],
    ) -> Result<usize> {
        let mut restored = 0;
        for item in &manifest.items {
            let start = item.offset as usize;
            let end = start + item.size as usize;
            if end > data.len() {
                return Err(CacheError::Backup(format!(
                    "item {} extends past the data file",
                    item.key
                )));
            }
            let payload = &data[start..end];
            if hex::encode(Sha256::digest(payload)) != item.sha256 {
                return Err(CacheError::ChecksumMismatch(item.key.clone()));
            }
            cache.put(&item.key, payload)?;
            restored += 1;
        }
        log::info!(
            "restored {} items from backup {}",
            restored,
            manifest.info.id
        );
        Ok(restored)
    }

    /// Backups under `dir`, newest first.
    pub fn list_backups(&self, dir: &Path) -> Result<Vec<BackupInfo>> {
        let mut infos = Vec::new();
        if !dir.exists() {
            return Ok(infos);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !entry.path().is_dir() || !name.starts_with("backup-") {
                continue;
            }
            match load_manifest(dir, name) {
                Ok(manifest) => infos.push(manifest.info),
                Err(e) => log::warn!("skipping unreadable backup {}: {}", name, e),
            }
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(infos)
    }

    /// Delete one backup directory.
    pub fn delete_backup(&self, dir: &Path, id: &str) -> Result<()> {
        let path = dir.join(id);
        if path.exists() {
            fs::remove_dir_all(&path)?;
            log::info!("backup {} deleted", id);
        }
        Ok(())
    }
}

fn unique_backup_id(dir: &Path, kind: BackupKind, created_at: DateTime<Utc>) -> Result<String> {
    let prefix = match kind {
        BackupKind::Full => "backup",
        BackupKind::Incremental => "backup-incr",
    };
    let base = format!("{}-{}", prefix, created_at.timestamp());
    if !dir.join(&base).exists() {
        return Ok(base);
    }
    for n in 1..10_000 {
        let candidate = format!("{}-{}", base, n);
        if !dir.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(CacheError::Backup(
        "could not allocate a unique backup id".to_string(),
    ))
}

fn load_manifest(dir: &Path, id: &str) -> Result<BackupManifest> {
    let path = dir.join(id).join(MANIFEST_FILE);
    if !path.exists() {
        return Err(CacheError::BackupNotFound(id.to_string()));
    }
    let text = fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn write_manifest(backup_dir: &Path, manifest: &BackupManifest) -> Result<()> {
    let text = serde_json::to_string_pretty(manifest)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    fs::write(backup_dir.join(MANIFEST_FILE), text)?;
    Ok(())
}

/// Periodic full-backup worker.
///
/// One thread, one ticker; each tick fires a full backup and prunes the
/// directory down to the newest `retain` backups. Dropped or stopped, the
/// thread exits at the next channel wakeup.
pub struct BackupScheduler {
    stop_tx: crossbeam::channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackupScheduler {
    /// Start the worker.
    pub fn start(
        cache: Arc<TieredCache>,
        dir: PathBuf,
        interval: Duration,
        retain: usize,
        on_error: Option<Box<dyn Fn(&CacheError) + Send + Sync>>,
    ) -> Self {
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let handle = thread::spawn(move || {
            let ticker = crossbeam::channel::tick(interval);
            loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        match cache.create_backup(&dir) {
                            Ok(info) => {
                                log::debug!("scheduled backup {} complete", info.id);
                                if let Err(e) = prune_backups(&dir, retain) {
                                    log::warn!("backup retention failed: {}", e);
                                }
                            }
                            Err(e) => {
                                log::error!("scheduled backup failed: {}", e);
                                if let Some(callback) = &on_error {
                                    callback(&e);
                                }
                            }
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Delete all but the newest `retain` backups under `dir`.
fn prune_backups(dir: &Path, retain: usize) -> Result<()> {
    let engine = BackupEngine::new();
    let infos = engine.list_backups(dir)?;
    for info in infos.into_iter().skip(retain) {
        engine.delete_backup(dir, &info.id)?;
    }
    Ok(())
}
