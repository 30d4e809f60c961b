//! # Stratacache - Tiered Object Cache
//!
//! A tiered, content-addressed object cache with:
//! - Fast in-memory tier with byte-bounded LRU eviction
//! - Sharded on-disk (SSD) tier with transparent compression and encryption
//! - Content deduplication with reference counting
//! - Encryption key rotation with backward-compatible decryption
//! - Full, incremental, and encrypted backups with manifest verification
//! - Crash recovery: index rebuild, orphan sweep, integrity repair, journal replay
//! - Access-pattern tracking that drives promotion between tiers
//!
//! ## Architecture
//!
//! Writes always land in the memory tier first. When the tier exceeds its
//! byte budget, cold items are demoted through the write pipeline
//! (deduplication, compression, encryption) into one of N shard
//! directories. Reads reverse the pipeline and promote keys the access
//! recorder considers hot.
//!
//! ## Locking
//!
//! Each subsystem guards its own state with a `parking_lot::RwLock`.
//! Compound operations acquire subsystem locks one at a time in a fixed
//! order (backup, memory, ssd, dedup, encryption, compression, access,
//! shard, perf, recovery) and never hold two at once, so the ordering can
//! never be reversed.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use stratacache::TieredCache;
//!
//! fn main() -> stratacache::Result<()> {
//!     let cache = TieredCache::new(64 * 1024 * 1024, 1024 * 1024 * 1024, "./cache")?;
//!     cache.enable_compression("gzip");
//!     cache.put("report.pdf", b"...payload...")?;
//!     let hit = cache.get("report.pdf");
//!     assert!(hit.is_some());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use thiserror::Error;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// On-disk store error
    #[error("storage error: {0}")]
    Storage(String),

    /// Encryption or decryption error
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Encryption key has the wrong length
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Compression or decompression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Eviction could not demote an item to the on-disk tier
    #[error("demotion failed: {0}")]
    DemoteFailed(String),

    /// Backup creation, validation, or restore error
    #[error("backup error: {0}")]
    Backup(String),

    /// Referenced backup does not exist
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// A payload hash does not match its manifest entry
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Recovery engine error
    #[error("recovery error: {0}")]
    Recovery(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

// Module declarations
pub mod access;
pub mod backup;
pub mod cache;
pub mod compression;
pub mod dedup;
pub mod encryption;
pub mod memory;
pub mod monitor;
pub mod recovery;
pub mod replication;
pub mod shard;
pub mod ssd;

// Re-exports for convenience
pub use access::{AccessRecorder, PromotionPolicy};
pub use backup::{BackupEngine, BackupInfo, BackupItem, BackupKind, BackupManifest, BackupScheduler};
pub use cache::{CacheConfig, CacheStats, DemotionPolicy, TieredCache};
pub use compression::{Codec, CompressionPipeline, CompressionStats};
pub use dedup::{DedupIndex, DedupStats};
pub use encryption::EncryptionPipeline;
pub use memory::MemoryTier;
pub use monitor::{LatencySummary, Operation, PerfMonitor, PerfReport};
pub use recovery::{IntegrityReport, JournalEntry, JournalOp, RecoveryEngine, RecoveryJournal, RecoveryReport};
pub use replication::{ReplicationConfig, Replicator};
pub use shard::ShardLayout;
pub use ssd::{SsdEntry, SsdStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
