//! # Compression Pipeline
//!
//! Pluggable at-rest compression for demoted payloads. The codec is
//! selected by a runtime tag; unknown tags fall back to identity so a
//! stale configuration value can never take the store down. Cumulative
//! counters expose how much the configured codec actually saves.

use crate::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression codec selected by a runtime tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// Identity: payloads are stored as-is
    None,

    /// Gzip (DEFLATE) via flate2
    Gzip,

    /// Snappy block format
    Snappy,
}

impl Codec {
    /// Parse a codec tag. Unknown tags map to [`Codec::None`].
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "none" => Codec::None,
            "gzip" => Codec::Gzip,
            "snappy" => Codec::Snappy,
            other => {
                log::warn!("unknown compression codec '{}', storing uncompressed", other);
                Codec::None
            }
        }
    }

    /// Canonical tag for the codec.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Gzip => "gzip",
            Codec::Snappy => "snappy",
        }
    }
}

/// Cumulative compression statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Plaintext bytes fed into `encode`
    pub bytes_in: u64,

    /// Encoded bytes produced by `encode`
    pub bytes_out: u64,

    /// Number of encode operations
    pub encode_ops: u64,

    /// Number of decode operations
    pub decode_ops: u64,
}

impl CompressionStats {
    /// Encoded-to-plaintext size ratio (1.0 when nothing was encoded).
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

struct CompressionInner {
    codec: Codec,
    stats: CompressionStats,
}

/// Encode/decode stage of the on-disk write pipeline.
pub struct CompressionPipeline {
    inner: RwLock<CompressionInner>,
}

impl Default for CompressionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionPipeline {
    /// Create a pipeline with compression disabled.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CompressionInner {
                codec: Codec::None,
                stats: CompressionStats::default(),
            }),
        }
    }

    /// Select the codec by tag. Never fails; unknown tags disable
    /// compression.
    pub fn set_codec(&self, tag: &str) {
        let codec = Codec::from_tag(tag);
        self.inner.write().codec = codec;
        log::info!("compression codec set to {}", codec.name());
    }

    /// Currently configured codec.
    pub fn codec(&self) -> Codec {
        self.inner.read().codec
    }

    /// Compress a payload with the configured codec.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let codec = self.inner.read().codec;
        let encoded = match codec {
            Codec::None => data.to_vec(),
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CacheError::Compression(format!("gzip encode failed: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| CacheError::Compression(format!("gzip finish failed: {}", e)))?
            }
            Codec::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| CacheError::Compression(format!("snappy encode failed: {}", e)))?,
        };

        let mut inner = self.inner.write();
        inner.stats.bytes_in += data.len() as u64;
        inner.stats.bytes_out += encoded.len() as u64;
        inner.stats.encode_ops += 1;
        Ok(encoded)
    }

    /// Decompress a payload with the configured codec.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let codec = self.inner.read().codec;
        let decoded = match codec {
            Codec::None => data.to_vec(),
            Codec::Gzip => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| CacheError::Compression(format!("gzip decode failed: {}", e)))?;
                out
            }
            Codec::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| CacheError::Compression(format!("snappy decode failed: {}", e)))?,
        };

        self.inner.write().stats.decode_ops += 1;
        Ok(decoded)
    }

    /// Snapshot of cumulative counters.
    pub fn stats(&self) -> CompressionStats {
        self.inner.read().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_when_disabled() {
        let pipeline = CompressionPipeline::new();
        let data = b"payload bytes";
        assert_eq!(pipeline.encode(data).unwrap(), data);
        assert_eq!(pipeline.decode(data).unwrap(), data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let pipeline = CompressionPipeline::new();
        pipeline.set_codec("gzip");

        let data = vec![b'a'; 4096];
        let encoded = pipeline.encode(&data).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(pipeline.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_snappy_round_trip() {
        let pipeline = CompressionPipeline::new();
        pipeline.set_codec("snappy");

        let data = b"the quick brown fox jumps over the quick brown fox".repeat(50);
        let encoded = pipeline.encode(&data).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(pipeline.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_unknown_tag_is_identity() {
        let pipeline = CompressionPipeline::new();
        pipeline.set_codec("zstd-ultra");
        assert_eq!(pipeline.codec(), Codec::None);

        let data = b"unchanged";
        assert_eq!(pipeline.encode(data).unwrap(), data);
    }

    #[test]
    fn test_tag_is_case_insensitive() {
        assert_eq!(Codec::from_tag("GZIP"), Codec::Gzip);
        assert_eq!(Codec::from_tag("Snappy"), Codec::Snappy);
    }

    #[test]
    fn test_stats_accumulate() {
        let pipeline = CompressionPipeline::new();
        pipeline.set_codec("gzip");

        let data = vec![b'x'; 1000];
        let encoded = pipeline.encode(&data).unwrap();
        pipeline.decode(&encoded).unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.bytes_in, 1000);
        assert_eq!(stats.encode_ops, 1);
        assert_eq!(stats.decode_ops, 1);
        assert!(stats.ratio() < 1.0);
    }
}
