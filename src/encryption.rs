//! # Crypto Pipeline
//!
//! Authenticated encryption at rest using AES-256-GCM. Every record is
//! prefixed with an 8-character key ID (the leading hex of the key's
//! SHA-256) so that records written before a key rotation remain readable:
//! decryption looks the key ID up in a retired-keys table instead of
//! scanning. Rotation never rewrites existing records; they pick up the
//! new key naturally the next time they pass through the write pipeline.
//!
//! ## Record format
//!
//! ```text
//! offset 0    : key_id[8]      ASCII hex prefix of SHA-256(key)
//! offset 8    : nonce_len[1]   12..=32
//! offset 9    : nonce[nonce_len]
//! offset 9+nl : ciphertext || auth tag
//! ```
//!
//! Inputs shorter than the minimum header or carrying an unknown key ID
//! are passed through unchanged, which keeps data written while
//! encryption was disabled readable after it is enabled.

use crate::{CacheError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Required key length in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Length of the ASCII-hex key ID prefix on every encrypted record.
pub const KEY_ID_LEN: usize = 8;

/// Nonce length written by this pipeline (96 bits, the AES-GCM standard).
pub const NONCE_SIZE: usize = 12;

// Shortest input that could be an encrypted record: key id + nonce_len
// byte + at least one more byte.
const MIN_RECORD_LEN: usize = KEY_ID_LEN + 2;

struct ActiveKey {
    cipher: Aes256Gcm,
    key_id: String,
}

struct EncryptionInner {
    current: Option<ActiveKey>,
    retired: HashMap<String, Aes256Gcm>,
}

/// Encrypt/decrypt stage of the on-disk write pipeline.
pub struct EncryptionPipeline {
    inner: RwLock<EncryptionInner>,
}

impl Default for EncryptionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionPipeline {
    /// Create a pipeline with encryption disabled.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(EncryptionInner {
                current: None,
                retired: HashMap::new(),
            }),
        }
    }

    /// Derive the 8-character hex key ID for a raw key.
    pub fn key_id_for(key: &[u8]) -> String {
        hex::encode(Sha256::digest(key))[..KEY_ID_LEN].to_string()
    }

    fn build_key(key: &[u8]) -> Result<ActiveKey> {
        if key.len() != KEY_SIZE {
            return Err(CacheError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let material = Zeroizing::new(key.to_vec());
        let cipher = Aes256Gcm::new_from_slice(&material)
            .map_err(|e| CacheError::InvalidKey(e.to_string()))?;
        Ok(ActiveKey {
            cipher,
            key_id: Self::key_id_for(key),
        })
    }

    /// Enable encryption with a 256-bit key.
    pub fn enable(&self, key: &[u8]) -> Result<()> {
        let active = Self::build_key(key)?;
        let key_id = active.key_id.clone();
        self.inner.write().current = Some(active);
        log::info!("encryption enabled with key {}", key_id);
        Ok(())
    }

    /// Rotate to a new key, retiring the current one for reads.
    ///
    /// Existing records stay decryptable through the retired-keys table;
    /// they are re-encrypted with the new key whenever they are rewritten.
    pub fn rotate(&self, new_key: &[u8]) -> Result<()> {
        let next = Self::build_key(new_key)?;
        let mut inner = self.inner.write();
        if let Some(previous) = inner.current.take() {
            if previous.key_id == next.key_id {
                log::warn!(
                    "rotated key shares id {} with the previous key; retired entry replaced",
                    next.key_id
                );
            }
            inner.retired.insert(previous.key_id, previous.cipher);
        }
        log::info!("encryption key rotated to {}", next.key_id);
        inner.current = Some(next);
        Ok(())
    }

    /// Drop a retired key from the lookup table.
    ///
    /// Records still carrying the dropped key ID become unreadable until
    /// they are rewritten, so this should follow a full rewrite cycle.
    pub fn retire_key(&self, key_id: &str) -> bool {
        self.inner.write().retired.remove(key_id).is_some()
    }

    /// Whether a current key is installed.
    pub fn is_enabled(&self) -> bool {
        self.inner.read().current.is_some()
    }

    /// Key ID of the current key, if any.
    pub fn current_key_id(&self) -> Option<String> {
        self.inner.read().current.as_ref().map(|k| k.key_id.clone())
    }

    /// Number of retired keys still available for decryption.
    pub fn retired_key_count(&self) -> usize {
        self.inner.read().retired.len()
    }

    /// Encrypt a payload. Identity when encryption is disabled.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let Some(active) = inner.current.as_ref() else {
            return Ok(plain.to_vec());
        };

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = active
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CacheError::Encryption("AES-GCM encryption failed".to_string()))?;

        let mut record = Vec::with_capacity(KEY_ID_LEN + 1 + NONCE_SIZE + ciphertext.len());
        record.extend_from_slice(active.key_id.as_bytes());
        record.push(NONCE_SIZE as u8);
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypt a record.
    ///
    /// Inputs that do not parse as an encrypted record (too short, bad
    /// nonce length, unknown key ID) are returned unchanged so that
    /// plaintext legacy data keeps flowing. A record that parses but fails
    /// authentication is an error; the tier controller turns that into a
    /// cache miss.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        if inner.current.is_none() || data.len() < MIN_RECORD_LEN {
            return Ok(data.to_vec());
        }

        let Ok(key_id) = std::str::from_utf8(&data[..KEY_ID_LEN]) else {
            return Ok(data.to_vec());
        };

        let nonce_len = data[KEY_ID_LEN] as usize;
        if !(NONCE_SIZE..=32).contains(&nonce_len) || data.len() <= KEY_ID_LEN + 1 + nonce_len {
            return Ok(data.to_vec());
        }

        let cipher = match inner.current.as_ref() {
            Some(active) if active.key_id == key_id => &active.cipher,
            _ => match inner.retired.get(key_id) {
                Some(c) => c,
                // Unknown key id: treat as unencrypted legacy data.
                None => return Ok(data.to_vec()),
            },
        };

        if nonce_len != NONCE_SIZE {
            return Err(CacheError::Encryption(format!(
                "unsupported nonce length {}",
                nonce_len
            )));
        }

        let nonce = &data[KEY_ID_LEN + 1..KEY_ID_LEN + 1 + nonce_len];
        let ciphertext = &data[KEY_ID_LEN + 1 + nonce_len..];
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                CacheError::Encryption("AES-GCM authentication failed".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Vec<u8> {
        vec![b; KEY_SIZE]
    }

    #[test]
    fn test_identity_when_disabled() {
        let pipeline = EncryptionPipeline::new();
        let data = b"plain payload";
        assert_eq!(pipeline.encrypt(data).unwrap(), data);
        assert_eq!(pipeline.decrypt(data).unwrap(), data);
    }

    #[test]
    fn test_rejects_short_key() {
        let pipeline = EncryptionPipeline::new();
        assert!(matches!(
            pipeline.enable(&[0u8; 16]),
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();

        let plain = b"secret document contents";
        let record = pipeline.encrypt(plain).unwrap();
        assert_ne!(record, plain);
        assert!(record.len() > plain.len());
        assert_eq!(pipeline.decrypt(&record).unwrap(), plain);
    }

    #[test]
    fn test_record_header_layout() {
        let pipeline = EncryptionPipeline::new();
        let k = key(7);
        pipeline.enable(&k).unwrap();

        let record = pipeline.encrypt(b"x").unwrap();
        assert_eq!(&record[..KEY_ID_LEN], EncryptionPipeline::key_id_for(&k).as_bytes());
        assert_eq!(record[KEY_ID_LEN] as usize, NONCE_SIZE);
    }

    #[test]
    fn test_short_input_passes_through() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();
        let tiny = b"abc";
        assert_eq!(pipeline.decrypt(tiny).unwrap(), tiny);
    }

    #[test]
    fn test_unknown_key_id_passes_through() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();

        // Looks like a record but carries a key id nobody knows.
        let mut forged = b"deadbeef".to_vec();
        forged.push(12);
        forged.extend_from_slice(&[0u8; 20]);
        assert_eq!(pipeline.decrypt(&forged).unwrap(), forged);
    }

    #[test]
    fn test_rotation_keeps_old_records_readable() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();
        let old_record = pipeline.encrypt(b"written before rotation").unwrap();

        pipeline.rotate(&key(2)).unwrap();
        assert_eq!(pipeline.retired_key_count(), 1);
        assert_eq!(
            pipeline.decrypt(&old_record).unwrap(),
            b"written before rotation"
        );

        let new_record = pipeline.encrypt(b"written after rotation").unwrap();
        assert_eq!(
            &new_record[..KEY_ID_LEN],
            EncryptionPipeline::key_id_for(&key(2)).as_bytes()
        );
        assert_eq!(
            pipeline.decrypt(&new_record).unwrap(),
            b"written after rotation"
        );
    }

    #[test]
    fn test_retire_key_drops_lookup() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();
        let old_record = pipeline.encrypt(b"old").unwrap();
        pipeline.rotate(&key(2)).unwrap();

        let old_id = EncryptionPipeline::key_id_for(&key(1));
        assert!(pipeline.retire_key(&old_id));
        assert!(!pipeline.retire_key(&old_id));

        // With the key gone, the record no longer decrypts; it reads back
        // as opaque legacy bytes.
        assert_eq!(pipeline.decrypt(&old_record).unwrap(), old_record);
    }

    #[test]
    fn test_tampered_record_fails_authentication() {
        let pipeline = EncryptionPipeline::new();
        pipeline.enable(&key(1)).unwrap();
        let mut record = pipeline.encrypt(b"authentic").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        assert!(pipeline.decrypt(&record).is_err());
    }
}
