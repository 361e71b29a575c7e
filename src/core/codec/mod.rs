//! Per-page codec pipeline
//!
//! Write path: compress (kept only when strictly smaller) → encrypt →
//! CRC32 over the bytes as stored. Read path reverses it; checksum
//! verification happens in the session, which owns the integrity counters.
//!
//! Providers are trait objects resolved by name from the [`registry`], so a
//! container written with a custom algorithm can be reopened by any process
//! that registers the same name.

pub mod compression;
pub mod encryption;
pub mod key;
pub mod registry;

use crate::checksum::compute_checksum;
use crate::error::{CaskError, Result};
use crate::index::{PageFlags, PageIndexEntry};
use std::sync::Arc;

pub use key::MasterKey;

/// Compression algorithm provider
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of `compress`; `original_size` is the exact decompressed length
    fn decompress(&self, input: &[u8], original_size: usize) -> Result<Vec<u8>>;

    /// Upper bound on `compress` output for `input_len` bytes
    fn max_compressed_size(&self, input_len: usize) -> usize;
}

/// Encryption algorithm provider
pub trait Cipher: Send + Sync {
    fn name(&self) -> &str;

    fn encrypt(&self, key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &MasterKey, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Upper bound on `encrypt` output (IV + data + tag/padding)
    fn max_encrypted_size(&self, input_len: usize) -> usize;
}

/// Page bytes ready to be written to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPage {
    pub bytes: Vec<u8>,
    pub flags: PageFlags,
    pub original_size: u32,
    pub checksum: u32,
}

impl EncodedPage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The compressor and cipher a session dispatches through
#[derive(Clone)]
pub struct PageCodec {
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<Arc<dyn Cipher>>,
    page_size: usize,
}

impl std::fmt::Debug for PageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCodec")
            .field("compression", &self.compression_name())
            .field("encryption", &self.encryption_name())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl PageCodec {
    pub fn new(
        compressor: Option<Arc<dyn Compressor>>,
        cipher: Option<Arc<dyn Cipher>>,
        page_size: usize,
    ) -> Self {
        PageCodec {
            compressor,
            cipher,
            page_size,
        }
    }

    /// Resolve providers by name; an unknown name is a configuration error
    pub fn from_names(
        compression: Option<&str>,
        encryption: Option<&str>,
        page_size: usize,
    ) -> Result<Self> {
        let compressor = compression
            .map(|name| {
                registry::compressor(name)
                    .ok_or_else(|| CaskError::BadConfig(format!("unknown compressor '{}'", name)))
            })
            .transpose()?;

        let cipher = encryption
            .map(|name| {
                registry::cipher(name)
                    .ok_or_else(|| CaskError::BadConfig(format!("unknown cipher '{}'", name)))
            })
            .transpose()?;

        Ok(Self::new(compressor, cipher, page_size))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn compression_name(&self) -> Option<&str> {
        self.compressor.as_deref().map(|c| c.name())
    }

    pub fn encryption_name(&self) -> Option<&str> {
        self.cipher.as_deref().map(|c| c.name())
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Largest slot a page can need
    pub fn max_encoded_size(&self) -> usize {
        let compressed = self
            .compressor
            .as_deref()
            .map_or(self.page_size, |c| c.max_compressed_size(self.page_size).max(self.page_size));
        self.cipher
            .as_deref()
            .map_or(compressed, |c| c.max_encrypted_size(compressed))
    }

    /// Compress, encrypt and checksum one logical page
    pub fn encode(&self, page: &[u8]) -> Result<EncodedPage> {
        let mut flags = PageFlags::empty();

        let mut payload = match self.compressor.as_deref() {
            Some(compressor) => {
                let compressed = compressor.compress(page)?;
                if compressed.len() < page.len() {
                    flags |= PageFlags::COMPRESSED;
                    compressed
                } else {
                    page.to_vec()
                }
            }
            None => page.to_vec(),
        };

        if let Some(cipher) = self.cipher.as_deref() {
            let key = key::master_key()?;
            payload = cipher.encrypt(&key, &payload)?;
            flags |= PageFlags::ENCRYPTED;
        }

        let checksum = compute_checksum(&payload);
        Ok(EncodedPage {
            bytes: payload,
            flags,
            original_size: page.len() as u32,
            checksum,
        })
    }

    /// Decrypt and decompress a stored slot back into a full page
    pub fn decode(&self, page: u64, entry: &PageIndexEntry, stored: &[u8]) -> Result<Vec<u8>> {
        let original_size = entry.original_size as usize;
        if original_size > self.page_size {
            return Err(CaskError::corrupt(
                page,
                format!("original size {} exceeds page size {}", original_size, self.page_size),
            ));
        }

        let decrypted;
        let mut payload = stored;
        if entry.flags.contains(PageFlags::ENCRYPTED) {
            let cipher = self.cipher.as_deref().ok_or_else(|| {
                CaskError::BadConfig(format!("page {} is encrypted but no cipher is configured", page))
            })?;
            let key = key::master_key()?;
            decrypted = cipher
                .decrypt(&key, payload)
                .map_err(|e| CaskError::corrupt(page, e.to_string()))?;
            payload = &decrypted;
        }

        let mut out = if entry.flags.contains(PageFlags::COMPRESSED) {
            let compressor = self.compressor.as_deref().ok_or_else(|| {
                CaskError::BadConfig(format!(
                    "page {} is compressed but no compressor is configured",
                    page
                ))
            })?;
            let decompressed = compressor
                .decompress(payload, original_size)
                .map_err(|e| CaskError::corrupt(page, e.to_string()))?;
            if decompressed.len() != original_size {
                return Err(CaskError::corrupt(
                    page,
                    format!(
                        "decompressed {} bytes, expected {}",
                        decompressed.len(),
                        original_size
                    ),
                ));
            }
            decompressed
        } else {
            let len = original_size.min(payload.len());
            payload[..len].to_vec()
        };

        out.resize(self.page_size, 0);
        Ok(out)
    }
}
