//! AES-256-GCM page cipher
//!
//! Output format: `[nonce: 12 bytes][ciphertext][tag: 16 bytes]`. Every
//! encryption draws a fresh random nonce, so rewriting a page with the same
//! content still produces different bytes on disk.

use super::key::MasterKey;
use super::Cipher;
use crate::error::{CaskError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

pub const AES_256_GCM: &str = "aes-256-gcm";

/// Nonce size for AES-GCM (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Overhead added by encryption (nonce + tag)
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256GcmCipher;

impl Cipher for Aes256GcmCipher {
    fn name(&self) -> &str {
        AES_256_GCM
    }

    fn encrypt(&self, key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(key.as_bytes().into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CaskError::Codec(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(self.max_encrypted_size(plaintext.len()));
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, key: &MasterKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < ENCRYPTION_OVERHEAD {
            return Err(CaskError::Codec(format!(
                "Encrypted payload too short: {} bytes",
                ciphertext.len()
            )));
        }

        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let nonce = Nonce::from_slice(&ciphertext[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &ciphertext[NONCE_SIZE..])
            .map_err(|e| CaskError::Codec(format!("Decryption failed: {}", e)))
    }

    fn max_encrypted_size(&self, input_len: usize) -> usize {
        input_len + ENCRYPTION_OVERHEAD
    }
}
