//! Process-wide master key
//!
//! One key serves every encrypted container in the process. Callers get a
//! scoped [`MasterKey`] copy per cryptographic call; the copy is wiped when
//! it goes out of scope.

use crate::error::{CaskError, Result};
use crate::header::FINGERPRINT_LEN;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{compiler_fence, Ordering};

pub const KEY_SIZE: usize = 32;

const FINGERPRINT_DOMAIN: &[u8] = b"pagecask/master-key/v1";

/// Key installed by unit tests that exercise encryption. Every such test
/// installs the same bytes so parallel tests never disagree.
#[cfg(test)]
pub(crate) const TEST_KEY: [u8; KEY_SIZE] = [0x5A; KEY_SIZE];

static MASTER_KEY: RwLock<Option<[u8; KEY_SIZE]>> = parking_lot::const_rwlock(None);

/// Scoped copy of the master key, zeroed on drop
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        MasterKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short identifier stored in container headers
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.0);
        let digest = hasher.finalize();

        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        fingerprint
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

fn wipe(bytes: &mut [u8; KEY_SIZE]) {
    for byte in bytes.iter_mut() {
        // SAFETY: `byte` is a valid, aligned, exclusive reference
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Install the process-wide key, replacing any previous one
pub fn set_master_key(key: [u8; KEY_SIZE]) {
    let mut slot = MASTER_KEY.write();
    if let Some(old) = slot.as_mut() {
        wipe(old);
    }
    *slot = Some(key);
}

pub fn clear_master_key() {
    let mut slot = MASTER_KEY.write();
    if let Some(old) = slot.as_mut() {
        wipe(old);
    }
    *slot = None;
}

pub fn has_master_key() -> bool {
    MASTER_KEY.read().is_some()
}

/// Copy of the registered key
pub fn master_key() -> Result<MasterKey> {
    let slot = MASTER_KEY.read();
    match slot.as_ref() {
        Some(bytes) => Ok(MasterKey(*bytes)),
        None => Err(CaskError::BadConfig(
            "encryption requires a master key; none is set".into(),
        )),
    }
}

/// Fingerprint of the registered key, if any
pub fn current_fingerprint() -> Option<[u8; FINGERPRINT_LEN]> {
    master_key().ok().map(|key| key.fingerprint())
}

/// Generate a random 256-bit key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}
