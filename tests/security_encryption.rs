//! Encryption security tests
//!
//! The master key is process-wide, so every test here holds `KEY_LOCK` for
//! its whole body.

use pagecask::core::checksum::compute_checksum;
use pagecask::{
    clear_master_key, generate_key, set_master_key, CaskError, EngineConfig, MemoryStorage,
    OpenFlags, PageFlags, PagedFile, HEADER_SIZE,
};
use std::sync::Mutex;

static KEY_LOCK: Mutex<()> = Mutex::new(());

const PAGE: usize = 4096;
const SECRET: &[u8] = b"the launch code is 0000";

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_compression(Some("lz4"))
        .with_encryption(Some("aes-256-gcm"))
        .with_index_capacity(32)
}

fn secret_page() -> Vec<u8> {
    let mut data = vec![0u8; PAGE];
    data[..SECRET.len()].copy_from_slice(SECRET);
    data
}

fn build_encrypted(key: [u8; 32]) -> MemoryStorage {
    set_master_key(key);
    let storage = MemoryStorage::new();
    let mut file = PagedFile::open(storage.clone(), config(), OpenFlags::CREATE).unwrap();
    file.write_page(0, &secret_page()).unwrap();
    file.write_page(1, &vec![0x33; PAGE]).unwrap();
    file.close().unwrap();
    storage
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_plaintext_never_reaches_disk() {
    let _lock = KEY_LOCK.lock().unwrap();
    let storage = build_encrypted(generate_key());

    assert!(!contains(&storage.snapshot(), SECRET));

    let mut file = PagedFile::open(storage, config(), OpenFlags::empty()).unwrap();
    let entry = file.index_entry(0).unwrap();
    assert!(entry.flags.contains(PageFlags::ENCRYPTED));
    assert_eq!(file.read_page(0).unwrap(), secret_page());
    assert_eq!(file.read_page(1).unwrap(), vec![0x33; PAGE]);
}

#[test]
fn test_wrong_key_is_rejected_at_open() {
    let _lock = KEY_LOCK.lock().unwrap();
    let storage = build_encrypted(generate_key());

    set_master_key(generate_key());
    let err = PagedFile::open(storage, config(), OpenFlags::empty()).unwrap_err();
    assert!(matches!(err, CaskError::BadConfig(_)), "unexpected error {}", err);
}

#[test]
fn test_missing_key_fails_on_first_read() {
    let _lock = KEY_LOCK.lock().unwrap();
    let storage = build_encrypted(generate_key());

    clear_master_key();
    let mut file = PagedFile::open(storage, config(), OpenFlags::empty()).unwrap();
    assert!(file.is_engine_file());
    assert!(matches!(file.read_page(0), Err(CaskError::BadConfig(_))));
    assert!(matches!(
        file.write_page(2, &secret_page()),
        Err(CaskError::BadConfig(_))
    ));
}

#[test]
fn test_tampered_ciphertext_fails_authentication() {
    let _lock = KEY_LOCK.lock().unwrap();
    let storage = build_encrypted(generate_key());

    let (offset, size) = {
        let file = PagedFile::open(storage.clone(), config(), OpenFlags::READ_ONLY).unwrap();
        file.index_entry(0).unwrap().slot().unwrap()
    };

    // Flip a ciphertext byte and fix up the stored CRC so only the cipher
    // can notice
    storage.with_bytes(|b| {
        let start = offset as usize;
        let end = start + size as usize;
        b[start + 20] ^= 0x01;
        let crc = compute_checksum(&b[start..end]);
        let entry = HEADER_SIZE;
        b[entry + 16..entry + 20].copy_from_slice(&crc.to_le_bytes());
    });

    let mut file = PagedFile::open(storage, config(), OpenFlags::empty()).unwrap();
    let err = file.read_page(0).unwrap_err();
    assert!(err.is_corruption(), "unexpected error {}", err);
    assert_eq!(file.integrity_stats().checksum_errors, 0);
    assert_eq!(file.read_page(1).unwrap(), vec![0x33; PAGE]);
}

#[test]
fn test_rewrites_use_fresh_nonces() {
    let _lock = KEY_LOCK.lock().unwrap();
    set_master_key(generate_key());

    let storage = MemoryStorage::new();
    let mut file = PagedFile::open(storage.clone(), config(), OpenFlags::CREATE).unwrap();

    let mut ciphertexts = Vec::new();
    for _ in 0..4 {
        file.write_page(0, &secret_page()).unwrap();
        let (offset, size) = file.index_entry(0).unwrap().slot().unwrap();
        let bytes = storage.with_bytes(|b| b[offset as usize..(offset + size) as usize].to_vec());
        ciphertexts.push(bytes);
    }

    for i in 0..ciphertexts.len() {
        for j in i + 1..ciphertexts.len() {
            assert_ne!(ciphertexts[i], ciphertexts[j]);
        }
    }
}

#[test]
fn test_encryption_without_compression() {
    let _lock = KEY_LOCK.lock().unwrap();
    set_master_key(generate_key());

    let cipher_only = config().with_compression(None);
    let storage = MemoryStorage::new();
    let mut file = PagedFile::open(storage.clone(), cipher_only.clone(), OpenFlags::CREATE).unwrap();
    file.write(SECRET, 100).unwrap();
    file.close().unwrap();

    assert!(!contains(&storage.snapshot(), SECRET));

    let mut file = PagedFile::open(storage, cipher_only, OpenFlags::empty()).unwrap();
    let entry = file.index_entry(0).unwrap();
    assert!(entry.flags.contains(PageFlags::ENCRYPTED));
    assert!(!entry.flags.contains(PageFlags::COMPRESSED));

    let mut buf = vec![0u8; SECRET.len()];
    file.read(&mut buf, 100).unwrap();
    assert_eq!(buf, SECRET);
}
