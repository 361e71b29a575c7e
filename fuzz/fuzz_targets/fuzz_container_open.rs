#![no_main]
use libfuzzer_sys::fuzz_target;
use pagecask::{EngineConfig, MemoryStorage, OpenFlags, PagedFile, HEADER_SIZE, MAGIC};

// Arbitrary bytes behind a valid magic: opening and reading every indexed
// page may fail, but must never panic
fuzz_target!(|data: &[u8]| {
    let mut bytes = data.to_vec();
    if bytes.len() >= MAGIC.len() && data[0] & 1 == 0 {
        bytes[..MAGIC.len()].copy_from_slice(&MAGIC);
    }
    if bytes.len() < HEADER_SIZE {
        bytes.resize(HEADER_SIZE, 0);
    }

    let storage = MemoryStorage::from_bytes(bytes);
    let mut file = match PagedFile::open(storage, EngineConfig::plain(), OpenFlags::READ_ONLY) {
        Ok(file) => file,
        Err(_) => return,
    };

    let pages = file.total_pages().min(64);
    for page in 0..pages {
        let _ = file.read_page(page);
    }

    let mut buf = [0u8; 512];
    let _ = file.read(&mut buf, 0);
    let _ = file.close();
});
