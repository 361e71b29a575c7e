//! Concurrency stress tests
//!
//! Sessions are single-threaded; the process-wide pieces (provider
//! registry, master key) are shared and must tolerate concurrent use.

use pagecask::{
    register_compressor, registered_compressors, set_master_key, CaskError, Compressor,
    EngineConfig, MemoryStorage, OpenFlags, PagedFile,
};
use parking_lot::Mutex;
use std::sync::Arc;

const PAGE: usize = 4096;

/// Run-length encoding as (count, byte) pairs
struct RleCompressor;

impl Compressor for RleCompressor {
    fn name(&self) -> &str {
        "rle"
    }

    fn compress(&self, input: &[u8]) -> pagecask::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut iter = input.iter().peekable();
        while let Some(&byte) = iter.next() {
            let mut run = 1u8;
            while run < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }
        Ok(out)
    }

    fn decompress(&self, input: &[u8], original_size: usize) -> pagecask::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(original_size);
        for pair in input.chunks(2) {
            match pair {
                [run, byte] => out.extend(std::iter::repeat(*byte).take(*run as usize)),
                _ => return Err(CaskError::Codec("odd RLE stream".into())),
            }
        }
        Ok(out)
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        input_len * 2
    }
}

fn worker(seed: u8, config: EngineConfig) {
    let storage = MemoryStorage::new();
    let mut file = PagedFile::open(storage.clone(), config.clone(), OpenFlags::CREATE).unwrap();
    for i in 0..40u64 {
        let mut data = vec![seed; PAGE];
        data[..8].copy_from_slice(&i.to_le_bytes());
        file.write(&data, i * PAGE as u64).unwrap();
    }
    file.close().unwrap();

    let mut file = PagedFile::open(storage, config, OpenFlags::empty()).unwrap();
    for i in 0..40u64 {
        let data = file.read_page(i).unwrap();
        assert_eq!(data[..8], i.to_le_bytes());
        assert!(data[8..].iter().all(|&b| b == seed));
    }
}

#[test]
fn test_parallel_sessions_with_shared_registry() {
    set_master_key([0x11; 32]);
    register_compressor(Arc::new(RleCompressor));

    let configs = [
        EngineConfig::default(),
        EngineConfig::default().with_compression(Some("lz4")),
        EngineConfig::default().with_compression(Some("rle")),
        EngineConfig::default().with_encryption(Some("aes-256-gcm")),
    ];

    let handles: Vec<_> = (0..12u8)
        .map(|seed| {
            let config = configs[seed as usize % configs.len()]
                .clone()
                .with_index_capacity(64);
            std::thread::spawn(move || worker(seed, config))
        })
        .collect();

    // Registry reads and writes race with the workers
    for _ in 0..100 {
        register_compressor(Arc::new(RleCompressor));
        assert!(registered_compressors().iter().any(|n| n == "rle"));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_shared_session_behind_mutex() {
    let file = Arc::new(Mutex::new(
        PagedFile::open(
            MemoryStorage::new(),
            EngineConfig::default().with_index_capacity(256),
            OpenFlags::CREATE,
        )
        .unwrap(),
    ));

    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                for i in 0..25u64 {
                    let page = thread_id * 25 + i;
                    let data = vec![(page % 255) as u8 + 1; PAGE];
                    file.lock().write(&data, page * PAGE as u64).unwrap();

                    let mut back = vec![0u8; PAGE];
                    file.lock().read(&mut back, page * PAGE as u64).unwrap();
                    assert_eq!(back, data);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut file = file.lock();
    file.sync().unwrap();
    assert_eq!(file.total_pages(), 100);
    assert_eq!(file.database_size_pages(), 100);
    file.allocator().unwrap().check_layout().unwrap();
}
