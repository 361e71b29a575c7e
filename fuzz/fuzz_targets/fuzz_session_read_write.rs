#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use pagecask::{EngineConfig, MemoryStorage, OpenFlags, PagedFile, StagerConfig};

const PAGE: usize = 512;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { offset: u16, fill: u8, len: u16 },
    Read { offset: u16, len: u16 },
    Truncate { size: u16 },
    Sync,
    Reopen,
}

// Random byte-range I/O against a plain in-memory model of the file
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let config = EngineConfig::default()
        .with_page_size(PAGE as u32)
        .with_compression(Some("lz4"))
        .with_index_capacity(256)
        .with_stager(StagerConfig {
            max_pages: 4,
            ..Default::default()
        });

    let storage = MemoryStorage::new();
    let mut file = PagedFile::open(storage.clone(), config.clone(), OpenFlags::CREATE).unwrap();
    let mut model: Vec<u8> = Vec::new();

    for op in ops.into_iter().take(64) {
        match op {
            Op::Write { offset, fill, len } => {
                let (offset, len) = (offset as usize % 65536, len as usize % 2048);
                if len == 0 {
                    continue;
                }
                let data = vec![fill; len];
                file.write(&data, offset as u64).unwrap();
                if model.len() < offset + len {
                    model.resize(offset + len, 0);
                }
                model[offset..offset + len].copy_from_slice(&data);
            }
            Op::Read { offset, len } => {
                let (offset, len) = (offset as usize, len as usize % 2048);
                let mut buf = vec![0xA5; len];
                file.read(&mut buf, offset as u64).unwrap();
                for (i, &b) in buf.iter().enumerate() {
                    assert_eq!(b, model.get(offset + i).copied().unwrap_or(0));
                }
            }
            Op::Truncate { size } => {
                let size = size as usize;
                file.truncate(size as u64).unwrap();
                model.resize(size.min(model.len()), 0);
            }
            Op::Sync => file.sync().unwrap(),
            Op::Reopen => {
                file.close().unwrap();
                file = PagedFile::open(storage.clone(), config.clone(), OpenFlags::CREATE).unwrap();
            }
        }
        file.allocator().unwrap().check_layout().unwrap();
    }
});
