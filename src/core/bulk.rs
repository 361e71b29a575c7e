//! Bulk conversion between plain database files and containers
//!
//! Both directions walk the source page by page through the normal session
//! pipeline, so the output is exactly what page-at-a-time writes would have
//! produced.

use crate::config::EngineConfig;
use crate::error::{CaskError, Result};
use crate::session::{OpenFlags, PagedFile};
use crate::storage::{FileStorage, Storage};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BulkReport {
    pub pages: u64,
    /// All-zero pages stored as sparse entries
    pub sparse_pages: u64,
    pub source_bytes: u64,
    pub output_bytes: u64,
}

impl BulkReport {
    /// `output / source`; below 1.0 means the output is smaller
    pub fn ratio(&self) -> f64 {
        if self.source_bytes == 0 {
            return 1.0;
        }
        self.output_bytes as f64 / self.source_bytes as f64
    }
}

/// Convert the plain file at `src` into a new container at `dst`
pub fn compress_database<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dst: Q,
    config: &EngineConfig,
) -> Result<BulkReport> {
    let mut source = FileStorage::open_read_only(src.as_ref())?;
    let dest = FileStorage::create(dst.as_ref())?;
    let report = compress_storage(&mut source, dest, config)?;
    info!(
        "Compressed {} -> {}: {} pages, {} -> {} bytes",
        src.as_ref().display(),
        dst.as_ref().display(),
        report.pages,
        report.source_bytes,
        report.output_bytes
    );
    Ok(report)
}

/// Write every page of `source` into a fresh container on `dest`. A
/// trailing partial page is zero-padded.
pub fn compress_storage<R: Storage, W: Storage>(
    source: &mut R,
    dest: W,
    config: &EngineConfig,
) -> Result<BulkReport> {
    let source_bytes = source.size()?;
    let page_size = config.page_size as u64;
    let pages = source_bytes.div_ceil(page_size);

    let mut out = PagedFile::create(dest, config.clone())?;
    let mut buf = vec![0u8; page_size as usize];
    let mut sparse_pages = 0;

    for page in 0..pages {
        buf.fill(0);
        source.read_at(&mut buf, page * page_size)?;
        if buf.iter().all(|&b| b == 0) {
            sparse_pages += 1;
        }
        out.write_page(page, &buf)?;
    }

    out.force_save()?;
    out.sync()?;
    let output_bytes = out.storage_mut().size()?;
    out.close()?;

    Ok(BulkReport {
        pages,
        sparse_pages,
        source_bytes,
        output_bytes,
    })
}

/// Expand the container at `src` back into a plain file at `dst`
pub fn decompress_database<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<BulkReport> {
    let source = FileStorage::open_read_only(src.as_ref())?;
    let mut dest = FileStorage::create(dst.as_ref())?;
    let report = decompress_storage(source, &mut dest)?;
    info!(
        "Decompressed {} -> {}: {} pages, {} -> {} bytes",
        src.as_ref().display(),
        dst.as_ref().display(),
        report.pages,
        report.source_bytes,
        report.output_bytes
    );
    Ok(report)
}

/// Write every indexed page of the container in `source` to `dest`
pub fn decompress_storage<R: Storage, W: Storage>(mut source: R, dest: &mut W) -> Result<BulkReport> {
    let source_bytes = source.size()?;
    let mut input = PagedFile::open(source, EngineConfig::plain(), OpenFlags::READ_ONLY)?;
    if !input.is_engine_file() {
        return Err(CaskError::NotEngineFile(
            "source has no container header".to_string(),
        ));
    }

    let page_size = input.page_size().unwrap_or_default() as u64;
    let pages = input.total_pages();
    let mut sparse_pages = 0;

    for page in 0..pages {
        if input.index_entry(page).map_or(true, |e| e.is_sparse()) {
            sparse_pages += 1;
        }
        let data = input.read_page(page)?;
        dest.write_at(&data, page * page_size)?;
    }

    let output_bytes = pages * page_size;
    dest.truncate(output_bytes)?;
    dest.sync()?;
    input.close()?;

    Ok(BulkReport {
        pages,
        sparse_pages,
        source_bytes,
        output_bytes,
    })
}
