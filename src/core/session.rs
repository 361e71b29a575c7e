//! File session
//!
//! [`PagedFile`] is what the host sees as an open file: a flat byte stream
//! addressed by offset. For engine containers every byte range is mapped
//! onto whole logical pages which are staged, encoded and placed into
//! variable-size slots; for anything else (plain databases, journals,
//! files that fail to load as a container) the session is a pass-through
//! wrapper around the underlying [`Storage`].
//!
//! Durability follows the host's sync calls: staged pages, the index table
//! and the header reach the disk on [`PagedFile::sync`], in that order.

use crate::allocator::{HoleManager, Slot, SpaceAllocator, SpaceStats};
use crate::checksum::compute_checksum;
use crate::codec::{key, PageCodec};
use crate::config::{ChecksumMode, EngineConfig};
use crate::error::{CaskError, Result};
use crate::header::{ContainerHeader, HEADER_SIZE};
use crate::index::{check_capacity, PageIndex, PageIndexEntry, INDEX_ENTRY_SIZE};
use crate::stager::{StageOutcome, StagerStats, WriteStager};
use crate::storage::Storage;
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::io;
use tracing::{debug, error, info, warn};

bitflags! {
    /// How the host opened the file
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 0x1;
        const CREATE = 0x2;
    }
}

/// Whether a read was satisfied by the current file contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Complete,
    /// The range extends past the end of the file; the missing part of the
    /// buffer was zero-filled
    Short,
}

/// Page integrity counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityStats {
    pub checksum_errors: u64,
    pub corruption_count: u64,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
}

/// Summary produced when a session closes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub engine_file: bool,
    pub total_pages: u64,
    pub database_size_pages: u64,
    pub hole_count: usize,
    pub fragmentation_score: f64,
    pub integrity: IntegrityStats,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.integrity.corruption_count == 0
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.engine_file {
            return write!(f, "pass-through file");
        }
        write!(
            f,
            "{}: {} pages ({} indexed), {} checksum errors, {} corrupt, {}/{} recovered, {} holes, fragmentation {:.1}",
            if self.is_healthy() { "healthy" } else { "degraded" },
            self.database_size_pages,
            self.total_pages,
            self.integrity.checksum_errors,
            self.integrity.corruption_count,
            self.integrity.recovery_successes,
            self.integrity.recovery_attempts,
            self.hole_count,
            self.fragmentation_score,
        )
    }
}

enum Mode {
    PassThrough,
    Engine(Box<Container>),
}

/// Engine state for one open container
struct Container {
    config: EngineConfig,
    header: ContainerHeader,
    index: PageIndex,
    codec: PageCodec,
    allocator: SpaceAllocator,
    /// Created on the first write
    stager: Option<WriteStager>,
    integrity: IntegrityStats,
    page_size: usize,
    /// Cached size of the underlying file
    physical_len: u64,
    header_on_disk: bool,
}

impl Container {
    fn create(config: EngineConfig) -> Result<Self> {
        let page_size = config.page_size as usize;
        let codec = PageCodec::from_names(config.compression_name(), config.encryption_name(), page_size)?;

        let fingerprint = if codec.is_encrypted() {
            key::current_fingerprint().unwrap_or_default()
        } else {
            Default::default()
        };
        let header = ContainerHeader::new(&config, fingerprint);
        let allocator = SpaceAllocator::new(header.data_region_start());

        info!(
            "Creating container: page size {}, compression {:?}, encryption {:?}, index capacity {} pages",
            page_size,
            codec.compression_name(),
            codec.encryption_name(),
            header.index_capacity_pages()
        );

        Ok(Container {
            config,
            header,
            index: PageIndex::new(),
            codec,
            allocator,
            stager: None,
            integrity: IntegrityStats::default(),
            page_size,
            physical_len: 0,
            header_on_disk: false,
        })
    }

    fn load<S: Storage>(
        storage: &mut S,
        header: ContainerHeader,
        config: EngineConfig,
        physical_len: u64,
    ) -> Result<Self> {
        let page_size = header.page_size as usize;
        let codec = PageCodec::from_names(header.compression_name(), header.encryption_name(), page_size)?;

        if codec.is_encrypted() && header.has_fingerprint() {
            if let Some(current) = key::current_fingerprint() {
                if current != header.key_fingerprint {
                    return Err(CaskError::BadConfig(
                        "registered master key does not match the key this container was written with"
                            .to_string(),
                    ));
                }
            }
        }

        let index = PageIndex::load(storage, &header)?;
        let slots = index.live().map(|(page, entry)| {
            (
                page,
                Slot {
                    offset: entry.physical_offset,
                    size: entry.physical_size as u64,
                },
            )
        });
        let allocator = SpaceAllocator::rebuild(header.data_region_start(), slots, physical_len)?;

        let database_size_pages = index.database_size_pages();
        if database_size_pages != header.database_size_pages {
            warn!(
                "Header records {} database pages, index holds {}; using the index",
                header.database_size_pages, database_size_pages
            );
        }

        info!(
            "Opened container: {} pages, page size {}, compression {:?}, encryption {:?}, {} holes",
            index.len(),
            page_size,
            codec.compression_name(),
            codec.encryption_name(),
            allocator.holes().len()
        );

        Ok(Container {
            config,
            header,
            index,
            codec,
            allocator,
            stager: None,
            integrity: IntegrityStats::default(),
            page_size,
            physical_len,
            header_on_disk: true,
        })
    }

    /// Logical length in pages: every indexed page plus any staged beyond it
    fn logical_pages(&self) -> u64 {
        let staged = self
            .stager
            .as_ref()
            .and_then(WriteStager::highest_page)
            .map_or(0, |p| p + 1);
        (self.index.len() as u64).max(staged)
    }

    fn file_size(&self) -> u64 {
        self.logical_pages() * self.page_size as u64
    }

    fn zero_page(&self) -> Vec<u8> {
        vec![0u8; self.page_size]
    }

    /// Current contents of `page`: the staged copy if any, else the disk copy
    fn load_page<S: Storage>(&mut self, storage: &mut S, page: u64, out: &mut [u8]) -> Result<()> {
        if let Some(stager) = self.stager.as_mut() {
            if stager.buffer_read(page, out) {
                return Ok(());
            }
        }
        let data = self.read_page(storage, page)?;
        out.copy_from_slice(&data);
        Ok(())
    }

    /// Decode one page from its slot
    fn read_page<S: Storage>(&mut self, storage: &mut S, page: u64) -> Result<Vec<u8>> {
        let entry = match self.index.get(page) {
            Some(entry) if !entry.is_sparse() => *entry,
            _ => return Ok(self.zero_page()),
        };

        let mut stored = vec![0u8; entry.physical_size as usize];
        storage
            .read_exact_at(&mut stored, entry.physical_offset)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => CaskError::corrupt(
                    page,
                    format!(
                        "slot {}+{} extends past the end of the file",
                        entry.physical_offset, entry.physical_size
                    ),
                ),
                _ => CaskError::Io(e),
            })?;

        let tolerant = self.config.checksum_mode == ChecksumMode::Tolerant;
        let computed = compute_checksum(&stored);
        let checksum_failed = computed != entry.checksum;
        if checksum_failed {
            self.integrity.checksum_errors += 1;
            self.integrity.corruption_count += 1;
            if !tolerant {
                error!(
                    "Page {} checksum mismatch: stored {:#010x}, computed {:#010x}",
                    page, entry.checksum, computed
                );
                return Err(CaskError::corrupt(
                    page,
                    format!(
                        "checksum mismatch: stored {:#010x}, computed {:#010x}",
                        entry.checksum, computed
                    ),
                ));
            }
            warn!("Page {} checksum mismatch, attempting to decode anyway", page);
            self.integrity.recovery_attempts += 1;
        }

        match self.codec.decode(page, &entry, &stored) {
            Ok(data) => {
                if checksum_failed {
                    self.integrity.recovery_successes += 1;
                }
                Ok(data)
            }
            Err(e) if e.is_corruption() => {
                if !checksum_failed {
                    self.integrity.corruption_count += 1;
                }
                if tolerant && self.config.data_recovery {
                    if !checksum_failed {
                        self.integrity.recovery_attempts += 1;
                    }
                    warn!("Page {} could not be decoded ({}), serving zeros", page, e);
                    return Ok(self.zero_page());
                }
                error!("Page {} could not be decoded: {}", page, e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Encode and place one page, updating its index entry
    fn write_page<S: Storage>(&mut self, storage: &mut S, page: u64, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(CaskError::Codec(format!(
                "page {} is {} bytes, page size is {}",
                page,
                data.len(),
                self.page_size
            )));
        }
        check_capacity(page + 1, &self.header)?;

        let current = self.index.get(page).filter(|e| !e.is_sparse()).copied();

        if data.iter().all(|&b| b == 0) {
            if let Some(entry) = current {
                self.allocator.release(entry.physical_offset);
                debug!(
                    "Page {} zeroed, slot {}+{} released",
                    page, entry.physical_offset, entry.physical_size
                );
            }
            self.index.set(page, PageIndexEntry::sparse(self.page_size as u32));
            return Ok(());
        }

        let encoded = self.codec.encode(data)?;
        if self.codec.is_encrypted() && !self.header.has_fingerprint() {
            self.header.key_fingerprint = key::master_key()?.fingerprint();
            self.header_on_disk = false;
        }
        self.ensure_header(storage)?;

        let placement = self.allocator.place(
            page,
            current.map(|e| e.physical_offset),
            encoded.len() as u64,
            self.physical_len,
        )?;
        if let Err(e) = self.allocator.verify(&placement) {
            error!("Allocator safety check failed: {}", e);
            return Err(e);
        }

        storage.write_at(&encoded.bytes, placement.offset)?;
        self.physical_len = self.physical_len.max(placement.offset + placement.len);
        self.allocator.commit(&placement)?;

        self.index.set(
            page,
            PageIndexEntry {
                physical_offset: placement.offset,
                physical_size: encoded.len() as u32,
                original_size: encoded.original_size,
                checksum: encoded.checksum,
                flags: encoded.flags,
            },
        );
        debug!(
            "Page {} -> {:?} at {} ({} bytes, {:?})",
            page,
            placement.kind,
            placement.offset,
            encoded.len(),
            encoded.flags
        );

        let max_holes = self.config.holes.max_holes;
        if self.allocator.holes().len() > max_holes {
            let (merged, dropped) = self.allocator.maintain(self.config.holes.min_useful_size);
            warn!(
                "Hole count exceeded {}: merged {}, dropped {}, {} remain",
                max_holes,
                merged,
                dropped,
                self.allocator.holes().len()
            );
        }

        Ok(())
    }

    /// Write the header once so a crash before the first sync still leaves
    /// a recognisable container
    fn ensure_header<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        if !self.header_on_disk {
            self.header.save(storage)?;
            self.physical_len = self.physical_len.max(HEADER_SIZE as u64);
            self.header_on_disk = true;
        }
        Ok(())
    }

    /// Stage a full page, writing it directly when staging is unavailable
    fn stage<S: Storage>(&mut self, storage: &mut S, page: u64, data: Vec<u8>) -> Result<()> {
        check_capacity(page + 1, &self.header)?;

        let stager_config = &self.config.stager;
        let stager = self
            .stager
            .get_or_insert_with(|| WriteStager::new(stager_config.clone()));

        match stager.buffer_write(page, data) {
            StageOutcome::Bypassed(data) => self.write_page(storage, page, &data),
            StageOutcome::Staged | StageOutcome::Merged => {
                if stager.should_flush() {
                    self.flush(storage)?;
                }
                Ok(())
            }
        }
    }

    /// Push every staged page through `write_page`. On failure the pages not
    /// yet written go back into the stager.
    fn flush<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        let pages = match self.stager.as_mut() {
            Some(stager) => stager.drain(),
            None => return Ok(()),
        };
        if pages.is_empty() {
            return Ok(());
        }

        let count = pages.len();
        let mut pending = pages.into_iter();
        while let Some(staged) = pending.next() {
            if let Err(e) = self.write_page(storage, staged.page, &staged.data) {
                let mut rest = vec![staged];
                rest.extend(pending);
                warn!("Flush failed, {} pages left staged: {}", rest.len(), e);
                if let Some(stager) = self.stager.as_mut() {
                    stager.restore(rest);
                }
                return Err(e);
            }
        }

        debug!("Flushed {} staged pages", count);
        Ok(())
    }

    fn truncate<S: Storage>(&mut self, storage: &mut S, size: u64) -> Result<()> {
        let page_size = self.page_size as u64;
        let pages = size.div_ceil(page_size);

        if let Some(stager) = self.stager.as_mut() {
            stager.discard_from(pages);
        }

        let tail = (size % page_size) as usize;
        if tail != 0 && pages <= self.logical_pages() {
            let last = pages - 1;
            let mut data = self.zero_page();
            self.load_page(storage, last, &mut data)?;
            if data[tail..].iter().any(|&b| b != 0) {
                data[tail..].fill(0);
                self.stage(storage, last, data)?;
            }
        }

        let removed = self.index.truncate(pages as usize);
        let mut released = 0;
        for entry in removed.iter().filter(|e| !e.is_sparse()) {
            if self.allocator.release(entry.physical_offset).is_some() {
                released += 1;
            }
        }
        if !removed.is_empty() {
            debug!(
                "Truncated to {} pages: {} entries dropped, {} slots released",
                pages,
                removed.len(),
                released
            );
        }
        Ok(())
    }

    /// Flush, maintain holes and persist index then header
    fn persist<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        self.flush(storage)?;

        let (merged, dropped) = self.allocator.maintain(self.config.holes.min_useful_size);
        if merged > 0 || dropped > 0 {
            debug!("Hole maintenance: merged {}, dropped {}", merged, dropped);
        }

        if self.index.save(storage, &self.header)? {
            let index_end = self.header.index_table_offset + (self.index.len() * INDEX_ENTRY_SIZE) as u64;
            self.physical_len = self.physical_len.max(index_end);
        }
        self.save_header(storage)
    }

    fn force_save<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        self.flush(storage)?;
        self.index.force_save(storage, &self.header)?;
        let index_end = self.header.index_table_offset + (self.index.len() * INDEX_ENTRY_SIZE) as u64;
        self.physical_len = self.physical_len.max(index_end);
        self.save_header(storage)
    }

    fn save_header<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        self.header.total_pages = self.index.len() as u64;
        self.header.database_size_pages = self.index.database_size_pages();
        self.header.save(storage)?;
        self.physical_len = self.physical_len.max(HEADER_SIZE as u64);
        self.header_on_disk = true;
        Ok(())
    }

    fn health_report(&self) -> HealthReport {
        let space = self.allocator.space_stats();
        HealthReport {
            engine_file: true,
            total_pages: self.index.len() as u64,
            database_size_pages: self.index.database_size_pages(),
            hole_count: space.hole_count,
            fragmentation_score: space.fragmentation_score,
            integrity: self.integrity,
        }
    }
}

/// An open file: an engine container or a pass-through wrapper
pub struct PagedFile<S: Storage> {
    storage: S,
    flags: OpenFlags,
    mode: Mode,
    closed: bool,
}

impl<S: Storage> PagedFile<S> {
    /// Open a file the way the host asked for it.
    ///
    /// An existing file with a valid container header becomes an engine
    /// session; an empty file opened with `CREATE` becomes a new container
    /// when `config` names a codec; anything else is pass-through.
    pub fn open(mut storage: S, config: EngineConfig, flags: OpenFlags) -> Result<Self> {
        config.validate()?;
        let size = storage.size()?;

        let mode = if size >= HEADER_SIZE as u64 {
            match ContainerHeader::load(&mut storage, config.header_checksum_policy) {
                Ok(header) => Mode::Engine(Box::new(Container::load(&mut storage, header, config, size)?)),
                Err(e) if e.is_format_mismatch() => {
                    debug!("Not a container ({}), opening pass-through", e);
                    Mode::PassThrough
                }
                Err(e) => return Err(e),
            }
        } else if size == 0
            && flags.contains(OpenFlags::CREATE)
            && !flags.contains(OpenFlags::READ_ONLY)
            && config.has_codec()
        {
            Mode::Engine(Box::new(Container::create(config)?))
        } else {
            Mode::PassThrough
        };

        Ok(PagedFile {
            storage,
            flags,
            mode,
            closed: false,
        })
    }

    /// Start a new container on `storage`, discarding its contents. Unlike
    /// [`open`](Self::open) this produces an engine file even when `config`
    /// names no codec.
    pub fn create(mut storage: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if storage.size()? > 0 {
            storage.truncate(0)?;
        }
        Ok(PagedFile {
            storage,
            flags: OpenFlags::CREATE,
            mode: Mode::Engine(Box::new(Container::create(config)?)),
            closed: false,
        })
    }

    /// Wrap `storage` without ever interpreting its contents
    pub fn passthrough(storage: S, flags: OpenFlags) -> Self {
        PagedFile {
            storage,
            flags,
            mode: Mode::PassThrough,
            closed: false,
        }
    }

    pub fn is_engine_file(&self) -> bool {
        matches!(self.mode, Mode::Engine(_))
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(OpenFlags::READ_ONLY)
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn container(&self) -> Option<&Container> {
        match &self.mode {
            Mode::Engine(container) => Some(&**container),
            Mode::PassThrough => None,
        }
    }

    fn engine_mut(&mut self) -> Result<(&mut Container, &mut S)> {
        match &mut self.mode {
            Mode::Engine(container) => Ok((&mut **container, &mut self.storage)),
            Mode::PassThrough => Err(CaskError::NotEngineFile(
                "page operations need an engine container".to_string(),
            )),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(CaskError::ReadOnly);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset` of the logical stream
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let container = match &mut self.mode {
            Mode::PassThrough => {
                let n = self.storage.read_at(buf, offset)?;
                if n < buf.len() {
                    buf[n..].fill(0);
                    return Ok(ReadOutcome::Short);
                }
                return Ok(ReadOutcome::Complete);
            }
            Mode::Engine(container) => container,
        };

        if buf.is_empty() {
            return Ok(ReadOutcome::Complete);
        }

        let page_size = container.page_size as u64;
        let end = range_end(offset, buf.len())?;
        let file_size = container.file_size();
        let mut page_buf = container.zero_page();
        let mut done = 0usize;

        for page in offset / page_size..=(end - 1) / page_size {
            let page_start = page * page_size;
            let from = (offset.max(page_start) - page_start) as usize;
            let to = (end.min(page_start.saturating_add(page_size)) - page_start) as usize;

            if page_start >= file_size {
                page_buf.fill(0);
            } else {
                container.load_page(&mut self.storage, page, &mut page_buf)?;
            }
            buf[done..done + (to - from)].copy_from_slice(&page_buf[from..to]);
            done += to - from;
        }

        if end > file_size {
            Ok(ReadOutcome::Short)
        } else {
            Ok(ReadOutcome::Complete)
        }
    }

    /// Write `buf` at `offset` of the logical stream
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_writable()?;
        let container = match &mut self.mode {
            Mode::PassThrough => return Ok(self.storage.write_at(buf, offset)?),
            Mode::Engine(container) => container,
        };

        if buf.is_empty() {
            return Ok(());
        }

        let page_size = container.page_size as u64;
        let end = range_end(offset, buf.len())?;
        let mut done = 0usize;

        for page in offset / page_size..=(end - 1) / page_size {
            let page_start = page * page_size;
            let from = (offset.max(page_start) - page_start) as usize;
            let to = (end.min(page_start.saturating_add(page_size)) - page_start) as usize;
            let chunk = &buf[done..done + (to - from)];

            let data = if from == 0 && to == container.page_size {
                chunk.to_vec()
            } else {
                let mut current = container.zero_page();
                container.load_page(&mut self.storage, page, &mut current)?;
                current[from..to].copy_from_slice(chunk);
                current
            };

            container.stage(&mut self.storage, page, data)?;
            done += to - from;
        }

        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_writable()?;
        match &mut self.mode {
            Mode::PassThrough => Ok(self.storage.truncate(size)?),
            Mode::Engine(container) => container.truncate(&mut self.storage, size),
        }
    }

    /// Make everything written so far durable
    pub fn sync(&mut self) -> Result<()> {
        if !self.is_read_only() {
            if let Mode::Engine(container) = &mut self.mode {
                container.persist(&mut self.storage)?;
            }
        }
        Ok(self.storage.sync()?)
    }

    /// Write staged pages to their slots without persisting the index
    pub fn flush(&mut self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        match &mut self.mode {
            Mode::Engine(container) => container.flush(&mut self.storage),
            Mode::PassThrough => Ok(()),
        }
    }

    /// Flush, then rewrite the whole index table and the header
    pub fn force_save(&mut self) -> Result<()> {
        self.check_writable()?;
        let (container, storage) = self.engine_mut()?;
        container.force_save(storage)
    }

    /// Size of the logical stream the host sees
    pub fn file_size(&mut self) -> Result<u64> {
        match &self.mode {
            Mode::Engine(container) => Ok(container.file_size()),
            Mode::PassThrough => Ok(self.storage.size()?),
        }
    }

    /// Current contents of one logical page, staged or on disk
    pub fn read_page(&mut self, page: u64) -> Result<Vec<u8>> {
        let (container, storage) = self.engine_mut()?;
        let mut data = container.zero_page();
        container.load_page(storage, page, &mut data)?;
        Ok(data)
    }

    /// Encode and place one full page immediately, bypassing the stager
    pub fn write_page(&mut self, page: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let (container, storage) = self.engine_mut()?;
        if let Some(stager) = container.stager.as_mut() {
            stager.remove(page);
        }
        container.write_page(storage, page, data)
    }

    pub fn header(&self) -> Option<&ContainerHeader> {
        self.container().map(|c| &c.header)
    }

    pub fn page_size(&self) -> Option<u32> {
        self.container().map(|c| c.page_size as u32)
    }

    pub fn index_entry(&self, page: u64) -> Option<PageIndexEntry> {
        self.container().and_then(|c| c.index.get(page).copied())
    }

    /// Entries in the index, sparse ones included
    pub fn total_pages(&self) -> u64 {
        self.container().map_or(0, |c| c.index.len() as u64)
    }

    /// `1 + highest page holding data`, 0 for an empty or pass-through file
    pub fn database_size_pages(&self) -> u64 {
        self.container().map_or(0, |c| c.index.database_size_pages())
    }

    pub fn holes(&self) -> Option<&HoleManager> {
        self.container().map(|c| c.allocator.holes())
    }

    pub fn space_stats(&self) -> Option<SpaceStats> {
        self.container().map(|c| c.allocator.space_stats())
    }

    pub fn allocator(&self) -> Option<&SpaceAllocator> {
        self.container().map(|c| &c.allocator)
    }

    pub fn integrity_stats(&self) -> IntegrityStats {
        self.container().map(|c| c.integrity).unwrap_or_default()
    }

    pub fn stager_stats(&self) -> Option<StagerStats> {
        self.container()
            .and_then(|c| c.stager.as_ref())
            .map(WriteStager::stats)
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn health_report(&self) -> HealthReport {
        match self.container() {
            Some(container) => container.health_report(),
            None => HealthReport {
                engine_file: false,
                total_pages: 0,
                database_size_pages: 0,
                hole_count: 0,
                fragmentation_score: 0.0,
                integrity: IntegrityStats::default(),
            },
        }
    }

    /// Flush and persist (when writable), close the storage and report
    pub fn close(mut self) -> Result<HealthReport> {
        self.closed = true;

        let saved = if self.is_read_only() {
            Ok(())
        } else {
            match &mut self.mode {
                Mode::Engine(container) => container.persist(&mut self.storage),
                Mode::PassThrough => Ok(()),
            }
        };

        let report = self.health_report();
        if let Mode::Engine(container) = &mut self.mode {
            if let Some(stager) = container.stager.as_mut() {
                stager.clear();
            }
        }
        let closed = self.storage.close();

        saved?;
        closed?;
        if self.is_engine_file() {
            info!("Closed container: {}", report);
        }
        Ok(report)
    }
}

/// End of the byte range `[offset, offset + len)`, refused when it wraps
fn range_end(offset: u64, len: usize) -> Result<u64> {
    offset.checked_add(len as u64).ok_or_else(|| {
        CaskError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} bytes at offset {} overflow the file size", len, offset),
        ))
    })
}

impl<S: Storage> Drop for PagedFile<S> {
    fn drop(&mut self) {
        if self.closed || self.is_read_only() {
            return;
        }
        if let Mode::Engine(container) = &mut self.mode {
            if let Err(e) = container.persist(&mut self.storage) {
                warn!("Failed to persist container on drop: {}", e);
            }
        }
    }
}

impl<S: Storage> fmt::Debug for PagedFile<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("PagedFile");
        s.field("flags", &self.flags);
        match self.container() {
            Some(c) => s
                .field("page_size", &c.page_size)
                .field("pages", &c.index.len())
                .field("codec", &c.codec),
            None => s.field("mode", &"pass-through"),
        };
        s.finish()
    }
}
