//! Page index
//!
//! A dense array of [`PageIndexEntry`] records, one per logical page,
//! mirrored from the fixed-offset index table. Entries are never removed
//! except by truncation; a page that is overwritten with zeros becomes
//! sparse and keeps its entry.

use crate::error::{CaskError, Result};
use crate::header::ContainerHeader;
use crate::storage::Storage;
use std::io;

/// On-disk size of one entry: offset u64, size u32, original u32, crc u32, flags u32
pub const INDEX_ENTRY_SIZE: usize = 24;

/// Spare entries allocated past the requested count when the array grows
const INDEX_SLACK: usize = 64;

bitflags::bitflags! {
    /// Encoding applied to a stored page
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        const COMPRESSED = 1;
        const ENCRYPTED = 2;
        const SPARSE = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageIndexEntry {
    /// 0 means the page has no slot
    pub physical_offset: u64,
    /// Encoded bytes on disk
    pub physical_size: u32,
    pub original_size: u32,
    /// CRC32 of the encoded bytes as stored
    pub checksum: u32,
    pub flags: PageFlags,
}

impl PageIndexEntry {
    /// Entry for an all-zero page
    pub fn sparse(page_size: u32) -> Self {
        PageIndexEntry {
            physical_offset: 0,
            physical_size: 0,
            original_size: page_size,
            checksum: 0,
            flags: PageFlags::SPARSE,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.physical_offset == 0 || self.flags.contains(PageFlags::SPARSE)
    }

    /// `(offset, size)` of the slot holding this page, if any
    pub fn slot(&self) -> Option<(u64, u64)> {
        (!self.is_sparse()).then_some((self.physical_offset, self.physical_size as u64))
    }

    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.physical_offset.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.physical_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.original_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&bytes[0..8]);

        PageIndexEntry {
            physical_offset: u64::from_le_bytes(offset),
            physical_size: u32_at(8),
            original_size: u32_at(12),
            checksum: u32_at(16),
            // Unknown bits are kept so a save writes back what was loaded
            flags: PageFlags::from_bits_retain(u32_at(20)),
        }
    }
}

/// In-memory mirror of the index table
#[derive(Debug, Clone)]
pub struct PageIndex {
    entries: Vec<PageIndexEntry>,
    dirty: bool,
    /// Entries present in the on-disk table after the last save
    persisted: usize,
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PageIndex {
    pub fn new() -> Self {
        PageIndex {
            entries: Vec::with_capacity(INDEX_SLACK),
            dirty: false,
            persisted: 0,
        }
    }

    /// Load `header.total_pages` entries from the index table
    pub fn load<S: Storage>(storage: &mut S, header: &ContainerHeader) -> Result<Self> {
        let total = header.total_pages as usize;
        if total == 0 {
            return Ok(Self::new());
        }

        // Bound the table by the file before allocating for it
        let table_end = header
            .total_pages
            .checked_mul(INDEX_ENTRY_SIZE as u64)
            .and_then(|len| header.index_table_offset.checked_add(len))
            .ok_or_else(|| {
                CaskError::InvalidHeader(format!(
                    "index table of {} entries overflows the address space",
                    header.total_pages
                ))
            })?;
        let file_size = storage.size()?;
        if table_end > file_size {
            return Err(CaskError::InvalidHeader(format!(
                "index table truncated: ends at {}, file is {} bytes",
                table_end, file_size
            )));
        }

        let mut bytes = vec![0u8; total * INDEX_ENTRY_SIZE];
        storage
            .read_exact_at(&mut bytes, header.index_table_offset)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    CaskError::InvalidHeader(format!("index table truncated: {}", e))
                }
                _ => CaskError::Io(e),
            })?;

        let mut entries = Vec::with_capacity(total + INDEX_SLACK);
        entries.extend(
            bytes
                .chunks_exact(INDEX_ENTRY_SIZE)
                .map(PageIndexEntry::from_bytes),
        );

        Ok(PageIndex {
            entries,
            dirty: false,
            persisted: total,
        })
    }

    /// Persist the index if it changed since the last save
    pub fn save<S: Storage>(&mut self, storage: &mut S, header: &ContainerHeader) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.force_save(storage, header)?;
        Ok(true)
    }

    /// Persist the index regardless of the dirty flag
    pub fn force_save<S: Storage>(&mut self, storage: &mut S, header: &ContainerHeader) -> Result<()> {
        check_capacity(self.entries.len() as u64, header)?;

        // Entries dropped by a truncation are zeroed on disk as well
        let slots = self.entries.len().max(self.persisted);
        let mut bytes = vec![0u8; slots * INDEX_ENTRY_SIZE];
        for (chunk, entry) in bytes.chunks_exact_mut(INDEX_ENTRY_SIZE).zip(&self.entries) {
            chunk.copy_from_slice(&entry.to_bytes());
        }

        storage.write_at(&bytes, header.index_table_offset)?;
        self.dirty = false;
        self.persisted = self.entries.len();
        Ok(())
    }

    /// Grow so that `count` entries exist. New entries are sparse (zeroed).
    pub fn expand(&mut self, count: usize) {
        if count <= self.entries.len() {
            return;
        }

        if count > self.entries.capacity() {
            let grown = self.entries.capacity() + self.entries.capacity() / 2;
            let target = grown.max(count + INDEX_SLACK);
            self.entries.reserve_exact(target - self.entries.len());
        }

        self.entries.resize(count, PageIndexEntry::default());
        self.dirty = true;
    }

    /// Drop entries at and beyond `count`, returning them
    pub fn truncate(&mut self, count: usize) -> Vec<PageIndexEntry> {
        if count >= self.entries.len() {
            return Vec::new();
        }
        self.dirty = true;
        self.entries.split_off(count)
    }

    pub fn get(&self, page: u64) -> Option<&PageIndexEntry> {
        self.entries.get(page as usize)
    }

    pub fn set(&mut self, page: u64, entry: PageIndexEntry) {
        let page = page as usize;
        if page >= self.entries.len() {
            self.expand(page + 1);
        }
        self.entries[page] = entry;
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocated entry capacity (always at least `len`)
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Pages that currently own a slot
    pub fn live(&self) -> impl Iterator<Item = (u64, &PageIndexEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_sparse())
            .map(|(i, e)| (i as u64, e))
    }

    /// `1 + highest live page`, or 0 when every page is sparse
    pub fn database_size_pages(&self) -> u64 {
        self.entries
            .iter()
            .rposition(|e| !e.is_sparse())
            .map_or(0, |i| i as u64 + 1)
    }
}

/// Fail when `pages` entries would not fit in the reserved index region
pub fn check_capacity(pages: u64, header: &ContainerHeader) -> Result<()> {
    let needed = pages.saturating_mul(INDEX_ENTRY_SIZE as u64);
    if needed > header.index_capacity_bytes {
        return Err(CaskError::IndexOverflow {
            needed,
            capacity: header.index_capacity_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStorage;

    fn live_entry(offset: u64, size: u32) -> PageIndexEntry {
        PageIndexEntry {
            physical_offset: offset,
            physical_size: size,
            original_size: 4096,
            checksum: 0xDEAD_BEEF,
            flags: PageFlags::COMPRESSED | PageFlags::ENCRYPTED,
        }
    }

    fn header_with_capacity(pages: u64) -> ContainerHeader {
        let config = EngineConfig::default().with_index_capacity(pages);
        ContainerHeader::new(&config, [0u8; 16])
    }

    #[test]
    fn test_entry_layout() {
        let entry = live_entry(0x0102_0304_0506_0708, 500);
        let bytes = entry.to_bytes();
        assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &500u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_le_bytes());
        assert_eq!(PageIndexEntry::from_bytes(&bytes), entry);
    }

    #[test]
    fn test_sparse_detection() {
        assert!(PageIndexEntry::default().is_sparse());
        assert!(PageIndexEntry::sparse(4096).is_sparse());

        let mut flagged = live_entry(1000, 10);
        assert!(!flagged.is_sparse());
        assert_eq!(flagged.slot(), Some((1000, 10)));

        flagged.flags |= PageFlags::SPARSE;
        assert!(flagged.is_sparse());
        assert_eq!(flagged.slot(), None);
    }

    #[test]
    fn test_expand_preserves_entries_across_reallocs() {
        let mut index = PageIndex::new();
        for page in 0..1000u64 {
            index.expand(page as usize + 1);
            index.set(page, live_entry(10_000 + page * 100, page as u32 + 1));
        }

        assert_eq!(index.len(), 1000);
        assert!(index.capacity() >= 1000);
        for page in 0..1000u64 {
            assert_eq!(index.get(page).unwrap().physical_offset, 10_000 + page * 100);
        }
    }

    #[test]
    fn test_expand_zeroes_new_entries() {
        let mut index = PageIndex::new();
        index.expand(10);
        assert!(index.is_dirty());
        assert_eq!(index.len(), 10);
        assert!(index.live().next().is_none());
        assert_eq!(index.database_size_pages(), 0);

        // Expansion is monotonic
        index.expand(5);
        assert_eq!(index.len(), 10);
    }

    #[test]
    fn test_database_size_pages() {
        let mut index = PageIndex::new();
        index.set(3, live_entry(1000, 1));
        index.set(7, PageIndexEntry::sparse(4096));
        assert_eq!(index.len(), 8);
        assert_eq!(index.database_size_pages(), 4);

        index.set(3, PageIndexEntry::sparse(4096));
        assert_eq!(index.database_size_pages(), 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut storage = MemoryStorage::new();
        let mut header = header_with_capacity(128);

        let mut index = PageIndex::new();
        index.set(0, live_entry(header.data_region_start(), 300));
        index.set(2, live_entry(header.data_region_start() + 300, 200));
        assert!(index.save(&mut storage, &header).unwrap());
        assert!(!index.is_dirty());
        // Clean index: save is a no-op
        assert!(!index.save(&mut storage, &header).unwrap());

        header.total_pages = index.len() as u64;
        let loaded = PageIndex::load(&mut storage, &header).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get(0), index.get(0));
        assert!(loaded.get(1).unwrap().is_sparse());
        assert_eq!(loaded.get(2), index.get(2));
    }

    #[test]
    fn test_save_refuses_overflow() {
        let mut storage = MemoryStorage::new();
        let header = header_with_capacity(4);

        let mut index = PageIndex::new();
        index.set(4, live_entry(5000, 1));
        assert!(matches!(
            index.save(&mut storage, &header),
            Err(CaskError::IndexOverflow {
                needed: 120,
                capacity: 96
            })
        ));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_truncate_zeroes_dropped_entries_on_disk() {
        let mut storage = MemoryStorage::new();
        let header = header_with_capacity(16);

        let mut index = PageIndex::new();
        for page in 0..4 {
            index.set(page, live_entry(1000 + page * 10, 10));
        }
        index.force_save(&mut storage, &header).unwrap();

        let dropped = index.truncate(2);
        assert_eq!(dropped.len(), 2);
        index.save(&mut storage, &header).unwrap();

        let bytes = storage.snapshot();
        let start = header.index_table_offset as usize;
        assert!(bytes[start + 2 * INDEX_ENTRY_SIZE..start + 4 * INDEX_ENTRY_SIZE]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn test_load_refuses_table_larger_than_file() {
        let mut storage = MemoryStorage::from_bytes(vec![0u8; 600]);
        let mut header = header_with_capacity(u32::MAX as u64);
        header.total_pages = u32::MAX as u64;
        assert!(matches!(
            PageIndex::load(&mut storage, &header),
            Err(CaskError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_check_capacity_saturates() {
        let header = header_with_capacity(4);
        assert!(matches!(
            check_capacity(u64::MAX, &header),
            Err(CaskError::IndexOverflow { needed: u64::MAX, .. })
        ));
    }

    #[test]
    fn test_load_truncated_table() {
        let mut storage = MemoryStorage::from_bytes(vec![0u8; 600]);
        let mut header = header_with_capacity(16);
        header.total_pages = 10;
        assert!(matches!(
            PageIndex::load(&mut storage, &header),
            Err(CaskError::InvalidHeader(_))
        ));
    }
}
