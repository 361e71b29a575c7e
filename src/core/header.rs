//! Container header
//!
//! The first [`HEADER_SIZE`] bytes of every container. All integers are
//! little-endian:
//!
//! ```text
//! 0    magic "PAGECASK"              8
//! 8    version major / minor         2 + 2
//! 12   header size                   4
//! 16   page size                     4
//! 20   total pages                   8
//! 28   database size in pages        8
//! 36   index table offset            8
//! 44   reserved index bytes          8
//! 52   compression name (NUL padded) 32
//! 84   encryption name (NUL padded)  32
//! 116  creation flags                4
//! 120  created at (unix seconds)     8
//! 128  master-key fingerprint        16
//! 144  reserved (zero)               364
//! 508  CRC32 of bytes [0, 508)       4
//! ```

use crate::checksum::{compute_checksum, trailing_checksum};
use crate::config::{
    EngineConfig, HeaderChecksumPolicy, MAX_INDEX_CAPACITY_PAGES, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::error::{CaskError, Result};
use crate::index::INDEX_ENTRY_SIZE;
use crate::storage::Storage;
use tracing::warn;

pub const MAGIC: [u8; 8] = *b"PAGECASK";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const HEADER_SIZE: usize = 512;

/// Width of the NUL-padded algorithm name fields
pub const NAME_FIELD_LEN: usize = 32;
pub const FINGERPRINT_LEN: usize = 16;

const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub header_size: u32,
    pub page_size: u32,
    /// Entries in the index table
    pub total_pages: u64,
    /// 1 + highest live page, or 0
    pub database_size_pages: u64,
    /// Fixed after creation
    pub index_table_offset: u64,
    /// Bytes reserved for the index table
    pub index_capacity_bytes: u64,
    pub compression: String,
    pub encryption: String,
    pub creation_flags: u32,
    pub created_at: i64,
    pub key_fingerprint: [u8; FINGERPRINT_LEN],
    /// Checksum as stored on disk; recomputed on every save
    pub checksum: u32,
}

impl ContainerHeader {
    /// Header for a brand-new container
    pub fn new(config: &EngineConfig, key_fingerprint: [u8; FINGERPRINT_LEN]) -> Self {
        ContainerHeader {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            header_size: HEADER_SIZE as u32,
            page_size: config.page_size,
            total_pages: 0,
            database_size_pages: 0,
            index_table_offset: HEADER_SIZE as u64,
            index_capacity_bytes: config.index_capacity_pages * INDEX_ENTRY_SIZE as u64,
            compression: config.compression_name().unwrap_or_default().to_string(),
            encryption: config.encryption_name().unwrap_or_default().to_string(),
            creation_flags: config.creation_flags,
            created_at: chrono::Utc::now().timestamp(),
            key_fingerprint,
            checksum: 0,
        }
    }

    /// First byte of the variable-size slot area
    pub fn data_region_start(&self) -> u64 {
        self.index_table_offset.saturating_add(self.index_capacity_bytes)
    }

    /// Index entries that fit in the reserved region
    pub fn index_capacity_pages(&self) -> u64 {
        self.index_capacity_bytes / INDEX_ENTRY_SIZE as u64
    }

    pub fn compression_name(&self) -> Option<&str> {
        (!self.compression.is_empty()).then_some(self.compression.as_str())
    }

    pub fn encryption_name(&self) -> Option<&str> {
        (!self.encryption.is_empty()).then_some(self.encryption.as_str())
    }

    pub fn has_fingerprint(&self) -> bool {
        self.key_fingerprint != [0u8; FINGERPRINT_LEN]
    }

    /// Check magic, version and layout fields
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(CaskError::InvalidMagic);
        }

        // Minor revisions are readable; a different major is someone else's format
        if self.version_major != VERSION_MAJOR {
            return Err(CaskError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(CaskError::InvalidPageSize(self.page_size));
        }

        if self.header_size as usize != HEADER_SIZE {
            return Err(CaskError::InvalidHeader(format!(
                "header size {} (expected {})",
                self.header_size, HEADER_SIZE
            )));
        }

        if self.index_table_offset < HEADER_SIZE as u64 {
            return Err(CaskError::InvalidHeader(format!(
                "index table offset {} overlaps the header",
                self.index_table_offset
            )));
        }

        if self.index_capacity_bytes == 0 || self.index_capacity_bytes % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(CaskError::InvalidHeader(format!(
                "index reservation of {} bytes is not a whole number of entries",
                self.index_capacity_bytes
            )));
        }
        if self.index_capacity_pages() > MAX_INDEX_CAPACITY_PAGES {
            return Err(CaskError::InvalidHeader(format!(
                "index reservation of {} entries exceeds {}",
                self.index_capacity_pages(),
                MAX_INDEX_CAPACITY_PAGES
            )));
        }
        self.index_table_offset
            .checked_add(self.index_capacity_bytes)
            .ok_or_else(|| {
                CaskError::InvalidHeader(format!(
                    "index table at {} with {} reserved bytes overflows the address space",
                    self.index_table_offset, self.index_capacity_bytes
                ))
            })?;

        let index_bytes = self
            .total_pages
            .checked_mul(INDEX_ENTRY_SIZE as u64)
            .ok_or_else(|| CaskError::InvalidHeader("total page count overflows".into()))?;
        if index_bytes > self.index_capacity_bytes {
            return Err(CaskError::InvalidHeader(format!(
                "{} index entries exceed the reserved {} bytes",
                self.total_pages, self.index_capacity_bytes
            )));
        }

        if self.database_size_pages > self.total_pages {
            return Err(CaskError::InvalidHeader(format!(
                "database size {} exceeds total pages {}",
                self.database_size_pages, self.total_pages
            )));
        }

        Ok(())
    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes with a fresh checksum
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.total_pages.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.database_size_pages.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.index_table_offset.to_le_bytes());
        bytes[44..52].copy_from_slice(&self.index_capacity_bytes.to_le_bytes());
        write_name(&mut bytes[52..84], &self.compression);
        write_name(&mut bytes[84..116], &self.encryption);
        bytes[116..120].copy_from_slice(&self.creation_flags.to_le_bytes());
        bytes[120..128].copy_from_slice(&self.created_at.to_le_bytes());
        bytes[128..144].copy_from_slice(&self.key_fingerprint);

        let checksum = compute_checksum(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Parse and validate a header. The stored checksum is kept in
    /// `checksum`; comparing it is the caller's policy decision.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(CaskError::NotEngineFile(format!(
                "{} bytes is too small for a header",
                bytes.len()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(CaskError::InvalidMagic);
        }

        let mut key_fingerprint = [0u8; FINGERPRINT_LEN];
        key_fingerprint.copy_from_slice(&bytes[128..144]);

        let header = ContainerHeader {
            magic,
            version_major: read_u16(bytes, 8),
            version_minor: read_u16(bytes, 10),
            header_size: read_u32(bytes, 12),
            page_size: read_u32(bytes, 16),
            total_pages: read_u64(bytes, 20),
            database_size_pages: read_u64(bytes, 28),
            index_table_offset: read_u64(bytes, 36),
            index_capacity_bytes: read_u64(bytes, 44),
            compression: read_name(&bytes[52..84])?,
            encryption: read_name(&bytes[84..116])?,
            creation_flags: read_u32(bytes, 116),
            created_at: read_u64(bytes, 120) as i64,
            key_fingerprint,
            checksum: read_u32(bytes, CHECKSUM_OFFSET),
        };

        header.validate()?;
        Ok(header)
    }

    /// Read the header from offset 0, applying the checksum policy
    pub fn load<S: Storage>(storage: &mut S, policy: HeaderChecksumPolicy) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        let n = storage.read_at(&mut bytes, 0)?;
        let header = Self::from_bytes(&bytes[..n])?;

        let computed = trailing_checksum(&bytes).unwrap_or_default();
        if computed != header.checksum {
            match policy {
                HeaderChecksumPolicy::Fail => {
                    return Err(CaskError::HeaderChecksum {
                        stored: header.checksum,
                        computed,
                    })
                }
                HeaderChecksumPolicy::Warn => warn!(
                    "Header checksum mismatch (stored {:#010x}, computed {:#010x}), continuing",
                    header.checksum, computed
                ),
            }
        }

        Ok(header)
    }

    /// Write the header to offset 0, refreshing the stored checksum
    pub fn save<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        let bytes = self.to_bytes();
        storage.write_at(&bytes, 0)?;
        self.checksum = read_u32(&bytes, CHECKSUM_OFFSET);
        Ok(())
    }
}

fn write_name(field: &mut [u8], name: &str) {
    let len = name.len().min(field.len() - 1);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
}

fn read_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| CaskError::InvalidHeader("algorithm name is not UTF-8".to_string()))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn sample_header() -> ContainerHeader {
        let config = EngineConfig::default()
            .with_compression(Some("lz4"))
            .with_encryption(Some("aes-256-gcm"))
            .with_index_capacity(1024);
        let mut header = ContainerHeader::new(&config, [7u8; FINGERPRINT_LEN]);
        header.total_pages = 12;
        header.database_size_pages = 10;
        header
    }

    #[test]
    fn test_header_creation() {
        let header = sample_header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version_major, VERSION_MAJOR);
        assert_eq!(header.index_table_offset, HEADER_SIZE as u64);
        assert_eq!(header.index_capacity_bytes, 1024 * INDEX_ENTRY_SIZE as u64);
        assert_eq!(header.data_region_start(), 512 + 1024 * 24);
        assert_eq!(header.index_capacity_pages(), 1024);
        assert_eq!(header.compression_name(), Some("lz4"));
        assert_eq!(header.encryption_name(), Some("aes-256-gcm"));
        assert!(header.has_fingerprint());
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_header_bytes_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..8], b"PAGECASK");

        let parsed = ContainerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.total_pages, 12);
        assert_eq!(parsed.compression, "lz4");
        assert_eq!(parsed.key_fingerprint, [7u8; FINGERPRINT_LEN]);
        assert_eq!(parsed.checksum, compute_checksum(&bytes[..CHECKSUM_OFFSET]));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[0..8].copy_from_slice(b"SQLite f");
        assert!(matches!(
            ContainerHeader::from_bytes(&bytes),
            Err(CaskError::InvalidMagic)
        ));
    }

    #[test]
    fn test_major_version_mismatch() {
        let mut header = sample_header();
        header.version_major = 2;
        let bytes = header.to_bytes();
        let err = ContainerHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, CaskError::UnsupportedVersion { major: 2, .. }));
        assert!(err.is_format_mismatch());
    }

    #[test]
    fn test_minor_version_accepted() {
        let mut header = sample_header();
        header.version_minor = 3;
        let parsed = ContainerHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.version_minor, 3);
    }

    #[test]
    fn test_index_overflowing_reservation_rejected() {
        let mut header = sample_header();
        header.total_pages = header.index_capacity_pages() + 1;
        header.database_size_pages = 0;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(CaskError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_overflowing_index_reservation_rejected() {
        let mut header = sample_header();
        header.total_pages = 0;
        header.database_size_pages = 0;
        header.index_capacity_bytes = (u64::MAX / INDEX_ENTRY_SIZE as u64) * INDEX_ENTRY_SIZE as u64;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(CaskError::InvalidHeader(_))
        ));

        header.index_capacity_bytes = u64::MAX - 10;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(CaskError::InvalidHeader(_))
        ));

        header.index_capacity_bytes = 0;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(CaskError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_index_table_offset_overflow_rejected() {
        let mut header = sample_header();
        header.index_table_offset = u64::MAX - 100;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(CaskError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            ContainerHeader::from_bytes(&[0u8; 100]),
            Err(CaskError::NotEngineFile(_))
        ));
    }

    #[test]
    fn test_checksum_policy() {
        let mut storage = MemoryStorage::new();
        let mut header = sample_header();
        header.save(&mut storage).unwrap();

        // Flip a byte in the reserved area: fields still parse, checksum fails
        storage.with_bytes(|bytes| bytes[300] ^= 0xFF);

        let loaded = ContainerHeader::load(&mut storage, HeaderChecksumPolicy::Warn).unwrap();
        assert_eq!(loaded.total_pages, 12);

        assert!(matches!(
            ContainerHeader::load(&mut storage, HeaderChecksumPolicy::Fail),
            Err(CaskError::HeaderChecksum { .. })
        ));
    }

    #[test]
    fn test_save_load_byte_identical() {
        let mut storage = MemoryStorage::new();
        let mut header = sample_header();
        header.save(&mut storage).unwrap();
        let first = storage.snapshot();

        let mut loaded = ContainerHeader::load(&mut storage, HeaderChecksumPolicy::Fail).unwrap();
        assert_eq!(loaded, header);
        loaded.save(&mut storage).unwrap();
        assert_eq!(storage.snapshot(), first);
    }
}
