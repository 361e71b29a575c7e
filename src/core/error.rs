use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaskError {
    #[error("Not a pagecask container: {0}")]
    NotEngineFile(String),

    #[error("Invalid magic number in header")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid page size: {0}")]
    InvalidPageSize(u32),

    #[error("Invalid container header: {0}")]
    InvalidHeader(String),

    #[error("Header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderChecksum { stored: u32, computed: u32 },

    #[error("Page {page} is corrupt: {reason}")]
    Corrupt { page: u64, reason: String },

    #[error("Out of space: {0}")]
    NoSpace(String),

    #[error("Index overflow: {needed} bytes needed, {capacity} bytes reserved")]
    IndexOverflow { needed: u64, capacity: u64 },

    #[error("Bad configuration: {0}")]
    BadConfig(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Container is opened read-only")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("VFS registration failed: {0}")]
    VFSRegistrationFailed(i32),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl CaskError {
    pub(crate) fn corrupt(page: u64, reason: impl Into<String>) -> Self {
        CaskError::Corrupt {
            page,
            reason: reason.into(),
        }
    }

    /// The bytes on disk do not belong to this engine (or to a major
    /// version it understands). Opening such a file falls back to
    /// pass-through I/O.
    pub fn is_format_mismatch(&self) -> bool {
        matches!(
            self,
            CaskError::NotEngineFile(_)
                | CaskError::InvalidMagic
                | CaskError::UnsupportedVersion { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CaskError::Corrupt { .. } | CaskError::InvalidHeader(_) | CaskError::HeaderChecksum { .. }
        )
    }

    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            CaskError::NoSpace(_) | CaskError::IndexOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CaskError>;
