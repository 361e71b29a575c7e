//! # Pagecask - Transparent Compressed and Encrypted Paged Storage
//!
//! `pagecask` stores the pages of a database file compressed and/or
//! encrypted, while the database engine above it keeps seeing an ordinary
//! file of fixed-size pages. It plugs into SQLite as a VFS:
//!
//! - **Per-page codec**: LZ4 or Zstd compression, AES-256-GCM encryption,
//!   CRC32 over every stored page
//! - **Variable-size slots** with in-place reuse, best-fit hole recycling
//!   and sparse (all-zero) pages that take no space at all
//! - **Write staging** so pages rewritten between syncs are encoded once
//! - **Pass-through** for plain files, journals and WAL files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagecask::{open_database, register_vfs, EngineConfig, Result, VFS_NAME};
//!
//! # fn main() -> Result<()> {
//! register_vfs(VFS_NAME, EngineConfig::default(), false)?;
//!
//! let conn = open_database("app.db", VFS_NAME)?;
//! conn.execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v BLOB)", [])?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Without SQLite
//!
//! ```rust,no_run
//! use pagecask::{EngineConfig, FileStorage, OpenFlags, PagedFile, Result};
//!
//! # fn main() -> Result<()> {
//! let storage = FileStorage::open("pages.cask")?;
//! let mut file = PagedFile::open(storage, EngineConfig::default(), OpenFlags::CREATE)?;
//!
//! file.write(b"hello", 0)?;
//! file.sync()?;
//!
//! let report = file.close()?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

// Engine implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    allocator, bulk, checksum, codec, config, error, header, index, session, stager, storage, vfs,
};

// Re-export core types that users need
pub use crate::core::{
    allocator::{AllocatorStats, SpaceStats},
    bulk::{compress_database, decompress_database, BulkReport},
    codec::{
        key::{clear_master_key, generate_key, has_master_key, set_master_key, KEY_SIZE},
        registry::{register_cipher, register_compressor, registered_ciphers, registered_compressors},
        Cipher, Compressor, PageCodec,
    },
    config::{ChecksumMode, EngineConfig, HeaderChecksumPolicy, HoleConfig, StagerConfig},
    error::{CaskError, Result},
    header::{ContainerHeader, HEADER_SIZE, MAGIC},
    index::{PageFlags, PageIndexEntry},
    session::{HealthReport, IntegrityStats, OpenFlags, PagedFile, ReadOutcome},
    stager::StagerStats,
    storage::{FileStorage, MemoryStorage, Storage},
    vfs::{is_registered, register_vfs, unregister_vfs, VFS_NAME},
};

use rusqlite::{Connection, OpenFlags as SqliteOpenFlags};
use std::path::Path;
use tracing::debug;

/// Open (or create) a SQLite database through a registered pagecask VFS
pub fn open_database<P: AsRef<Path>>(path: P, vfs_name: &str) -> Result<Connection> {
    if !is_registered(vfs_name) {
        return Err(CaskError::BadConfig(format!(
            "VFS '{}' is not registered",
            vfs_name
        )));
    }

    debug!("Opening {} through '{}'", path.as_ref().display(), vfs_name);
    let conn = Connection::open_with_flags_and_vfs(
        path,
        SqliteOpenFlags::SQLITE_OPEN_READ_WRITE
            | SqliteOpenFlags::SQLITE_OPEN_CREATE
            | SqliteOpenFlags::SQLITE_OPEN_NO_MUTEX,
        vfs_name,
    )?;
    Ok(conn)
}
