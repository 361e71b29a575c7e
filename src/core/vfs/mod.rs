//! SQLite VFS integration
//!
//! Registers a VFS that wraps the platform default. Main database files
//! opened through it are stored as containers; every other file SQLite
//! creates (journals, WAL, temp files) passes through untouched.

pub mod file;
#[allow(clippy::module_inception)]
pub mod vfs;

#[cfg(test)]
mod tests;

pub use file::CaskFile;
pub use vfs::{is_registered, register_vfs, unregister_vfs, CaskVfs, VFS_NAME};
