//! Storage engine internals
//!
//! ## Layers
//!
//! - [`storage`] - positional byte I/O over files and memory
//! - [`header`] / [`index`] - the on-disk container format
//! - [`codec`] - per-page compression, encryption and checksums
//! - [`allocator`] - slot placement and hole tracking in the data region
//! - [`stager`] - write buffering ahead of the codec
//! - [`session`] - one open file: byte-range I/O over logical pages
//! - [`vfs`] - SQLite VFS shim routing main databases into sessions
//! - [`bulk`] - whole-file conversion to and from plain databases

pub mod allocator;
pub mod bulk;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod index;
pub mod session;
pub mod stager;
pub mod storage;
pub mod vfs;
