//! Session configuration
//!
//! Every session opened by the engine inherits an [`EngineConfig`]. The
//! configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! page_size = 4096
//! compression = "lz4"
//! encryption = "aes-256-gcm"
//! checksum_mode = "tolerant"
//!
//! [stager]
//! max_pages = 128
//! flush_watermark = 0.75
//!
//! [holes]
//! min_useful_size = 64
//! ```
//!
//! A codec name of `"none"` (or an empty string) disables that stage.

use crate::error::{CaskError, Result};
use crate::header::NAME_FIELD_LEN;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default number of index entries reserved at creation (1.5 MiB of index
/// table, enough for 256 MiB of 4 KiB pages).
pub const DEFAULT_INDEX_CAPACITY_PAGES: u64 = 65536;

/// Largest index reservation a container may declare
pub const MAX_INDEX_CAPACITY_PAGES: u64 = u32::MAX as u64;

/// What a page-checksum mismatch does to a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Fail the read with a corruption error
    #[default]
    Strict,
    /// Log, count a recovery attempt and keep decoding
    Tolerant,
}

/// What a header-checksum mismatch does to an open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderChecksumPolicy {
    #[default]
    Warn,
    Fail,
}

/// Write stager thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    pub enabled: bool,
    /// Entry-count threshold
    pub max_pages: usize,
    /// Memory threshold in bytes
    pub max_bytes: usize,
    /// Fraction (0, 1] of either threshold that triggers an auto-flush
    pub flush_watermark: f64,
}

impl Default for StagerConfig {
    fn default() -> Self {
        StagerConfig {
            enabled: true,
            max_pages: 64,
            max_bytes: 4 * 1024 * 1024,
            flush_watermark: 1.0,
        }
    }
}

impl StagerConfig {
    pub fn disabled() -> Self {
        StagerConfig {
            enabled: false,
            ..Default::default()
        }
    }

    /// Entry count at which the stager asks to be flushed
    pub fn page_threshold(&self) -> usize {
        ((self.max_pages as f64 * self.flush_watermark).ceil() as usize).max(1)
    }

    /// Staged bytes at which the stager asks to be flushed
    pub fn byte_threshold(&self) -> usize {
        ((self.max_bytes as f64 * self.flush_watermark).ceil() as usize).max(1)
    }
}

/// Hole maintenance tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoleConfig {
    /// Holes smaller than this are dropped during sync; 0 keeps every hole
    pub min_useful_size: u64,
    /// Soft cap on hole count; exceeding it triggers maintenance after a write
    pub max_holes: usize,
}

impl Default for HoleConfig {
    fn default() -> Self {
        HoleConfig {
            min_useful_size: 0,
            max_holes: 4096,
        }
    }
}

/// Defaults for every session opened with this configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logical page size for newly created containers
    pub page_size: u32,
    pub compression: Option<String>,
    pub encryption: Option<String>,
    /// Opaque flags recorded in the header at creation
    pub creation_flags: u32,
    /// Index entries reserved at creation; the index can never outgrow it
    pub index_capacity_pages: u64,
    pub checksum_mode: ChecksumMode,
    /// In tolerant mode, serve a zero page when a slot cannot be decoded
    pub data_recovery: bool,
    pub header_checksum_policy: HeaderChecksumPolicy,
    pub stager: StagerConfig,
    pub holes: HoleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            page_size: DEFAULT_PAGE_SIZE,
            compression: Some("zstd".to_string()),
            encryption: None,
            creation_flags: 0,
            index_capacity_pages: DEFAULT_INDEX_CAPACITY_PAGES,
            checksum_mode: ChecksumMode::Strict,
            data_recovery: false,
            header_checksum_policy: HeaderChecksumPolicy::Warn,
            stager: StagerConfig::default(),
            holes: HoleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration with no codec at all. Sessions opened with it only
    /// become engine files when they load an existing container.
    pub fn plain() -> Self {
        EngineConfig {
            compression: None,
            ..Default::default()
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_compression(mut self, name: Option<&str>) -> Self {
        self.compression = name.map(str::to_string);
        self
    }

    pub fn with_encryption(mut self, name: Option<&str>) -> Self {
        self.encryption = name.map(str::to_string);
        self
    }

    pub fn with_checksum_mode(mut self, mode: ChecksumMode) -> Self {
        self.checksum_mode = mode;
        self
    }

    pub fn with_stager(mut self, stager: StagerConfig) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_index_capacity(mut self, pages: u64) -> Self {
        self.index_capacity_pages = pages;
        self
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn compression_name(&self) -> Option<&str> {
        normalize_name(self.compression.as_deref())
    }

    pub fn encryption_name(&self) -> Option<&str> {
        normalize_name(self.encryption.as_deref())
    }

    /// Whether a new file created with this configuration gets the engine format
    pub fn has_codec(&self) -> bool {
        self.compression_name().is_some() || self.encryption_name().is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(CaskError::InvalidPageSize(self.page_size));
        }

        if self.index_capacity_pages == 0 || self.index_capacity_pages > MAX_INDEX_CAPACITY_PAGES {
            return Err(CaskError::BadConfig(format!(
                "index_capacity_pages must be in 1..={}, got {}",
                MAX_INDEX_CAPACITY_PAGES, self.index_capacity_pages
            )));
        }

        for name in [self.compression_name(), self.encryption_name()]
            .into_iter()
            .flatten()
        {
            if name.len() >= NAME_FIELD_LEN {
                return Err(CaskError::BadConfig(format!(
                    "algorithm name '{}' exceeds {} bytes",
                    name,
                    NAME_FIELD_LEN - 1
                )));
            }
        }

        let watermark = self.stager.flush_watermark;
        if !(watermark > 0.0 && watermark <= 1.0) {
            return Err(CaskError::BadConfig(format!(
                "stager.flush_watermark must be in (0, 1], got {}",
                watermark
            )));
        }

        if self.stager.enabled && (self.stager.max_pages == 0 || self.stager.max_bytes == 0) {
            return Err(CaskError::BadConfig(
                "stager thresholds must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn normalize_name(name: Option<&str>) -> Option<&str> {
    match name {
        None => None,
        Some(n) if n.is_empty() || n.eq_ignore_ascii_case("none") => None,
        Some(n) => Some(n),
    }
}
