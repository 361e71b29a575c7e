//! Built-in page compressors
//!
//! - `lz4`: lz4_flex block format, fast with a moderate ratio
//! - `zstd`: Zstandard at level 3 by default, slower with a better ratio
//!
//! Neither format stores the decompressed length; the page index records
//! `original_size` and hands it back on decompression.

use super::Compressor;
use crate::error::{CaskError, Result};

pub const LZ4: &str = "lz4";
pub const ZSTD: &str = "zstd";

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &str {
        LZ4
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(input))
    }

    fn decompress(&self, input: &[u8], original_size: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(input, original_size)
            .map_err(|e| CaskError::Codec(format!("LZ4 decompression failed: {}", e)))
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(input_len)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        ZstdCompressor {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl ZstdCompressor {
    pub fn with_level(level: i32) -> Self {
        ZstdCompressor { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &str {
        ZSTD
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(input, self.level)
            .map_err(|e| CaskError::Codec(format!("Zstd compression failed: {}", e)))
    }

    fn decompress(&self, input: &[u8], original_size: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(input, original_size)
            .map_err(|e| CaskError::Codec(format!("Zstd decompression failed: {}", e)))
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        zstd::zstd_safe::compress_bound(input_len)
    }
}
