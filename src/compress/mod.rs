//! Block compression strategies.
//!
//! One strategy is chosen per image. Every strategy shares the same storage
//! rule: when compression does not make a block strictly smaller, the raw
//! bytes are stored and the block is flagged as uncompressed.

mod none;
mod zlib;
mod zstandard;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ImageError, Result};
use crate::format::{DATA_UNCOMPRESSED_BIT, META_UNCOMPRESSED_BIT};

pub use none::NoCompressor;
pub use zlib::ZlibCompressor;
pub use zstandard::ZstdCompressor;

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    #[default]
    Zlib,
    Zstd,
    None,
}

impl CompressorKind {
    /// Compression id written to the superblock.
    pub fn id(self) -> u16 {
        match self {
            // Nothing is ever compressed with `none`, so any valid id works.
            CompressorKind::Zlib | CompressorKind::None => 1,
            CompressorKind::Zstd => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressorKind::Zlib => "zlib",
            CompressorKind::Zstd => "zstd",
            CompressorKind::None => "none",
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            CompressorKind::Zlib => 9,
            CompressorKind::Zstd => 15,
            CompressorKind::None => 0,
        }
    }

    /// Instantiate the strategy, validating `level` against its range.
    pub fn build(self, level: Option<i32>) -> Result<Arc<dyn Compressor>> {
        let level = level.unwrap_or_else(|| self.default_level());
        let compressor: Arc<dyn Compressor> = match self {
            CompressorKind::Zlib => Arc::new(ZlibCompressor::new(level)?),
            CompressorKind::Zstd => Arc::new(ZstdCompressor::new(level)?),
            CompressorKind::None => Arc::new(NoCompressor),
        };
        Ok(compressor)
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressorKind {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zlib" | "gzip" => Ok(CompressorKind::Zlib),
            "zstd" => Ok(CompressorKind::Zstd),
            "none" => Ok(CompressorKind::None),
            other => Err(ImageError::InvalidOption(format!(
                "unsupported compressor '{other}'; expected one of: zlib, zstd, none"
            ))),
        }
    }
}

/// Output of compressing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlock {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

impl CompressedBlock {
    /// Store `raw` as-is.
    pub fn stored(raw: Vec<u8>) -> Self {
        Self {
            bytes: raw,
            compressed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Size field for the data block list and the fragment table.
    pub fn data_size_field(&self) -> u32 {
        let size = self.bytes.len() as u32;
        if self.compressed {
            size
        } else {
            size | DATA_UNCOMPRESSED_BIT
        }
    }

    /// Two-byte header preceding a metadata block.
    pub fn metadata_header(&self) -> u16 {
        let size = self.bytes.len() as u16;
        if self.compressed {
            size
        } else {
            size | META_UNCOMPRESSED_BIT
        }
    }
}

/// A pluggable block compressor.
///
/// Implementations only provide the raw codec; [`Compressor::compress`]
/// applies the keep-if-smaller rule.
pub trait Compressor: Send + Sync + fmt::Debug {
    fn kind(&self) -> CompressorKind;

    /// Run the codec on `input`.
    fn encode(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// Inflate `input`, which decodes to at most `bound` bytes.
    fn decode(&self, input: &[u8], bound: usize) -> Result<Vec<u8>>;

    fn compress(&self, input: Vec<u8>) -> Result<CompressedBlock> {
        if input.is_empty() {
            return Ok(CompressedBlock::stored(input));
        }

        let out = self.encode(&input)?;
        if out.len() < input.len() {
            Ok(CompressedBlock {
                bytes: out,
                compressed: true,
            })
        } else {
            Ok(CompressedBlock::stored(input))
        }
    }

    /// Recover the uncompressed bytes of a stored block.
    fn decompress(&self, stored: &[u8], compressed: bool, bound: usize) -> Result<Vec<u8>> {
        if compressed {
            self.decode(stored, bound)
        } else {
            Ok(stored.to_vec())
        }
    }
}
