use super::{Compressor, CompressorKind};
use crate::error::{ImageError, Result};

/// Zstandard, compression id 6.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Result<Self> {
        if !(1..=22).contains(&level) {
            return Err(ImageError::InvalidOption(format!(
                "zstd compression level {level} out of range 1-22"
            )));
        }
        Ok(Self { level })
    }
}

fn codec_error(e: std::io::Error) -> ImageError {
    ImageError::Compression {
        codec: "zstd",
        detail: e.to_string(),
    }
}

impl Compressor for ZstdCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::Zstd
    }

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(input, self.level).map_err(codec_error)
    }

    fn decode(&self, input: &[u8], bound: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(input, bound).map_err(codec_error)
    }
}
