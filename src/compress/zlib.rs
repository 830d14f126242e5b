use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::{Compressor, CompressorKind};
use crate::error::{ImageError, Result};

/// zlib (deflate with zlib framing), compression id 1.
#[derive(Debug, Clone)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn new(level: i32) -> Result<Self> {
        if !(0..=9).contains(&level) {
            return Err(ImageError::InvalidOption(format!(
                "zlib compression level {level} out of range 0-9"
            )));
        }
        Ok(Self {
            level: level as u32,
        })
    }
}

fn codec_error(e: std::io::Error) -> ImageError {
    ImageError::Compression {
        codec: "zlib",
        detail: e.to_string(),
    }
}

impl Compressor for ZlibCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::Zlib
    }

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            ZlibEncoder::new(Vec::with_capacity(input.len()), Compression::new(self.level));
        encoder.write_all(input).map_err(codec_error)?;
        encoder.finish().map_err(codec_error)
    }

    fn decode(&self, input: &[u8], bound: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(bound);
        ZlibDecoder::new(input)
            .take(bound as u64)
            .read_to_end(&mut out)
            .map_err(codec_error)?;
        Ok(out)
    }
}
