use super::{CompressedBlock, Compressor, CompressorKind};
use crate::error::Result;

/// Stores every block raw with the uncompressed flag set.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::None
    }

    fn encode(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn decode(&self, input: &[u8], _bound: usize) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn compress(&self, input: Vec<u8>) -> Result<CompressedBlock> {
        Ok(CompressedBlock::stored(input))
    }
}
