//! ID table and indexed table placement.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::compress::Compressor;
use crate::error::{ImageError, Result};
use crate::format::{ByteEncoder, META_BLOCK_SIZE};
use crate::metadata::MetadataWriter;

/// Dense mapping of uid/gid values to 16-bit indices, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct IdTable {
    ids: Vec<u32>,
    lookup: HashMap<u32, u16>,
}

impl IdTable {
    /// The superblock stores the id count in 16 bits.
    pub const MAX_IDS: usize = u16::MAX as usize;

    pub fn index_of(&mut self, id: u32) -> Result<u16> {
        if let Some(&index) = self.lookup.get(&id) {
            return Ok(index);
        }
        if self.ids.len() >= Self::MAX_IDS {
            return Err(ImageError::TooManyIds {
                count: self.ids.len() + 1,
            });
        }
        let index = self.ids.len() as u16;
        self.ids.push(id);
        self.lookup.insert(id, index);
        Ok(index)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Write fixed-size `records` as metadata blocks followed by an index of
/// each block's absolute offset.
///
/// `pos` is the absolute offset `out` is positioned at and is advanced past
/// everything written. Returns the offset of the index, which is what the
/// superblock records as the table start.
pub fn write_indexed_table<W: Write>(
    out: &mut W,
    pos: &mut u64,
    compressor: &Arc<dyn Compressor>,
    record_len: usize,
    records: impl IntoIterator<Item = Vec<u8>>,
) -> Result<u64> {
    let per_block = META_BLOCK_SIZE / record_len;
    let body_start = *pos;
    let mut body = MetadataWriter::new(Arc::clone(compressor));
    let mut index = ByteEncoder::new();

    for (i, record) in records.into_iter().enumerate() {
        debug_assert_eq!(record.len(), record_len);
        let addr = body.put(&record)?;
        if i % per_block == 0 {
            index.u64(body_start + u64::from(addr.block));
        }
    }
    body.write_block_no_pad()?;

    *pos += body.write_to(out)?;
    let table_start = *pos;
    out.write_all(index.as_slice())?;
    *pos += index.len() as u64;
    Ok(table_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressorKind;
    use crate::format::encode::{read_u32, read_u64};
    use crate::testing::decode_metadata;
    use crate::format::MetaAddress;

    #[test]
    fn test_ids_are_dense_in_first_seen_order() {
        let mut ids = IdTable::default();
        assert_eq!(ids.index_of(1000).unwrap(), 0);
        assert_eq!(ids.index_of(0).unwrap(), 1);
        assert_eq!(ids.index_of(1000).unwrap(), 0);
        assert_eq!(ids.ids(), &[1000, 0]);
    }

    #[test]
    fn test_id_overflow_is_an_error() {
        let mut ids = IdTable::default();
        for id in 0..65_535u32 {
            ids.index_of(id).unwrap();
        }
        assert_eq!(ids.len(), 65_535);
        assert_eq!(ids.index_of(65_534).unwrap(), 65_534);
        assert!(matches!(
            ids.index_of(65_535),
            Err(ImageError::TooManyIds { count: 65_536 })
        ));
        assert_eq!(ids.len(), 65_535);
    }

    #[test]
    fn test_index_points_at_each_block() {
        let comp = CompressorKind::None.build(None).unwrap();
        let mut out = Vec::new();
        let mut pos = 1000u64;
        // 2048 ids fill exactly one block; 2049 spill into a second.
        let records = (0..2049u32).map(|id| id.to_le_bytes().to_vec());
        let start = write_indexed_table(&mut out, &mut pos, &comp, 4, records).unwrap();

        let body_len = 2 * 2 + META_BLOCK_SIZE + 4;
        assert_eq!(start, 1000 + body_len as u64);
        assert_eq!(pos, start + 16);
        assert_eq!(read_u64(&out, body_len), 1000);
        assert_eq!(read_u64(&out, body_len + 8), 1000 + 2 + META_BLOCK_SIZE as u64);

        let decoded = decode_metadata(&out[..body_len], comp.as_ref());
        let second = decoded.read(MetaAddress::new(2 + META_BLOCK_SIZE as u32, 0), 4);
        assert_eq!(read_u32(&second, 0), 2048);
    }

    #[test]
    fn test_empty_table_has_empty_index() {
        let comp = CompressorKind::Zlib.build(None).unwrap();
        let mut out = Vec::new();
        let mut pos = 4096u64;
        let start =
            write_indexed_table(&mut out, &mut pos, &comp, 16, std::iter::empty()).unwrap();
        assert_eq!(start, 4096);
        assert_eq!(pos, 4096);
        assert!(out.is_empty());
    }
}
