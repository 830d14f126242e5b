//! Metadata block writer.
//!
//! Small records (inodes, directory entries, id and fragment table entries)
//! are packed into 8 KiB staging blocks. Each full block is compressed on the
//! spot and appended to an in-memory table as `u16 header | bytes`.
//!
//! The address handed back by [`MetadataWriter::put`] depends only on how
//! much has been written so far, so it is valid the moment `put` returns.
//! Records may straddle a block boundary.

use std::io::Write;
use std::sync::Arc;

use crate::compress::Compressor;
use crate::error::Result;
use crate::format::{MetaAddress, META_BLOCK_SIZE};

pub struct MetadataWriter {
    compressor: Arc<dyn Compressor>,
    table: Vec<u8>,
    staging: Vec<u8>,
}

impl MetadataWriter {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self {
            compressor,
            table: Vec::new(),
            staging: Vec::with_capacity(META_BLOCK_SIZE),
        }
    }

    /// Address the next `put` will return.
    pub fn address(&self) -> MetaAddress {
        MetaAddress::new(self.table.len() as u32, self.staging.len() as u16)
    }

    /// Append a record, returning where it starts.
    pub fn put(&mut self, mut record: &[u8]) -> Result<MetaAddress> {
        let addr = self.address();

        while !record.is_empty() {
            let room = META_BLOCK_SIZE - self.staging.len();
            let take = room.min(record.len());
            self.staging.extend_from_slice(&record[..take]);
            if self.staging.len() == META_BLOCK_SIZE {
                self.write_block_no_pad()?;
            }
            record = &record[take..];
        }

        Ok(addr)
    }

    /// Flush a partially filled staging block as-is.
    pub fn write_block_no_pad(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let raw = std::mem::replace(&mut self.staging, Vec::with_capacity(META_BLOCK_SIZE));
        let block = self.compressor.compress(raw)?;
        self.table
            .extend_from_slice(&block.metadata_header().to_le_bytes());
        self.table.extend_from_slice(&block.bytes);
        Ok(())
    }

    /// Zero-fill the staging block to 8 KiB and flush it.
    pub fn write_block(&mut self) -> Result<()> {
        self.staging.resize(META_BLOCK_SIZE, 0);
        self.write_block_no_pad()
    }

    /// Bytes of the finished blocks.
    pub fn table(&self) -> &[u8] {
        &self.table
    }

    /// True when nothing is left in the staging block.
    pub fn is_flushed(&self) -> bool {
        self.staging.is_empty()
    }

    /// Write all finished blocks to `out`, returning the byte count.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<u64> {
        out.write_all(&self.table)?;
        Ok(self.table.len() as u64)
    }
}

impl std::fmt::Debug for MetadataWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataWriter")
            .field("compressor", &self.compressor.kind())
            .field("table_len", &self.table.len())
            .field("staged", &self.staging.len())
            .finish()
    }
}
