//! Where file data ended up on disk.

use std::sync::{Condvar, Mutex, PoisonError};

use zerocopy::little_endian::{U32, U64};
use zerocopy::IntoBytes;

use crate::error::{ImageError, Result};
use crate::format::disk::FragmentRecord;
use crate::format::DATA_UNCOMPRESSED_BIT;

/// Placement of a file's full-size blocks: the offset of the first block and
/// the size field of every block, in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub start_block: u64,
    pub sizes: Vec<u32>,
}

impl BlockReport {
    /// Record one written block.
    pub fn push(&mut self, start: u64, size_field: u32) {
        if self.sizes.is_empty() {
            self.start_block = start;
        }
        self.sizes.push(size_field);
    }

    /// Bytes the blocks occupy on disk.
    pub fn range_len(&self) -> u64 {
        self.sizes
            .iter()
            .map(|s| u64::from(s & !DATA_UNCOMPRESSED_BIT))
            .sum()
    }

    pub fn same_shape(&self, other: &BlockReport) -> bool {
        self.sizes == other.sizes
    }
}

/// Position of a file tail inside a fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentLocation {
    pub index: u32,
    pub offset: u32,
}

/// One fragment table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start_block: u64,
    /// Stored size with bit 24 set when the fragment is uncompressed.
    pub size: u32,
}

impl FragmentEntry {
    pub const ENCODED_LEN: usize = std::mem::size_of::<FragmentRecord>();

    pub fn stored_len(&self) -> usize {
        (self.size & !DATA_UNCOMPRESSED_BIT) as usize
    }

    pub fn is_compressed(&self) -> bool {
        self.size & DATA_UNCOMPRESSED_BIT == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        FragmentRecord {
            start_block: U64::new(self.start_block),
            size: U32::new(self.size),
            unused: U32::new(0),
        }
        .as_bytes()
        .to_vec()
    }
}

/// Append-only fragment table shared between the ingest thread and the
/// writer.
///
/// Entries are pushed in fragment-number order once their bytes are on
/// disk. Readers that need a fragment which is still in flight block in
/// [`FragmentTable::wait_for`].
#[derive(Debug, Default)]
pub struct FragmentTable {
    state: Mutex<FragmentState>,
    written: Condvar,
}

#[derive(Debug, Default)]
struct FragmentState {
    entries: Vec<FragmentEntry>,
    failed: Option<String>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the next entry, returning its fragment number.
    pub fn push(&self, entry: FragmentEntry) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.push(entry);
        let index = (state.entries.len() - 1) as u32;
        self.written.notify_all();
        index
    }

    /// Block until fragment `index` is written or the writer has failed.
    pub fn wait_for(&self, index: u32) -> Result<FragmentEntry> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(entry) = state.entries.get(index as usize) {
                return Ok(*entry);
            }
            if let Some(msg) = &state.failed {
                return Err(ImageError::WorkerFailed(msg.clone()));
            }
            state = self
                .written
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake every waiter with a failure.
    pub fn fail(&self, msg: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.failed.is_none() {
            state.failed = Some(msg.to_string());
        }
        self.written.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries. Only meaningful once the writer has drained.
    pub fn entries(&self) -> Vec<FragmentEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_report_keeps_first_start() {
        let mut report = BlockReport::default();
        report.push(96, 100);
        report.push(196, 50 | DATA_UNCOMPRESSED_BIT);
        assert_eq!(report.start_block, 96);
        assert_eq!(report.sizes, vec![100, 50 | DATA_UNCOMPRESSED_BIT]);
        assert_eq!(report.range_len(), 150);
    }

    #[test]
    fn test_fragment_entry_layout() {
        let entry = FragmentEntry {
            start_block: 0x0102_0304_0506_0708,
            size: 10 | DATA_UNCOMPRESSED_BIT,
        };
        let bytes = entry.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &(10 | DATA_UNCOMPRESSED_BIT).to_le_bytes());
        assert_eq!(&bytes[12..], &[0, 0, 0, 0]);
        assert_eq!(entry.stored_len(), 10);
        assert!(!entry.is_compressed());
    }

    #[test]
    fn test_wait_for_unblocks_on_push() {
        let table = Arc::new(FragmentTable::new());
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.wait_for(1))
        };
        thread::sleep(Duration::from_millis(20));
        table.push(FragmentEntry {
            start_block: 96,
            size: 5,
        });
        table.push(FragmentEntry {
            start_block: 101,
            size: 7,
        });
        let entry = waiter.join().unwrap().unwrap();
        assert_eq!(entry.start_block, 101);
    }

    #[test]
    fn test_wait_for_unblocks_on_failure() {
        let table = Arc::new(FragmentTable::new());
        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.wait_for(0))
        };
        thread::sleep(Duration::from_millis(20));
        table.fail("compression failed");
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("compression failed"));
    }
}
