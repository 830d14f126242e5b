//! Fragment and data block manager.
//!
//! File contents arrive as an append stream per file. Full blocks go to the
//! write pipeline as soon as they fill. When a file ends, its remainder is
//! either packed into the shared fragment buffer (only for files that never
//! filled a block) or written as a short final block.
//!
//! # Deduplication
//!
//! Both tails and whole block runs are deduplicated with a checksum
//! pre-filter followed by an exact byte comparison, so a checksum collision
//! can never alias different content.
//!
//! - Tails: a digest index maps to earlier tails of the same length. A
//!   candidate still in the open fragment buffer is compared in memory; one
//!   already flushed is read back from the output and decompressed.
//! - Blocks: after a file's last block, a dedup job runs on the writer in
//!   sequence order and compares the just-written range against earlier
//!   files with the same size list.

mod pipeline;
mod queue;
mod report;

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::compress::Compressor;
use crate::error::Result;
use crate::tree::RegularFile;

use pipeline::{checksum, Digest, Job, JobKind, OutputState, Pipeline};

pub use pipeline::{DataStats, Threading};
pub use queue::BoundedWorkQueue;
pub use report::{BlockReport, FragmentEntry, FragmentLocation, FragmentTable};

/// Settings for a [`DataWriter`].
#[derive(Debug, Clone)]
pub struct DataOptions {
    pub block_size: usize,
    pub compressor: Arc<dyn Compressor>,
    pub threading: Threading,
    pub dedup: bool,
}

/// Everything the table writer needs once data is settled.
#[derive(Debug)]
pub struct DataOutput {
    pub file: File,
    /// First byte after the data region.
    pub cursor: u64,
    pub reports: HashMap<u32, BlockReport>,
    pub fragments: Vec<FragmentEntry>,
    pub stats: DataStats,
}

#[derive(Debug, Clone, Copy)]
struct TailCandidate {
    location: FragmentLocation,
    len: usize,
}

pub struct DataWriter {
    block_size: usize,
    compressor: Arc<dyn Compressor>,
    dedup: bool,
    pipeline: Pipeline,
    reader: File,
    fragments: Arc<FragmentTable>,
    next_seq: u64,

    // current file
    block: Vec<u8>,
    hasher: XxHash64,

    fragment_buffer: Vec<u8>,
    fragments_submitted: u32,
    tail_index: HashMap<Digest, Vec<TailCandidate>>,
    fragment_cache: Option<(u32, Vec<u8>)>,
    deduplicated_fragments: u64,
}

impl DataWriter {
    /// Start writing data to `file` at byte `cursor`.
    pub fn new(file: File, cursor: u64, options: DataOptions) -> Result<Self> {
        let reader = file.try_clone()?;
        let fragments = Arc::new(FragmentTable::new());
        let state = OutputState::new(file, cursor, Arc::clone(&fragments));
        let pipeline = Pipeline::start(options.threading, Arc::clone(&options.compressor), state)?;

        Ok(Self {
            block_size: options.block_size,
            compressor: options.compressor,
            dedup: options.dedup,
            pipeline,
            reader,
            fragments,
            next_seq: 0,
            block: Vec::with_capacity(options.block_size),
            hasher: XxHash64::with_seed(0),
            fragment_buffer: Vec::with_capacity(options.block_size),
            fragments_submitted: 0,
            tail_index: HashMap::new(),
            fragment_cache: None,
            deduplicated_fragments: 0,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Append bytes to `file`.
    pub fn append(&mut self, file: &mut RegularFile, mut bytes: &[u8]) -> Result<()> {
        file.file_size += bytes.len() as u64;
        if self.dedup {
            self.hasher.write(bytes);
        }

        while !bytes.is_empty() {
            let room = self.block_size - self.block.len();
            let take = room.min(bytes.len());
            self.block.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.block.len() == self.block_size {
                self.submit_block(file)?;
            }
        }
        Ok(())
    }

    /// Close `file`: place its remainder and queue block deduplication.
    pub fn finish_file(&mut self, file: &mut RegularFile) -> Result<()> {
        if !self.block.is_empty() {
            if file.block_count == 0 {
                let tail = std::mem::replace(&mut self.block, Vec::with_capacity(self.block_size));
                self.put_tail(file, tail)?;
            } else {
                self.submit_block(file)?;
            }
        }

        let hasher = std::mem::replace(&mut self.hasher, XxHash64::with_seed(0));
        if self.dedup && file.block_count > 0 {
            let digest = hasher.finish();
            self.submit(
                JobKind::Dedup {
                    inode: file.common.inode_number,
                    digest,
                },
                Vec::new(),
            )?;
        }
        Ok(())
    }

    fn submit_block(&mut self, file: &mut RegularFile) -> Result<()> {
        let payload = std::mem::replace(&mut self.block, Vec::with_capacity(self.block_size));
        file.block_count += 1;
        self.submit(
            JobKind::Block {
                inode: file.common.inode_number,
            },
            payload,
        )
    }

    fn submit(&mut self, kind: JobKind, payload: Vec<u8>) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pipeline.submit(Job { seq, kind, payload })
    }

    fn put_tail(&mut self, file: &mut RegularFile, tail: Vec<u8>) -> Result<()> {
        let digest: Option<Digest> = self.dedup.then(|| checksum(&tail));

        if let Some(digest) = &digest {
            if let Some(location) = self.find_tail(digest, &tail)? {
                log::debug!(
                    "inode {} tail duplicates fragment {}+{}",
                    file.common.inode_number,
                    location.index,
                    location.offset
                );
                file.fragment = Some(location);
                self.deduplicated_fragments += 1;
                return Ok(());
            }
        }

        if self.fragment_buffer.len() + tail.len() > self.block_size {
            self.flush_fragment()?;
        }

        let location = FragmentLocation {
            index: self.fragments_submitted,
            offset: self.fragment_buffer.len() as u32,
        };
        self.fragment_buffer.extend_from_slice(&tail);
        file.fragment = Some(location);

        if let Some(digest) = digest {
            self.tail_index
                .entry(digest)
                .or_default()
                .push(TailCandidate {
                    location,
                    len: tail.len(),
                });
        }
        Ok(())
    }

    fn find_tail(&mut self, digest: &Digest, tail: &[u8]) -> Result<Option<FragmentLocation>> {
        let candidates = match self.tail_index.get(digest) {
            Some(c) => c.clone(),
            None => return Ok(None),
        };

        for candidate in candidates {
            if candidate.len != tail.len() {
                continue;
            }
            let start = candidate.location.offset as usize;
            let end = start + candidate.len;

            let equal = if candidate.location.index == self.fragments_submitted {
                self.fragment_buffer.get(start..end) == Some(tail)
            } else {
                let data = self.fetch_fragment(candidate.location.index)?;
                data.get(start..end) == Some(tail)
            };
            if equal {
                return Ok(Some(candidate.location));
            }
        }
        Ok(None)
    }

    /// Decompressed contents of a flushed fragment, waiting for it to be
    /// written if necessary.
    fn fetch_fragment(&mut self, index: u32) -> Result<&[u8]> {
        let cached = matches!(&self.fragment_cache, Some((i, _)) if *i == index);
        if !cached {
            let entry = self.fragments.wait_for(index)?;
            let mut stored = vec![0u8; entry.stored_len()];
            self.reader.read_exact_at(&mut stored, entry.start_block)?;
            let data =
                self.compressor
                    .decompress(&stored, entry.is_compressed(), self.block_size)?;
            self.fragment_cache = Some((index, data));
        }
        Ok(self
            .fragment_cache
            .as_ref()
            .map(|(_, data)| data.as_slice())
            .unwrap_or_default())
    }

    /// Close the open fragment block and queue it for writing.
    pub fn flush_fragment(&mut self) -> Result<()> {
        if self.fragment_buffer.is_empty() {
            return Ok(());
        }
        let index = self.fragments_submitted;
        self.fragments_submitted += 1;
        let payload = std::mem::replace(
            &mut self.fragment_buffer,
            Vec::with_capacity(self.block_size),
        );
        log::debug!("flushing fragment {} ({} bytes)", index, payload.len());
        self.submit(JobKind::Fragment { index }, payload)
    }

    /// Flush the last fragment, wait for every job, and hand back the
    /// output file with the final reports.
    pub fn finish(mut self) -> Result<DataOutput> {
        self.flush_fragment()?;
        let Self {
            pipeline,
            fragments,
            deduplicated_fragments,
            ..
        } = self;

        let state = pipeline.finish()?;
        let (file, cursor, reports, mut stats) = state.into_parts();
        stats.deduplicated_fragments = deduplicated_fragments;

        Ok(DataOutput {
            file,
            cursor,
            reports,
            fragments: fragments.entries(),
            stats,
        })
    }
}

impl std::fmt::Debug for DataWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWriter")
            .field("block_size", &self.block_size)
            .field("dedup", &self.dedup)
            .field("next_seq", &self.next_seq)
            .field("fragments_submitted", &self.fragments_submitted)
            .field("fragment_buffer", &self.fragment_buffer.len())
            .finish()
    }
}
