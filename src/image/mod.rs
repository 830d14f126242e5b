//! Image writer and superblock assembly.
//!
//! [`ImageWriter`] owns the output file for the whole build and moves through
//! a fixed sequence of phases:
//!
//! ```text
//! Ingesting -> FinishingData -> WritingTables -> WritingHeader -> Closed
//! ```
//!
//! While ingesting, entries are inserted into the tree and file data streams
//! through the [`DataWriter`]. [`ImageWriter::finish`] then drains all data
//! work, serializes the tree, appends the inode, directory, fragment and id
//! tables in that order, pads the file to 4 KiB and writes the superblock at
//! offset 0.
//!
//! Any error moves the writer to `Failed`; the output is then unusable and
//! must be removed by the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! let file = File::options().read(true).write(true).create_new(true).open("out.sqfs")?;
//! let mut image = ImageWriter::new(file, ImageOptions::default())?;
//! image.add_directory(b"etc", InodeMetadata::new(0o755, 0, 0, 0))?;
//! image.add_regular_file(b"etc/hostname", meta, &mut &b"box\n"[..], 4)?;
//! let summary = image.finish()?;
//! ```

mod superblock;
mod tables;

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use serde::Serialize;

use crate::compress::{CompressorKind, Compressor};
use crate::data::{DataOptions, DataWriter, Threading};
use crate::error::{display_path, ImageError, Result};
use crate::format::{
    BLOCK_LOG_DEFAULT, BLOCK_LOG_MAX, BLOCK_LOG_MIN, PAD_SIZE, SUPERBLOCK_SIZE,
};
use crate::metadata::MetadataWriter;
use crate::tree::serialize::TableSerializer;
use crate::tree::{
    DeviceKind, DeviceNode, Directory, InodeCounter, InodeMetadata, IpcKind, IpcNode, Node,
    RegularFile, Symlink,
};

pub use superblock::Superblock;
pub use tables::{write_indexed_table, IdTable};

/// Knobs for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOptions {
    /// log2 of the data block size.
    pub block_log: u16,
    pub compressor: CompressorKind,
    /// `None` uses the compressor's default level.
    pub compression_level: Option<i32>,
    pub threading: Threading,
    pub dedup: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            block_log: BLOCK_LOG_DEFAULT,
            compressor: CompressorKind::default(),
            compression_level: None,
            threading: Threading::default(),
            dedup: true,
        }
    }
}

impl ImageOptions {
    pub fn block_size(&self) -> usize {
        1 << self.block_log
    }

    pub fn validate(&self) -> Result<()> {
        if !(BLOCK_LOG_MIN..=BLOCK_LOG_MAX).contains(&self.block_log) {
            return Err(ImageError::InvalidOption(format!(
                "block_log {} out of range {}-{}",
                self.block_log, BLOCK_LOG_MIN, BLOCK_LOG_MAX
            )));
        }
        Ok(())
    }
}

/// Where the writer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ingesting,
    FinishingData,
    WritingTables,
    WritingHeader,
    Closed,
    Failed,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Ingesting => "ingesting",
            Phase::FinishingData => "finishing data",
            Phase::WritingTables => "writing tables",
            Phase::WritingHeader => "writing the superblock",
            Phase::Closed => "closed",
            Phase::Failed => "failed",
        }
    }
}

/// What a finished build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub inode_count: u32,
    pub fragment_count: u32,
    pub id_count: u16,
    pub block_size: u32,
    pub compressor: String,
    pub bytes_used: u64,
    pub image_size: u64,
    pub data_blocks: u64,
    pub deduplicated_files: u64,
    pub deduplicated_fragments: u64,
}

pub struct ImageWriter {
    phase: Phase,
    options: ImageOptions,
    compressor: Arc<dyn Compressor>,
    counter: InodeCounter,
    root: Directory,
    data: Option<DataWriter>,
}

impl ImageWriter {
    /// Start an image in `file`, which must be open for reading and writing.
    /// Anything already in the file is discarded.
    pub fn new(mut file: File, options: ImageOptions) -> Result<Self> {
        options.validate()?;
        let compressor = options.compressor.build(options.compression_level)?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&[0u8; SUPERBLOCK_SIZE])?;

        let data = DataWriter::new(
            file,
            SUPERBLOCK_SIZE as u64,
            DataOptions {
                block_size: options.block_size(),
                compressor: Arc::clone(&compressor),
                threading: options.threading,
                dedup: options.dedup,
            },
        )?;

        let mut counter = InodeCounter::new();
        let root = Directory::new(counter.allocate(), InodeMetadata::IMPLICIT_DIRECTORY);

        Ok(Self {
            phase: Phase::Ingesting,
            options,
            compressor,
            counter,
            root,
            data: Some(data),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn options(&self) -> &ImageOptions {
        &self.options
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    fn guarded<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.phase != Phase::Ingesting {
            return Err(ImageError::InvalidState {
                operation,
                phase: self.phase.name(),
            });
        }
        let result = f(self);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    /// Create or update the directory at `path`. A root-only path updates
    /// the root's metadata.
    pub fn add_directory(&mut self, path: &[u8], meta: InodeMetadata) -> Result<()> {
        self.guarded("add directory", |w| {
            let dir = w.root.insert_or_get_directory(path, &mut w.counter)?;
            dir.common.meta = meta;
            log::trace!("dir  {}", display_path(path));
            Ok(())
        })
    }

    /// Add a regular file whose content is the next `size` bytes of
    /// `reader`.
    pub fn add_regular_file(
        &mut self,
        path: &[u8],
        meta: InodeMetadata,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        self.guarded("add regular file", |w| {
            crate::tree::path_components(path)?;
            let data = w.data.as_mut().ok_or(ImageError::InvalidState {
                operation: "add regular file",
                phase: "without a data writer",
            })?;

            let mut file = RegularFile::new(w.counter.allocate(), meta);
            let mut buf = vec![0u8; data.block_size()];
            let mut remaining = size;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = match reader.read(&mut buf[..want]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                if n == 0 {
                    return Err(ImageError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!(
                            "'{}': expected {} bytes, stream ended after {}",
                            display_path(path),
                            size,
                            size - remaining
                        ),
                    )));
                }
                data.append(&mut file, &buf[..n])?;
                remaining -= n as u64;
            }
            data.finish_file(&mut file)?;

            log::trace!("file {} ({} bytes)", display_path(path), size);
            w.root
                .insert_file(path, Node::RegularFile(file), &mut w.counter)
        })
    }

    pub fn add_symlink(&mut self, path: &[u8], meta: InodeMetadata, target: &[u8]) -> Result<()> {
        self.guarded("add symlink", |w| {
            let node = Symlink::new(w.counter.allocate(), meta, target.to_vec());
            log::trace!("link {} -> {}", display_path(path), display_path(target));
            w.root
                .insert_file(path, Node::Symlink(node), &mut w.counter)
        })
    }

    pub fn add_device(
        &mut self,
        path: &[u8],
        meta: InodeMetadata,
        kind: DeviceKind,
        rdev: u32,
    ) -> Result<()> {
        self.guarded("add device", |w| {
            let node = DeviceNode::new(w.counter.allocate(), meta, kind, rdev);
            log::trace!("dev  {} ({:?} {:#x})", display_path(path), kind, rdev);
            w.root.insert_file(path, Node::Device(node), &mut w.counter)
        })
    }

    pub fn add_ipc(&mut self, path: &[u8], meta: InodeMetadata, kind: IpcKind) -> Result<()> {
        self.guarded("add ipc node", |w| {
            let node = IpcNode::new(w.counter.allocate(), meta, kind);
            log::trace!("ipc  {} ({:?})", display_path(path), kind);
            w.root.insert_file(path, Node::Ipc(node), &mut w.counter)
        })
    }

    /// Settle all data, write the tables and the superblock.
    pub fn finish(mut self) -> Result<ImageSummary> {
        if self.phase != Phase::Ingesting {
            return Err(ImageError::InvalidState {
                operation: "finish image",
                phase: self.phase.name(),
            });
        }
        let result = self.write_out();
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn write_out(&mut self) -> Result<ImageSummary> {
        self.phase = Phase::FinishingData;
        let data = self.data.take().ok_or(ImageError::InvalidState {
            operation: "finish image",
            phase: "without a data writer",
        })?;
        let data = data.finish()?;
        let mut out = data.file;
        let mut pos = data.cursor;

        self.phase = Phase::WritingTables;
        let mut inodes = MetadataWriter::new(Arc::clone(&self.compressor));
        let mut directories = MetadataWriter::new(Arc::clone(&self.compressor));
        let mut ids = IdTable::default();
        let root_inode = TableSerializer {
            inodes: &mut inodes,
            directories: &mut directories,
            ids: &mut ids,
            reports: &data.reports,
        }
        .write_tree(&mut self.root, self.counter.peek())?;
        inodes.write_block_no_pad()?;
        directories.write_block_no_pad()?;

        let mut sb = Superblock::new(self.options.compressor, self.options.block_log);
        sb.inode_count = self.counter.allocated();
        sb.fragment_count = data.fragments.len() as u32;
        sb.id_count = u16::try_from(ids.len())
            .map_err(|_| ImageError::TooManyIds { count: ids.len() })?;
        sb.root_inode = root_inode.to_inode_ref();

        out.seek(SeekFrom::Start(pos))?;
        sb.inode_table_start = pos;
        pos += inodes.write_to(&mut out)?;
        sb.directory_table_start = pos;
        pos += directories.write_to(&mut out)?;
        sb.fragment_table_start = write_indexed_table(
            &mut out,
            &mut pos,
            &self.compressor,
            crate::data::FragmentEntry::ENCODED_LEN,
            data.fragments.iter().map(|f| f.encode()),
        )?;
        sb.id_table_start = write_indexed_table(
            &mut out,
            &mut pos,
            &self.compressor,
            4,
            ids.ids().iter().map(|id| id.to_le_bytes().to_vec()),
        )?;
        sb.bytes_used = pos;
        log::debug!(
            "tables: inode {} directory {} fragment {} id {} end {}",
            sb.inode_table_start,
            sb.directory_table_start,
            sb.fragment_table_start,
            sb.id_table_start,
            sb.bytes_used
        );

        self.phase = Phase::WritingHeader;
        let image_size = pos.div_ceil(PAD_SIZE) * PAD_SIZE;
        if image_size > pos {
            out.write_all(&vec![0u8; (image_size - pos) as usize])?;
        }
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&sb.encode())?;
        out.flush()?;
        out.sync_all()?;

        self.phase = Phase::Closed;
        Ok(ImageSummary {
            inode_count: sb.inode_count,
            fragment_count: sb.fragment_count,
            id_count: sb.id_count,
            block_size: sb.block_size,
            compressor: self.options.compressor.name().to_string(),
            bytes_used: sb.bytes_used,
            image_size,
            data_blocks: data.stats.blocks_written,
            deduplicated_files: data.stats.deduplicated_files,
            deduplicated_fragments: data.stats.deduplicated_fragments,
        })
    }
}

impl std::fmt::Debug for ImageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWriter")
            .field("phase", &self.phase)
            .field("options", &self.options)
            .field("inodes", &self.counter.allocated())
            .finish()
    }
}
