//! Squashfs image builder.
//!
//! Drives an [`ImageWriter`] from an [`EntrySource`] and owns the output
//! path: the destination must not exist, the image is built in a partial
//! sibling file, and only a complete image is moved into place.

use anyhow::{bail, Context, Result};
use std::path::Path;

use super::filesystem::{ensure_absent, PartialFile};
use crate::error::{display_path, ImageError};
use crate::image::{ImageOptions, ImageSummary, ImageWriter};
use crate::source::{strip_components, EntryKind, EntryPayload, EntrySource, SourceEntry};
use crate::tree::{DeviceKind, IpcKind};

/// Options for building a squashfs image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SquashfsOptions {
    pub image: ImageOptions,
    /// Leading path components removed from every entry.
    pub strip: usize,
    /// Skip entries the image cannot hold instead of failing.
    pub lenient: bool,
}

/// Build a squashfs image at `output` from every entry of `source`.
///
/// # Example
///
/// ```rust,ignore
/// use sqfs_builder::artifact::squashfs::{build_squashfs, SquashfsOptions};
/// use sqfs_builder::source::DirectorySource;
/// use std::path::Path;
///
/// let mut source = DirectorySource::new("staging/");
/// build_squashfs(
///     &mut source,
///     Path::new("output/filesystem.squashfs"),
///     &SquashfsOptions::default(),
/// )?;
/// ```
pub fn build_squashfs(
    source: &mut dyn EntrySource,
    output: &Path,
    options: &SquashfsOptions,
) -> Result<ImageSummary> {
    ensure_absent(output)?;
    let origin = source.describe();
    let (partial, file) = PartialFile::create(output)?;

    log::info!(
        "building {} from {} ({}, {} byte blocks, {:?})",
        output.display(),
        origin,
        options.image.compressor,
        options.image.block_size(),
        options.image.threading
    );

    let mut writer = ImageWriter::new(file, options.image.clone())
        .with_context(|| format!("Failed to start image {}", partial.path().display()))?;
    source
        .visit(&mut |entry| ingest_entry(&mut writer, entry, options))
        .with_context(|| format!("reading entries from {origin}"))?;
    let summary = writer
        .finish()
        .with_context(|| format!("Failed to finish image {}", partial.path().display()))?;

    partial.publish(output)?;
    log::info!(
        "wrote {}: {} inodes, {} fragments, {} bytes ({} files deduplicated)",
        output.display(),
        summary.inode_count,
        summary.fragment_count,
        summary.image_size,
        summary.deduplicated_files + summary.deduplicated_fragments
    );
    Ok(summary)
}

fn ingest_entry(
    writer: &mut ImageWriter,
    entry: SourceEntry<'_>,
    options: &SquashfsOptions,
) -> Result<()> {
    let path = strip_components(&entry.path, options.strip);
    let meta = entry.metadata;
    let shown = display_path(path);

    let result = match (entry.kind, entry.payload) {
        (EntryKind::Directory, _) => writer.add_directory(path, meta),
        (EntryKind::RegularFile, EntryPayload::Data { reader, size }) => {
            writer.add_regular_file(path, meta, reader, size)
        }
        (EntryKind::Symlink, EntryPayload::Target(target)) => {
            writer.add_symlink(path, meta, &target)
        }
        (EntryKind::BlockDevice, EntryPayload::Device { rdev }) => {
            writer.add_device(path, meta, DeviceKind::Block, rdev)
        }
        (EntryKind::CharDevice, EntryPayload::Device { rdev }) => {
            writer.add_device(path, meta, DeviceKind::Char, rdev)
        }
        (EntryKind::Socket, _) => writer.add_ipc(path, meta, IpcKind::Socket),
        (EntryKind::Fifo, _) => writer.add_ipc(path, meta, IpcKind::Fifo),
        (EntryKind::Unsupported(kind), _) if options.lenient => {
            log::warn!("skipping '{shown}': unsupported {kind}");
            return Ok(());
        }
        (EntryKind::Unsupported(kind), _) => Err(ImageError::UnsupportedEntry {
            path: shown.clone(),
            kind,
        }),
        (kind, payload) => bail!("'{shown}': {} entry came with {payload:?}", kind.name()),
    };
    result.with_context(|| format!("adding '{shown}'"))
}
