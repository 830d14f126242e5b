//! Build SquashFS 4.0 images from a stream of filesystem entries.
//!
//! Entries come from a tar archive or a live directory, are laid into an
//! in-memory tree, and are written out as a read-only image the Linux kernel
//! mounts directly:
//!
//! - **Data path** - file contents are cut into blocks, compressed on a
//!   worker pool and written in submission order; small files share
//!   fragment blocks; identical files are stored once
//! - **Metadata path** - inodes, directory listings and the fragment and
//!   id tables are packed into 8 KiB metadata blocks after all data
//! - **Output policy** - the image is built beside its destination and only
//!   moved into place once complete
//!
//! # Architecture
//!
//! ```text
//! source (tar / directory)
//!     │  SourceEntry
//!     ▼
//! artifact::squashfs::build_squashfs ── strip, lenient, output path
//!     │
//!     ▼
//! image::ImageWriter ─────────────┬── tree::Directory (inode numbers, names)
//!     │                           └── data::DataWriter ── pipeline ── compress
//!     ▼ finish()
//! tree::serialize + metadata::MetadataWriter + image tables + superblock
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sqfs_builder::artifact::squashfs::{build_squashfs, SquashfsOptions};
//! use sqfs_builder::source::TarSource;
//! use std::path::Path;
//!
//! let mut source = TarSource::open(Path::new("rootfs.tar.zst"))?;
//! let summary = build_squashfs(&mut source, Path::new("rootfs.sqfs"), &SquashfsOptions::default())?;
//! println!("{} inodes", summary.inode_count);
//! ```

pub mod artifact;
pub mod compress;
pub mod config;
pub mod data;
pub mod error;
pub mod format;
pub mod image;
pub mod metadata;
pub mod source;
pub mod tree;

#[cfg(test)]
mod testing;

pub use artifact::squashfs::{build_squashfs, SquashfsOptions};
pub use compress::CompressorKind;
pub use data::Threading;
pub use error::ImageError;
pub use image::{ImageOptions, ImageSummary, ImageWriter};
pub use source::{DirectorySource, EntrySource, TarSource};
