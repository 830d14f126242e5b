//! Live directory source.

use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use super::{EntryKind, EntryMetadata, EntryPayload, EntrySource, SourceEntry};
use crate::format::{encode_rdev, split_dev_t};

/// Walks a directory without following symlinks, siblings in byte order.
/// The walk root itself is reported with an empty path so its permissions
/// and owner land on the image root.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn kind_of(ft: fs::FileType) -> EntryKind {
    if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_file() {
        EntryKind::RegularFile
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_block_device() {
        EntryKind::BlockDevice
    } else if ft.is_char_device() {
        EntryKind::CharDevice
    } else if ft.is_socket() {
        EntryKind::Socket
    } else if ft.is_fifo() {
        EntryKind::Fifo
    } else {
        EntryKind::Unsupported("unknown file type".to_string())
    }
}

fn metadata_of(md: &fs::Metadata) -> EntryMetadata {
    let mtime = md.mtime().clamp(0, i64::from(u32::MAX)) as u32;
    EntryMetadata::new(md.mode(), md.uid(), md.gid(), mtime)
}

impl EntrySource for DirectorySource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn visit(&mut self, f: &mut dyn FnMut(SourceEntry<'_>) -> Result<()>) -> Result<()> {
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();

        for ent in walker {
            let ent = ent.with_context(|| format!("Failed to walk {}", self.root.display()))?;
            let p = ent.path();
            let rel = p.strip_prefix(&self.root).unwrap_or(p);
            let path = rel.as_os_str().as_bytes().to_vec();

            let md = ent
                .metadata()
                .with_context(|| format!("Failed to stat {}", p.display()))?;
            let kind = kind_of(md.file_type());
            let metadata = metadata_of(&md);

            let mut file;
            let payload = match kind {
                EntryKind::RegularFile => {
                    file = File::open(p).with_context(|| format!("Failed to open {}", p.display()))?;
                    EntryPayload::Data {
                        reader: &mut file,
                        size: md.len(),
                    }
                }
                EntryKind::Symlink => {
                    let target = fs::read_link(p)
                        .with_context(|| format!("Failed to read link {}", p.display()))?;
                    EntryPayload::Target(target.as_os_str().as_bytes().to_vec())
                }
                EntryKind::BlockDevice | EntryKind::CharDevice => {
                    let (major, minor) = split_dev_t(md.rdev());
                    EntryPayload::Device {
                        rdev: encode_rdev(major, minor),
                    }
                }
                _ => EntryPayload::None,
            };

            f(SourceEntry {
                path,
                kind,
                metadata,
                payload,
            })?;
        }
        Ok(())
    }
}
