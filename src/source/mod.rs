//! Entry sources: where the files going into an image come from.
//!
//! A source hands entries to a callback one at a time, in order. A regular
//! file's data is readable only for the duration of its callback, so the
//! consumer must take everything before returning.
//!
//! Two sources ship with the crate:
//! - [`TarSource`] - a plain, gzip or zstd tar stream (file or stdin)
//! - [`DirectorySource`] - a live directory walked in name order

mod archive;
mod walk;

use std::io::Read;

use anyhow::Result;

pub use crate::tree::InodeMetadata as EntryMetadata;
pub use archive::TarSource;
pub use walk::DirectorySource;

/// File type of a source entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    RegularFile,
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
    /// Something an image cannot hold (hard links, sparse members, ...).
    Unsupported(String),
}

impl EntryKind {
    pub fn name(&self) -> &str {
        match self {
            EntryKind::Directory => "directory",
            EntryKind::RegularFile => "regular file",
            EntryKind::Symlink => "symlink",
            EntryKind::BlockDevice => "block device",
            EntryKind::CharDevice => "character device",
            EntryKind::Socket => "socket",
            EntryKind::Fifo => "fifo",
            EntryKind::Unsupported(kind) => kind,
        }
    }
}

/// Type-specific content of an entry.
pub enum EntryPayload<'a> {
    None,
    /// Exactly `size` bytes of file data.
    Data { reader: &'a mut dyn Read, size: u64 },
    /// Symlink target.
    Target(Vec<u8>),
    /// Packed device number.
    Device { rdev: u32 },
}

impl std::fmt::Debug for EntryPayload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPayload::None => f.write_str("None"),
            EntryPayload::Data { size, .. } => f.debug_struct("Data").field("size", size).finish(),
            EntryPayload::Target(t) => f
                .debug_tuple("Target")
                .field(&String::from_utf8_lossy(t))
                .finish(),
            EntryPayload::Device { rdev } => f.debug_struct("Device").field("rdev", rdev).finish(),
        }
    }
}

#[derive(Debug)]
pub struct SourceEntry<'a> {
    pub path: Vec<u8>,
    pub kind: EntryKind,
    pub metadata: EntryMetadata,
    pub payload: EntryPayload<'a>,
}

pub trait EntrySource {
    /// Human-readable origin, for logs.
    fn describe(&self) -> String;

    /// Feed every entry to `f`, stopping at the first error.
    fn visit(&mut self, f: &mut dyn FnMut(SourceEntry<'_>) -> Result<()>) -> Result<()>;
}

/// Drop up to `n` leading `/`-separated components from `path`.
///
/// Stops early, keeping what is left, when no separator remains.
pub fn strip_components(mut path: &[u8], n: usize) -> &[u8] {
    for _ in 0..n {
        match path.iter().position(|&b| b == b'/') {
            Some(sep) => path = &path[sep + 1..],
            None => break,
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_components() {
        assert_eq!(strip_components(b"pkg-1.0/usr/bin/tool", 1), b"usr/bin/tool");
        assert_eq!(strip_components(b"./pkg/etc", 2), b"etc");
        assert_eq!(strip_components(b"a/b", 0), b"a/b");
        // Runs out of separators: the last component survives.
        assert_eq!(strip_components(b"a/b", 5), b"b");
        assert_eq!(strip_components(b"pkg-1.0/", 1), b"");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntryKind::Fifo.name(), "fifo");
        assert_eq!(EntryKind::Unsupported("hard link".into()).name(), "hard link");
    }
}
