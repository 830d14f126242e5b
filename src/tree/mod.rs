//! In-memory directory tree.
//!
//! The tree is built once while entries are ingested and only ever grows:
//! paths are inserted, never removed. A later entry for an existing path
//! replaces the earlier one in place (last write wins), the same way a later
//! member of an archive supersedes an earlier one.
//!
//! Every node owns its children outright. Inode numbers come from a single
//! [`InodeCounter`] in allocation order, starting at 1, and are never
//! reused: a replaced node leaves a gap.
//!
//! # Paths
//!
//! Paths are raw bytes split on `/`. Empty and `.` components are skipped,
//! so `a//b/`, `/a/b` and `./a/b` all name the same entry. A path with no
//! components names the root directory itself.

pub mod serialize;

use std::collections::HashMap;

use crate::data::FragmentLocation;
use crate::error::{display_path, ImageError, Result};
use crate::format::{InodeType, MetaAddress, NAME_MAX, XATTR_NONE};

/// POSIX metadata carried by every inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeMetadata {
    /// Permission bits (`0o7777`); the file type comes from the inode type.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

impl InodeMetadata {
    /// Metadata for directories that only exist because a deeper path
    /// needed them.
    pub const IMPLICIT_DIRECTORY: InodeMetadata = InodeMetadata {
        mode: 0o755,
        uid: 0,
        gid: 0,
        mtime: 0,
    };

    pub fn new(mode: u32, uid: u32, gid: u32, mtime: u32) -> Self {
        Self {
            mode: (mode & 0o7777) as u16,
            uid,
            gid,
            mtime,
        }
    }
}

/// Fields shared by every inode variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeCommon {
    pub inode_number: u32,
    pub meta: InodeMetadata,
    pub link_count: u32,
    pub xattr_index: u32,
    /// Set once the inode has been serialized.
    pub inode_address: Option<MetaAddress>,
}

impl InodeCommon {
    pub fn new(inode_number: u32, meta: InodeMetadata) -> Self {
        Self {
            inode_number,
            meta,
            link_count: 1,
            xattr_index: XATTR_NONE,
            inode_address: None,
        }
    }

    pub fn has_xattr(&self) -> bool {
        self.xattr_index != XATTR_NONE
    }
}

/// Hands out inode numbers.
#[derive(Debug, Clone)]
pub struct InodeCounter {
    next: u32,
}

impl Default for InodeCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl InodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> u32 {
        let n = self.next;
        self.next += 1;
        n
    }

    /// The number the next allocation would return.
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// How many numbers have been handed out.
    pub fn allocated(&self) -> u32 {
        self.next - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub common: InodeCommon,
    entries: Vec<(Vec<u8>, Node)>,
    index: HashMap<Vec<u8>, usize>,
    /// Serialized listing size plus 3, filled in by the serializer.
    pub table_size: u32,
    pub table_address: Option<MetaAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularFile {
    pub common: InodeCommon,
    pub file_size: u64,
    /// Always 0: holes are not detected.
    pub sparse_bytes: u64,
    /// Full-size or short data blocks queued for this file.
    pub block_count: u32,
    /// Where the tail lives, for files that never filled a block.
    pub fragment: Option<FragmentLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    pub common: InodeCommon,
    pub target: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub common: InodeCommon,
    pub kind: DeviceKind,
    /// Packed major/minor, see [`crate::format::encode_rdev`].
    pub rdev: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    Fifo,
    Socket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcNode {
    pub common: InodeCommon,
    pub kind: IpcKind,
}

/// Any inode in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory(Directory),
    RegularFile(RegularFile),
    Symlink(Symlink),
    Device(DeviceNode),
    Ipc(IpcNode),
}

impl Node {
    pub fn common(&self) -> &InodeCommon {
        match self {
            Node::Directory(d) => &d.common,
            Node::RegularFile(f) => &f.common,
            Node::Symlink(s) => &s.common,
            Node::Device(d) => &d.common,
            Node::Ipc(i) => &i.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut InodeCommon {
        match self {
            Node::Directory(d) => &mut d.common,
            Node::RegularFile(f) => &mut f.common,
            Node::Symlink(s) => &mut s.common,
            Node::Device(d) => &mut d.common,
            Node::Ipc(i) => &mut i.common,
        }
    }

    pub fn metadata(&self) -> InodeMetadata {
        self.common().meta
    }

    pub fn inode_number(&self) -> u32 {
        self.common().inode_number
    }

    pub fn inode_type(&self) -> InodeType {
        match self {
            Node::Directory(_) => InodeType::Directory,
            Node::RegularFile(_) => InodeType::RegularFile,
            Node::Symlink(_) => InodeType::Symlink,
            Node::Device(d) => match d.kind {
                DeviceKind::Block => InodeType::BlockDevice,
                DeviceKind::Char => InodeType::CharDevice,
            },
            Node::Ipc(i) => match i.kind {
                IpcKind::Fifo => InodeType::Fifo,
                IpcKind::Socket => InodeType::Socket,
            },
        }
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match self {
            Node::Directory(d) => Some(d),
            _ => None,
        }
    }
}

impl RegularFile {
    pub fn new(inode_number: u32, meta: InodeMetadata) -> Self {
        Self {
            common: InodeCommon::new(inode_number, meta),
            file_size: 0,
            sparse_bytes: 0,
            block_count: 0,
            fragment: None,
        }
    }
}

impl Symlink {
    pub fn new(inode_number: u32, meta: InodeMetadata, target: Vec<u8>) -> Self {
        Self {
            common: InodeCommon::new(inode_number, meta),
            target,
        }
    }
}

impl DeviceNode {
    pub fn new(inode_number: u32, meta: InodeMetadata, kind: DeviceKind, rdev: u32) -> Self {
        Self {
            common: InodeCommon::new(inode_number, meta),
            kind,
            rdev,
        }
    }
}

impl IpcNode {
    pub fn new(inode_number: u32, meta: InodeMetadata, kind: IpcKind) -> Self {
        Self {
            common: InodeCommon::new(inode_number, meta),
            kind,
        }
    }
}

/// Split `path` into name components.
pub fn path_components(path: &[u8]) -> Result<Vec<&[u8]>> {
    let mut components = Vec::new();
    for name in path.split(|&b| b == b'/') {
        if name.is_empty() || name == b"." {
            continue;
        }
        if name == b".." {
            return Err(ImageError::InvalidPath {
                path: display_path(path),
                reason: "'..' components are not allowed",
            });
        }
        if name.len() > NAME_MAX {
            return Err(ImageError::NameTooLong {
                path: display_path(path),
                len: name.len(),
            });
        }
        components.push(name);
    }
    Ok(components)
}

impl Directory {
    pub fn new(inode_number: u32, meta: InodeMetadata) -> Self {
        Self {
            common: InodeCommon::new(inode_number, meta),
            entries: Vec::new(),
            index: HashMap::new(),
            table_size: 0,
            table_address: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Children in insertion order (name order after serialization).
    pub fn children(&self) -> impl Iterator<Item = (&[u8], &Node)> {
        self.entries.iter().map(|(name, node)| (name.as_slice(), node))
    }

    pub fn child(&self, name: &[u8]) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    /// Find the node at `path`; an empty path yields `None` (the root has
    /// no parent entry).
    pub fn lookup(&self, path: &[u8]) -> Option<&Node> {
        let components = path_components(path).ok()?;
        let (leaf, parents) = components.split_last()?;
        let mut dir = self;
        for name in parents {
            dir = dir.child(name)?.as_directory()?;
        }
        dir.child(leaf)
    }

    /// Return the directory at `path`, creating every missing directory on
    /// the way. Non-directories in the way are replaced.
    pub fn insert_or_get_directory(
        &mut self,
        path: &[u8],
        counter: &mut InodeCounter,
    ) -> Result<&mut Directory> {
        let components = path_components(path)?;
        let mut dir = self;
        for name in components {
            dir = dir.child_directory(name, counter);
        }
        Ok(dir)
    }

    /// Attach `node` at `path`, replacing whatever was there.
    pub fn insert_file(
        &mut self,
        path: &[u8],
        node: Node,
        counter: &mut InodeCounter,
    ) -> Result<()> {
        let components = path_components(path)?;
        let Some((leaf, parents)) = components.split_last() else {
            return Err(ImageError::InvalidPath {
                path: display_path(path),
                reason: "only a directory can replace the root",
            });
        };

        let mut dir = self;
        for name in parents {
            dir = dir.child_directory(name, counter);
        }
        dir.set_child(leaf, node);
        Ok(())
    }

    fn set_child(&mut self, name: &[u8], node: Node) {
        match self.index.get(name) {
            Some(&i) => self.entries[i].1 = node,
            None => {
                self.index.insert(name.to_vec(), self.entries.len());
                self.entries.push((name.to_vec(), node));
            }
        }
    }

    fn child_directory(&mut self, name: &[u8], counter: &mut InodeCounter) -> &mut Directory {
        let is_dir = self
            .child(name)
            .map_or(false, |node| matches!(node, Node::Directory(_)));
        if !is_dir {
            let dir = Directory::new(counter.allocate(), InodeMetadata::IMPLICIT_DIRECTORY);
            self.set_child(name, Node::Directory(dir));
        }

        let slot = self.index[name];
        match &mut self.entries[slot].1 {
            Node::Directory(dir) => dir,
            _ => unreachable!("child was just made a directory"),
        }
    }

    /// Put children in byte-wise name order.
    pub(crate) fn sort_children(&mut self) {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
    }

    pub(crate) fn children_mut(&mut self) -> impl Iterator<Item = (&[u8], &mut Node)> {
        self.entries
            .iter_mut()
            .map(|(name, node)| (name.as_slice(), node))
    }
}
