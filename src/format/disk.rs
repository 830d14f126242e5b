//! Fixed-layout on-disk records.
//!
//! Variable-length records (inodes, directory entry names) are assembled with
//! [`ByteEncoder`](super::ByteEncoder); these have a fixed size and are
//! written as their bytes directly.

use zerocopy::little_endian::{I16, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The 96-byte superblock.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SuperblockRecord {
    pub magic: U32,
    pub inode_count: U32,
    pub mkfs_time: U32,
    pub block_size: U32,
    pub fragment_count: U32,
    pub compression_id: U16,
    pub block_log: U16,
    pub flags: U16,
    pub id_count: U16,
    pub version_major: U16,
    pub version_minor: U16,
    pub root_inode: U64,
    pub bytes_used: U64,
    pub id_table_start: U64,
    pub xattr_table_start: U64,
    pub inode_table_start: U64,
    pub directory_table_start: U64,
    pub fragment_table_start: U64,
    pub lookup_table_start: U64,
}

/// One fragment table entry.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FragmentRecord {
    pub start_block: U64,
    pub size: U32,
    pub unused: U32,
}

/// Header opening a directory listing segment.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirHeaderRecord {
    /// Entries in the segment, minus one.
    pub count: U32,
    pub start_block: U32,
    pub inode_number: U32,
}

/// Fixed part of a directory entry; the name follows it.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirEntryRecord {
    pub offset: U16,
    pub inode_delta: I16,
    pub inode_type: U16,
    /// Name length minus one.
    pub name_size: U16,
}
