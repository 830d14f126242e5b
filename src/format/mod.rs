//! SquashFS 4.0 on-disk constants and small shared types.

pub mod disk;
pub mod encode;

pub use encode::ByteEncoder;

pub const SQFS_MAGIC: u32 = 0x7371_7368;
pub const SQFS_MAJOR: u16 = 4;
pub const SQFS_MINOR: u16 = 0;

/// Size of the superblock at offset 0.
pub const SUPERBLOCK_SIZE: usize = 96;

/// The finished image is padded to this boundary.
pub const PAD_SIZE: u64 = 0x1000;

/// Uncompressed size of a metadata block.
pub const META_BLOCK_SIZE: usize = 0x2000;
pub const META_BLOCK_SIZE_LOG: u32 = 13;

/// Bit 15 of a metadata block header: block is stored uncompressed.
pub const META_UNCOMPRESSED_BIT: u16 = 0x8000;

/// Bit 24 of a data block or fragment size: block is stored uncompressed.
pub const DATA_UNCOMPRESSED_BIT: u32 = 0x0100_0000;

pub const BLOCK_LOG_DEFAULT: u16 = 17;
pub const BLOCK_LOG_MIN: u16 = 12;
pub const BLOCK_LOG_MAX: u16 = 20;

/// "No xattr" sentinel in inodes.
pub const XATTR_NONE: u32 = 0xffff_ffff;

/// "No fragment" sentinel in regular file inodes.
pub const FRAGMENT_NONE: u32 = 0xffff_ffff;

/// Table start value for tables that are not present.
pub const TABLE_ABSENT: u64 = 0xffff_ffff_ffff_ffff;

/// Longest name a directory entry can carry.
pub const NAME_MAX: usize = 0xff;

/// Most entries a single directory header may cover.
pub const DIR_SEGMENT_MAX: usize = 256;

/// Superblock flag bits.
pub const FLAG_UNCOMPRESSED_INODES: u16 = 0x0001;
pub const FLAG_UNCOMPRESSED_DATA: u16 = 0x0002;
pub const FLAG_UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
pub const FLAG_UNCOMPRESSED_IDS: u16 = 0x0800;

/// Inode type. The discriminant is the basic on-disk code; the extended
/// code is always `basic + 7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum InodeType {
    Directory = 1,
    RegularFile = 2,
    Symlink = 3,
    BlockDevice = 4,
    CharDevice = 5,
    Fifo = 6,
    Socket = 7,
}

impl InodeType {
    pub fn basic(self) -> u16 {
        self as u16
    }

    pub fn extended(self) -> u16 {
        self as u16 + 7
    }

    pub fn is_directory(self) -> bool {
        self == InodeType::Directory
    }

    pub fn name(self) -> &'static str {
        match self {
            InodeType::Directory => "directory",
            InodeType::RegularFile => "regular file",
            InodeType::Symlink => "symlink",
            InodeType::BlockDevice => "block device",
            InodeType::CharDevice => "character device",
            InodeType::Fifo => "fifo",
            InodeType::Socket => "socket",
        }
    }
}

/// Location of a record inside a metadata table.
///
/// `block` is the byte offset of the metadata block header from the start of
/// its table; `offset` is the position inside the uncompressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MetaAddress {
    pub block: u32,
    pub offset: u16,
}

impl MetaAddress {
    pub fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }

    /// Packed inode reference as stored in the superblock.
    pub fn to_inode_ref(self) -> u64 {
        (u64::from(self.block) << 16) | u64::from(self.offset)
    }
}

/// Pack a device number the way the Linux kernel's `new_encode_dev` does.
pub fn encode_rdev(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
}

/// Split a glibc `dev_t` into major and minor.
pub fn split_dev_t(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    (major as u32, minor as u32)
}
