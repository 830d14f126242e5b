//! The fixed 96-byte header at offset 0.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::IntoBytes;

use crate::compress::CompressorKind;
use crate::format::disk::SuperblockRecord;
use crate::format::{
    FLAG_UNCOMPRESSED_DATA, FLAG_UNCOMPRESSED_FRAGMENTS, FLAG_UNCOMPRESSED_IDS,
    FLAG_UNCOMPRESSED_INODES, SQFS_MAGIC, SQFS_MAJOR, SQFS_MINOR, SUPERBLOCK_SIZE, TABLE_ABSENT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inode_count: u32,
    pub mkfs_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compressor: CompressorKind,
    pub block_log: u16,
    pub id_count: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub lookup_table_start: u64,
}

impl Superblock {
    pub fn new(compressor: CompressorKind, block_log: u16) -> Self {
        Self {
            inode_count: 0,
            mkfs_time: 0,
            block_size: 1 << block_log,
            fragment_count: 0,
            compressor,
            block_log,
            id_count: 0,
            root_inode: 0,
            bytes_used: 0,
            id_table_start: 0,
            xattr_table_start: TABLE_ABSENT,
            inode_table_start: 0,
            directory_table_start: 0,
            fragment_table_start: 0,
            lookup_table_start: TABLE_ABSENT,
        }
    }

    pub fn flags(&self) -> u16 {
        match self.compressor {
            CompressorKind::None => {
                FLAG_UNCOMPRESSED_INODES
                    | FLAG_UNCOMPRESSED_DATA
                    | FLAG_UNCOMPRESSED_FRAGMENTS
                    | FLAG_UNCOMPRESSED_IDS
            }
            _ => 0,
        }
    }

    pub fn record(&self) -> SuperblockRecord {
        SuperblockRecord {
            magic: U32::new(SQFS_MAGIC),
            inode_count: U32::new(self.inode_count),
            mkfs_time: U32::new(self.mkfs_time),
            block_size: U32::new(self.block_size),
            fragment_count: U32::new(self.fragment_count),
            compression_id: U16::new(self.compressor.id()),
            block_log: U16::new(self.block_log),
            flags: U16::new(self.flags()),
            id_count: U16::new(self.id_count),
            version_major: U16::new(SQFS_MAJOR),
            version_minor: U16::new(SQFS_MINOR),
            root_inode: U64::new(self.root_inode),
            bytes_used: U64::new(self.bytes_used),
            id_table_start: U64::new(self.id_table_start),
            xattr_table_start: U64::new(self.xattr_table_start),
            inode_table_start: U64::new(self.inode_table_start),
            directory_table_start: U64::new(self.directory_table_start),
            fragment_table_start: U64::new(self.fragment_table_start),
            lookup_table_start: U64::new(self.lookup_table_start),
        }
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut out = [0u8; SUPERBLOCK_SIZE];
        out.copy_from_slice(self.record().as_bytes());
        out
    }
}
