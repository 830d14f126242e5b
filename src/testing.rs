//! Minimal SquashFS reader used by the tests to check real image bytes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use crate::compress::{Compressor, CompressorKind};
use crate::format::encode::{read_u16, read_u32, read_u64};
use crate::format::{
    MetaAddress, DATA_UNCOMPRESSED_BIT, FRAGMENT_NONE, META_BLOCK_SIZE, META_UNCOMPRESSED_BIT,
};

/// A metadata table inflated into one contiguous buffer.
pub(crate) struct DecodedMetadata {
    starts: HashMap<u32, usize>,
    data: Vec<u8>,
}

impl DecodedMetadata {
    pub fn read(&self, addr: MetaAddress, len: usize) -> Vec<u8> {
        self.from(addr)[..len].to_vec()
    }

    pub fn from(&self, addr: MetaAddress) -> &[u8] {
        let start = self.starts[&addr.block] + addr.offset as usize;
        &self.data[start..]
    }
}

fn decode_block(raw: &[u8], comp: &dyn Compressor) -> (Vec<u8>, usize) {
    let header = read_u16(raw, 0);
    let len = (header & !META_UNCOMPRESSED_BIT) as usize;
    let compressed = header & META_UNCOMPRESSED_BIT == 0;
    let block = comp
        .decompress(&raw[2..2 + len], compressed, META_BLOCK_SIZE)
        .unwrap();
    (block, 2 + len)
}

pub(crate) fn decode_metadata(table: &[u8], comp: &dyn Compressor) -> DecodedMetadata {
    let mut starts = HashMap::new();
    let mut data = Vec::new();
    let mut pos = 0;
    while pos < table.len() {
        let (block, used) = decode_block(&table[pos..], comp);
        starts.insert(pos as u32, data.len());
        data.extend(block);
        pos += used;
    }
    // An address just past the last block is valid for empty records.
    starts.insert(pos as u32, data.len());
    DecodedMetadata { starts, data }
}

#[derive(Debug, Clone)]
pub(crate) struct ParsedSuperblock {
    pub magic: u32,
    pub inode_count: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression_id: u16,
    pub flags: u16,
    pub id_count: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InodeKind {
    Directory {
        start_block: u32,
        offset: u16,
        file_size: u32,
        nlink: u32,
        parent: u32,
    },
    File {
        start_block: u64,
        file_size: u64,
        fragment: u32,
        fragment_offset: u32,
        blocks: Vec<u32>,
    },
    Symlink {
        target: Vec<u8>,
    },
    Device {
        rdev: u32,
    },
    Ipc,
}

#[derive(Debug, Clone)]
pub(crate) struct ParsedInode {
    pub type_code: u16,
    pub mode: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub kind: InodeKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ListedEntry {
    pub name: Vec<u8>,
    pub inode_number: u32,
    pub inode_type: u16,
    pub address: MetaAddress,
}

pub(crate) struct ImageReader {
    bytes: Vec<u8>,
    sb: ParsedSuperblock,
    comp: Arc<dyn Compressor>,
    inodes: DecodedMetadata,
    dirs: DecodedMetadata,
}

impl ImageReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        let b = &bytes;
        let sb = ParsedSuperblock {
            magic: read_u32(b, 0),
            inode_count: read_u32(b, 4),
            block_size: read_u32(b, 12),
            fragment_count: read_u32(b, 16),
            compression_id: read_u16(b, 20),
            flags: read_u16(b, 24),
            id_count: read_u16(b, 26),
            root_inode: read_u64(b, 32),
            bytes_used: read_u64(b, 40),
            id_table_start: read_u64(b, 48),
            inode_table_start: read_u64(b, 64),
            directory_table_start: read_u64(b, 72),
            fragment_table_start: read_u64(b, 80),
        };
        let kind = match sb.compression_id {
            6 => CompressorKind::Zstd,
            _ => CompressorKind::Zlib,
        };
        let comp = kind.build(None).unwrap();

        let dir_end = if sb.fragment_count > 0 {
            read_u64(b, sb.fragment_table_start as usize)
        } else {
            sb.fragment_table_start
        };
        let inodes = decode_metadata(
            &b[sb.inode_table_start as usize..sb.directory_table_start as usize],
            comp.as_ref(),
        );
        let dirs = decode_metadata(
            &b[sb.directory_table_start as usize..dir_end as usize],
            comp.as_ref(),
        );

        Self {
            bytes,
            sb,
            comp,
            inodes,
            dirs,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn superblock(&self) -> &ParsedSuperblock {
        &self.sb
    }

    pub fn root(&self) -> ParsedInode {
        let r = self.sb.root_inode;
        self.inode(MetaAddress::new((r >> 16) as u32, (r & 0xffff) as u16))
    }

    pub fn inode(&self, addr: MetaAddress) -> ParsedInode {
        let raw = self.inodes.from(addr);
        let type_code = read_u16(raw, 0);
        let block_size = u64::from(self.sb.block_size);

        let kind = match type_code {
            1 => InodeKind::Directory {
                start_block: read_u32(raw, 16),
                nlink: read_u32(raw, 20),
                file_size: u32::from(read_u16(raw, 24)),
                offset: read_u16(raw, 26),
                parent: read_u32(raw, 28),
            },
            8 => InodeKind::Directory {
                nlink: read_u32(raw, 16),
                file_size: read_u32(raw, 20),
                start_block: read_u32(raw, 24),
                parent: read_u32(raw, 28),
                offset: read_u16(raw, 34),
            },
            2 | 9 => {
                let (start_block, fragment, fragment_offset, file_size, list) = if type_code == 2 {
                    (
                        u64::from(read_u32(raw, 16)),
                        read_u32(raw, 20),
                        read_u32(raw, 24),
                        u64::from(read_u32(raw, 28)),
                        32,
                    )
                } else {
                    (
                        read_u64(raw, 16),
                        read_u32(raw, 44),
                        read_u32(raw, 48),
                        read_u64(raw, 24),
                        56,
                    )
                };
                let count = if fragment == FRAGMENT_NONE {
                    file_size.div_ceil(block_size)
                } else {
                    file_size / block_size
                };
                let blocks = (0..count as usize)
                    .map(|i| read_u32(raw, list + i * 4))
                    .collect();
                InodeKind::File {
                    start_block,
                    file_size,
                    fragment,
                    fragment_offset,
                    blocks,
                }
            }
            3 | 10 => {
                let len = read_u32(raw, 20) as usize;
                InodeKind::Symlink {
                    target: raw[24..24 + len].to_vec(),
                }
            }
            4 | 5 | 11 | 12 => InodeKind::Device {
                rdev: read_u32(raw, 20),
            },
            6 | 7 | 13 | 14 => InodeKind::Ipc,
            other => panic!("unknown inode type {other}"),
        };

        ParsedInode {
            type_code,
            mode: read_u16(raw, 2),
            uid_index: read_u16(raw, 4),
            gid_index: read_u16(raw, 6),
            mtime: read_u32(raw, 8),
            inode_number: read_u32(raw, 12),
            kind,
        }
    }

    pub fn list(&self, dir: &ParsedInode) -> Vec<ListedEntry> {
        let InodeKind::Directory {
            start_block,
            offset,
            file_size,
            ..
        } = dir.kind
        else {
            panic!("not a directory: {dir:?}");
        };
        let raw = self.dirs.from(MetaAddress::new(start_block, offset));
        let total = (file_size - 3) as usize;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < total {
            let count = read_u32(raw, pos) + 1;
            let block = read_u32(raw, pos + 4);
            let base = read_u32(raw, pos + 8);
            pos += 12;
            for _ in 0..count {
                let in_block = read_u16(raw, pos);
                let delta = read_u16(raw, pos + 2) as i16;
                let inode_type = read_u16(raw, pos + 4);
                let name_len = read_u16(raw, pos + 6) as usize + 1;
                entries.push(ListedEntry {
                    name: raw[pos + 8..pos + 8 + name_len].to_vec(),
                    inode_number: (i64::from(base) + i64::from(delta)) as u32,
                    inode_type,
                    address: MetaAddress::new(block, in_block),
                });
                pos += 8 + name_len;
            }
        }
        entries
    }

    pub fn lookup(&self, from: &ParsedInode, path: &[u8]) -> Option<ParsedInode> {
        let mut node = from.clone();
        for name in path.split(|&b| b == b'/').filter(|n| !n.is_empty()) {
            let entry = self.list(&node).into_iter().find(|e| e.name == name)?;
            node = self.inode(entry.address);
        }
        Some(node)
    }

    fn metadata_block_at(&self, pos: u64) -> Vec<u8> {
        decode_block(&self.bytes[pos as usize..], self.comp.as_ref()).0
    }

    /// Fragment table entry `index` as (start, size field).
    pub fn fragment(&self, index: u32) -> (u64, u32) {
        let index = index as usize;
        let ptr = read_u64(&self.bytes, self.sb.fragment_table_start as usize + 8 * (index / 512));
        let block = self.metadata_block_at(ptr);
        let at = (index % 512) * 16;
        (read_u64(&block, at), read_u32(&block, at + 8))
    }

    pub fn id(&self, index: u16) -> u32 {
        let index = index as usize;
        let ptr = read_u64(&self.bytes, self.sb.id_table_start as usize + 8 * (index / 2048));
        let block = self.metadata_block_at(ptr);
        read_u32(&block, (index % 2048) * 4)
    }

    fn data_block(&self, start: u64, size_field: u32) -> Vec<u8> {
        let len = (size_field & !DATA_UNCOMPRESSED_BIT) as usize;
        let compressed = size_field & DATA_UNCOMPRESSED_BIT == 0;
        let stored = &self.bytes[start as usize..start as usize + len];
        self.comp
            .decompress(stored, compressed, self.sb.block_size as usize)
            .unwrap()
    }

    pub fn read_file(&self, inode: &ParsedInode) -> Vec<u8> {
        let InodeKind::File {
            start_block,
            file_size,
            fragment,
            fragment_offset,
            ref blocks,
        } = inode.kind
        else {
            panic!("not a regular file: {inode:?}");
        };

        let mut data = Vec::with_capacity(file_size as usize);
        let mut pos = start_block;
        for &size in blocks {
            data.extend(self.data_block(pos, size));
            pos += u64::from(size & !DATA_UNCOMPRESSED_BIT);
        }
        if fragment != FRAGMENT_NONE {
            let (start, size) = self.fragment(fragment);
            let frag = self.data_block(start, size);
            let from = fragment_offset as usize;
            let want = file_size as usize - data.len();
            data.extend_from_slice(&frag[from..from + want]);
        }
        assert_eq!(data.len() as u64, file_size);
        data
    }
}
