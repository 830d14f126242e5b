//! Inode and directory table serializer.
//!
//! The tree is written post-order: every child inode (and, for directories,
//! its whole subtree and listing) is placed before the parent's listing and
//! inode, because the listing refers to the children's inode addresses and
//! the parent inode refers to its listing.
//!
//! Each inode picks the smallest of its two encodings whose fields can hold
//! the values. Directory listings are grouped into segments that share one
//! header; see [`plan_segments`].

use std::collections::HashMap;
use std::ops::Range;

use zerocopy::little_endian::{I16, U16, U32};
use zerocopy::IntoBytes;

use super::{Directory, InodeCommon, Node, RegularFile};
use crate::data::BlockReport;
use crate::error::{display_path, ImageError, Result};
use crate::format::disk::{DirEntryRecord, DirHeaderRecord};
use crate::format::{ByteEncoder, InodeType, MetaAddress, DIR_SEGMENT_MAX, FRAGMENT_NONE};
use crate::image::IdTable;
use crate::metadata::MetadataWriter;

/// Common 16-byte inode header with uid/gid already resolved to id-table
/// indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHeader {
    pub mode: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

impl InodeHeader {
    fn encode(&self, type_code: u16) -> ByteEncoder {
        let mut enc = ByteEncoder::with_capacity(64);
        enc.u16(type_code)
            .u16(self.mode)
            .u16(self.uid_index)
            .u16(self.gid_index)
            .u32(self.mtime)
            .u32(self.inode_number);
        enc
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: Vec<u8>,
    pub inode_number: u32,
    pub inode_type: InodeType,
    pub address: MetaAddress,
}

fn within_delta(base: u32, inode_number: u32) -> bool {
    let diff = i64::from(inode_number) - i64::from(base);
    diff < 0x7fff && diff > -0x8000
}

/// Split a name-sorted listing into header segments.
///
/// A segment ends before the first entry whose inode lives in a different
/// metadata block than the segment's first entry, or whose inode number is
/// too far from the segment's base for a 16-bit delta, or once the segment
/// holds 256 entries.
pub fn plan_segments(entries: &[ListingEntry]) -> Vec<Range<usize>> {
    let mut segments = Vec::new();
    let mut start = 0;
    while start < entries.len() {
        let first = &entries[start];
        let mut end = start + 1;
        while end < entries.len()
            && end - start < DIR_SEGMENT_MAX
            && entries[end].address.block == first.address.block
            && within_delta(first.inode_number, entries[end].inode_number)
        {
            end += 1;
        }
        segments.push(start..end);
        start = end;
    }
    segments
}

/// Encode a name-sorted listing as directory table bytes.
pub fn encode_listing(entries: &[ListingEntry]) -> Vec<u8> {
    let mut enc = ByteEncoder::new();
    for segment in plan_segments(entries) {
        let first = &entries[segment.start];
        let base = first.inode_number;
        let header = DirHeaderRecord {
            count: U32::new((segment.len() - 1) as u32),
            start_block: U32::new(first.address.block),
            inode_number: U32::new(base),
        };
        enc.bytes(header.as_bytes());
        for entry in &entries[segment] {
            let delta = (i64::from(entry.inode_number) - i64::from(base)) as i16;
            let record = DirEntryRecord {
                offset: U16::new(entry.address.offset),
                inode_delta: I16::new(delta),
                inode_type: U16::new(entry.inode_type.basic()),
                name_size: U16::new((entry.name.len() - 1) as u16),
            };
            enc.bytes(record.as_bytes()).bytes(&entry.name);
        }
    }
    enc.into_vec()
}

/// Directory inode: 32 bytes basic, 40 bytes extended.
pub fn encode_directory_inode(header: InodeHeader, dir: &Directory, parent: u32) -> Vec<u8> {
    let table = dir.table_address.unwrap_or_default();
    let extended = dir.table_size > 0xffff || dir.common.has_xattr();

    if extended {
        let mut enc = header.encode(InodeType::Directory.extended());
        enc.u32(dir.common.link_count)
            .u32(dir.table_size)
            .u32(table.block)
            .u32(parent)
            .u16(0)
            .u16(table.offset)
            .u32(dir.common.xattr_index);
        enc.into_vec()
    } else {
        let mut enc = header.encode(InodeType::Directory.basic());
        enc.u32(table.block)
            .u32(dir.common.link_count)
            .u16(dir.table_size as u16)
            .u16(table.offset)
            .u32(parent);
        enc.into_vec()
    }
}

/// Regular file inode: 32 bytes basic, 56 bytes extended, followed by one
/// size word per data block.
pub fn encode_file_inode(header: InodeHeader, file: &RegularFile, report: &BlockReport) -> Vec<u8> {
    let (fragment, offset) = match file.fragment {
        Some(loc) => (loc.index, loc.offset),
        None => (FRAGMENT_NONE, 0),
    };
    let extended = report.start_block > 0xffff
        || file.file_size > 0xffff
        || file.common.has_xattr()
        || file.common.link_count != 1;

    let mut enc = if extended {
        let mut enc = header.encode(InodeType::RegularFile.extended());
        enc.u64(report.start_block)
            .u64(file.file_size)
            .u64(file.sparse_bytes)
            .u32(file.common.link_count)
            .u32(fragment)
            .u32(offset)
            .u32(file.common.xattr_index);
        enc
    } else {
        let mut enc = header.encode(InodeType::RegularFile.basic());
        enc.u32(report.start_block as u32)
            .u32(fragment)
            .u32(offset)
            .u32(file.file_size as u32);
        enc
    };
    for size in &report.sizes {
        enc.u32(*size);
    }
    enc.into_vec()
}

/// Symlink, device and IPC inodes: basic unless an xattr is attached.
fn encode_special_inode(header: InodeHeader, node: &Node) -> Vec<u8> {
    let common = node.common();
    let ty = node.inode_type();
    let has_xattr = common.has_xattr();
    let code = if has_xattr { ty.extended() } else { ty.basic() };

    let mut enc = header.encode(code);
    enc.u32(common.link_count);
    match node {
        Node::Symlink(s) => {
            enc.u32(s.target.len() as u32).bytes(&s.target);
        }
        Node::Device(d) => {
            enc.u32(d.rdev);
        }
        _ => {}
    }
    if has_xattr {
        enc.u32(common.xattr_index);
    }
    enc.into_vec()
}

/// Writes a tree into the inode and directory tables.
pub struct TableSerializer<'a> {
    pub inodes: &'a mut MetadataWriter,
    pub directories: &'a mut MetadataWriter,
    pub ids: &'a mut IdTable,
    pub reports: &'a HashMap<u32, BlockReport>,
}

fn join_path(parent: &[u8], name: &[u8]) -> Vec<u8> {
    if parent.is_empty() {
        return name.to_vec();
    }
    let mut path = Vec::with_capacity(parent.len() + 1 + name.len());
    path.extend_from_slice(parent);
    path.push(b'/');
    path.extend_from_slice(name);
    path
}

/// The directory inode's `file_size` field: listing bytes plus 3.
fn listing_size(path: &[u8], listing_len: usize) -> Result<u32> {
    u32::try_from(listing_len + 3).map_err(|_| ImageError::FileTooLarge {
        path: if path.is_empty() {
            "/".to_string()
        } else {
            display_path(path)
        },
        size: listing_len as u64,
    })
}

impl TableSerializer<'_> {
    /// Serialize `root` and everything below it, returning the root inode's
    /// address. `root_parent` is stored as the root's parent number.
    pub fn write_tree(&mut self, root: &mut Directory, root_parent: u32) -> Result<MetaAddress> {
        self.write_directory(root, root_parent, b"")
    }

    fn header(&mut self, common: &InodeCommon) -> Result<InodeHeader> {
        Ok(InodeHeader {
            mode: common.meta.mode,
            uid_index: self.ids.index_of(common.meta.uid)?,
            gid_index: self.ids.index_of(common.meta.gid)?,
            mtime: common.meta.mtime,
            inode_number: common.inode_number,
        })
    }

    fn write_node(&mut self, node: &mut Node, parent: u32, path: &[u8]) -> Result<MetaAddress> {
        let addr = match &mut *node {
            Node::Directory(dir) => return self.write_directory(dir, parent, path),
            Node::RegularFile(file) => {
                let header = self.header(&file.common)?;
                let report = self.report_for(file)?;
                self.inodes.put(&encode_file_inode(header, file, &report))?
            }
            other => {
                let header = self.header(other.common())?;
                self.inodes.put(&encode_special_inode(header, other))?
            }
        };
        node.common_mut().inode_address = Some(addr);
        Ok(addr)
    }

    fn report_for(&self, file: &RegularFile) -> Result<BlockReport> {
        let number = file.common.inode_number;
        let report = self.reports.get(&number).cloned().unwrap_or_default();
        if report.sizes.len() != file.block_count as usize {
            return Err(ImageError::WorkerFailed(format!(
                "inode {}: {} of {} data blocks recorded",
                number,
                report.sizes.len(),
                file.block_count
            )));
        }
        Ok(report)
    }

    fn write_directory(
        &mut self,
        dir: &mut Directory,
        parent: u32,
        path: &[u8],
    ) -> Result<MetaAddress> {
        dir.sort_children();
        let own = dir.common.inode_number;

        let mut listing = Vec::with_capacity(dir.len());
        for (name, child) in dir.children_mut() {
            let child_path = join_path(path, name);
            let address = self.write_node(child, own, &child_path)?;
            listing.push(ListingEntry {
                name: name.to_vec(),
                inode_number: child.inode_number(),
                inode_type: child.inode_type(),
                address,
            });
        }

        let subdirs = listing
            .iter()
            .filter(|e| e.inode_type.is_directory())
            .count() as u32;
        dir.common.link_count = 2 + subdirs;

        let bytes = encode_listing(&listing);
        dir.table_address = Some(self.directories.put(&bytes)?);
        dir.table_size = listing_size(path, bytes.len())?;

        let header = self.header(&dir.common)?;
        let addr = self
            .inodes
            .put(&encode_directory_inode(header, dir, parent))?;
        dir.common.inode_address = Some(addr);
        log::trace!(
            "directory inode {} at {:?} ({} entries)",
            own,
            addr,
            listing.len()
        );
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressorKind;
    use crate::data::FragmentLocation;
    use crate::format::encode::{read_u16, read_u32};
    use crate::testing::decode_metadata;
    use crate::tree::{InodeCounter, InodeMetadata, Symlink};

    fn entry(name: &str, inode_number: u32, block: u32) -> ListingEntry {
        ListingEntry {
            name: name.as_bytes().to_vec(),
            inode_number,
            inode_type: InodeType::RegularFile,
            address: MetaAddress::new(block, 0),
        }
    }

    fn header() -> InodeHeader {
        InodeHeader {
            mode: 0o644,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number: 7,
        }
    }

    #[test]
    fn test_segment_tie_break_table() {
        // (name, inode number, metadata block, expected segment start)
        let table: &[(&str, u32, u32, bool)] = &[
            ("a", 100, 0, true),
            ("b", 101, 0, false),
            ("c", 100 + 0x7ffe, 0, false),
            ("d", 100 + 0x7fff, 0, true),
            ("e", 100 + 0x7fff - 0x7fff, 0, false),
            ("f", 100 + 0x7fff - 0x8000, 0, true),
            ("g", 90, 0, false),
            ("h", 91, 8192, true),
            ("i", 92, 8192, false),
        ];
        let entries: Vec<ListingEntry> = table
            .iter()
            .map(|&(name, number, block, _)| entry(name, number, block))
            .collect();
        let starts: Vec<usize> = plan_segments(&entries).iter().map(|r| r.start).collect();
        let expected: Vec<usize> = table
            .iter()
            .enumerate()
            .filter(|(_, row)| row.3)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts, expected);
    }

    #[test]
    fn test_segment_caps_at_256_entries() {
        let entries: Vec<ListingEntry> = (0..300u32)
            .map(|i| entry(&format!("n{i:04}"), i + 1, 0))
            .collect();
        let segments = plan_segments(&entries);
        assert_eq!(segments, vec![0..256, 256..300]);
    }

    #[test]
    fn test_listing_layout() {
        let entries = vec![
            ListingEntry {
                name: b"b.txt".to_vec(),
                inode_number: 3,
                inode_type: InodeType::RegularFile,
                address: MetaAddress::new(0, 32),
            },
            ListingEntry {
                name: b"c".to_vec(),
                inode_number: 2,
                inode_type: InodeType::Symlink,
                address: MetaAddress::new(0, 0),
            },
        ];
        let bytes = encode_listing(&entries);
        assert_eq!(bytes.len(), 12 + (8 + 5) + (8 + 1));
        assert_eq!(read_u32(&bytes, 0), 1);
        assert_eq!(read_u32(&bytes, 4), 0);
        assert_eq!(read_u32(&bytes, 8), 3);
        assert_eq!(read_u16(&bytes, 12), 32);
        assert_eq!(read_u16(&bytes, 14), 0);
        assert_eq!(read_u16(&bytes, 16), 2);
        assert_eq!(read_u16(&bytes, 18), 4);
        assert_eq!(&bytes[20..25], b"b.txt");
        // Second entry: delta -1 as a 16-bit value.
        assert_eq!(read_u16(&bytes, 27), 0xffff);
        assert_eq!(read_u16(&bytes, 29), 3);
        assert_eq!(read_u16(&bytes, 31), 0);
        assert_eq!(&bytes[33..], b"c");
    }

    fn fragment_file(file_size: u64) -> RegularFile {
        let mut file = RegularFile::new(7, InodeMetadata::new(0o644, 0, 0, 0));
        file.file_size = file_size;
        file.fragment = Some(FragmentLocation { index: 0, offset: 0 });
        file
    }

    #[test]
    fn test_file_inode_basic_at_16_bit_limit() {
        let bytes = encode_file_inode(header(), &fragment_file(0xffff), &BlockReport::default());
        assert_eq!(bytes.len(), 32);
        assert_eq!(read_u16(&bytes, 0), 2);
        assert_eq!(read_u32(&bytes, 28), 0xffff);
    }

    #[test]
    fn test_file_inode_extended_past_16_bit_limit() {
        let bytes = encode_file_inode(header(), &fragment_file(0x10000), &BlockReport::default());
        assert_eq!(bytes.len(), 56);
        assert_eq!(read_u16(&bytes, 0), 9);
        assert_eq!(read_u32(&bytes, 40), 1);
        assert_eq!(read_u32(&bytes, 52), crate::format::XATTR_NONE);
    }

    #[test]
    fn test_file_inode_extended_for_far_start_block() {
        let report = BlockReport {
            start_block: 0x10000,
            sizes: vec![100],
        };
        let mut file = RegularFile::new(7, InodeMetadata::default());
        file.file_size = 100;
        file.block_count = 1;
        let bytes = encode_file_inode(header(), &file, &report);
        assert_eq!(bytes.len(), 56 + 4);
        assert_eq!(read_u32(&bytes, 44), FRAGMENT_NONE);
        assert_eq!(read_u32(&bytes, 56), 100);
    }

    #[test]
    fn test_file_inode_extended_for_link_count() {
        let mut file = fragment_file(10);
        file.common.link_count = 2;
        let bytes = encode_file_inode(header(), &file, &BlockReport::default());
        assert_eq!(bytes.len(), 56);
    }

    #[test]
    fn test_directory_inode_forms() {
        let mut dir = Directory::new(5, InodeMetadata::IMPLICIT_DIRECTORY);
        dir.table_address = Some(MetaAddress::new(8200, 12));
        dir.common.link_count = 3;
        dir.table_size = 0xffff;
        let basic = encode_directory_inode(header(), &dir, 9);
        assert_eq!(basic.len(), 32);
        assert_eq!(read_u16(&basic, 0), 1);
        assert_eq!(read_u32(&basic, 16), 8200);
        assert_eq!(read_u32(&basic, 20), 3);
        assert_eq!(read_u16(&basic, 24), 0xffff);
        assert_eq!(read_u16(&basic, 26), 12);
        assert_eq!(read_u32(&basic, 28), 9);

        dir.table_size = 0x10000;
        let ext = encode_directory_inode(header(), &dir, 9);
        assert_eq!(ext.len(), 40);
        assert_eq!(read_u16(&ext, 0), 8);
        assert_eq!(read_u32(&ext, 16), 3);
        assert_eq!(read_u32(&ext, 20), 0x10000);
        assert_eq!(read_u32(&ext, 24), 8200);
        assert_eq!(read_u32(&ext, 28), 9);
        assert_eq!(read_u16(&ext, 32), 0);
        assert_eq!(read_u16(&ext, 34), 12);
    }

    #[test]
    fn test_symlink_inode_layout() {
        let node = Node::Symlink(Symlink::new(4, InodeMetadata::default(), b"b.txt".to_vec()));
        let bytes = encode_special_inode(header(), &node);
        assert_eq!(bytes.len(), 24 + 5);
        assert_eq!(read_u16(&bytes, 0), 3);
        assert_eq!(read_u32(&bytes, 16), 1);
        assert_eq!(read_u32(&bytes, 20), 5);
        assert_eq!(&bytes[24..], b"b.txt");
    }

    #[test]
    fn test_oversized_listing_names_the_directory() {
        assert_eq!(listing_size(b"usr/share", 29).unwrap(), 32);
        assert_eq!(join_path(b"", b"usr"), b"usr");
        assert_eq!(join_path(b"usr", b"share"), b"usr/share");

        let too_big = u32::MAX as usize - 2;
        match listing_size(&join_path(b"usr", b"share"), too_big) {
            Err(ImageError::FileTooLarge { path, size }) => {
                assert_eq!(path, "usr/share");
                assert_eq!(size, too_big as u64);
            }
            other => panic!("unexpected {other:?}"),
        }
        match listing_size(b"", too_big) {
            Err(ImageError::FileTooLarge { path, .. }) => assert_eq!(path, "/"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_post_order_and_link_counts() {
        let mut counter = InodeCounter::new();
        let mut root = Directory::new(counter.allocate(), InodeMetadata::IMPLICIT_DIRECTORY);
        for path in ["z/inner", "a"] {
            root.insert_or_get_directory(path.as_bytes(), &mut counter)
                .unwrap();
        }
        let link = Node::Symlink(Symlink::new(counter.allocate(), InodeMetadata::default(), b"a".to_vec()));
        root.insert_file(b"m", link, &mut counter).unwrap();

        let comp = CompressorKind::Zlib.build(None).unwrap();
        let mut inodes = MetadataWriter::new(comp.clone());
        let mut dirs = MetadataWriter::new(comp.clone());
        let mut ids = IdTable::default();
        let reports = HashMap::new();
        let root_addr = TableSerializer {
            inodes: &mut inodes,
            directories: &mut dirs,
            ids: &mut ids,
            reports: &reports,
        }
        .write_tree(&mut root, counter.peek())
        .unwrap();
        inodes.write_block_no_pad().unwrap();
        dirs.write_block_no_pad().unwrap();

        // Root has two subdirectories: a and z.
        assert_eq!(root.common.link_count, 4);
        let names: Vec<&[u8]> = root.children().map(|(n, _)| n).collect();
        assert_eq!(names, vec![&b"a"[..], b"m", b"z"]);

        // Every child precedes its parent in the inode table.
        let z = root.child(b"z").unwrap().as_directory().unwrap();
        let inner = z.child(b"inner").unwrap().common().inode_address.unwrap();
        let z_addr = z.common.inode_address.unwrap();
        assert!(inner.offset < z_addr.offset);
        assert!(z_addr.offset < root_addr.offset);
        let m_addr = root.child(b"m").unwrap().common().inode_address.unwrap();
        assert!(m_addr.offset < root_addr.offset);

        let decoded = decode_metadata(inodes.table(), comp.as_ref());
        let raw = decoded.read(root_addr, 32);
        assert_eq!(read_u16(&raw, 0), 1);
        assert_eq!(read_u32(&raw, 12), 1);
        assert_eq!(read_u32(&raw, 28), counter.peek());
        assert_eq!(ids.ids(), &[0]);
    }
}
