//! Little-endian byte packing.
//!
//! Every on-disk SquashFS structure is little-endian. Records are built by
//! appending into a growable buffer; a few fields (the inode type, which is
//! only known after layout selection) are patched in place afterwards.

/// Growable little-endian record buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteEncoder {
    buf: Vec<u8>,
}

impl ByteEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, n: u8) -> &mut Self {
        self.buf.push(n);
        self
    }

    pub fn u16(&mut self, n: u16) -> &mut Self {
        self.buf.extend_from_slice(&n.to_le_bytes());
        self
    }

    pub fn u32(&mut self, n: u32) -> &mut Self {
        self.buf.extend_from_slice(&n.to_le_bytes());
        self
    }

    pub fn u64(&mut self, n: u64) -> &mut Self {
        self.buf.extend_from_slice(&n.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// Overwrite a u16 that was already appended at `offset`.
    ///
    /// Panics if the field lies outside the written range.
    pub fn patch_u16(&mut self, offset: usize, n: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&n.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Read helpers used by tests and by the read-back paths of deduplication.
pub fn read_u16(b: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([b[offset], b[offset + 1]])
}

pub fn read_u32(b: &[u8], offset: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[offset..offset + 4]);
    u32::from_le_bytes(a)
}

pub fn read_u64(b: &[u8], offset: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[offset..offset + 8]);
    u64::from_le_bytes(a)
}
