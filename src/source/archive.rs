//! Tar stream source: plain, gzip or zstd, from a file or stdin.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tar::EntryType;

use super::{EntryKind, EntryMetadata, EntryPayload, EntrySource, SourceEntry};
use crate::format::encode_rdev;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamCompression {
    Plain,
    Gzip,
    Zstd,
}

impl StreamCompression {
    fn detect(head: &[u8]) -> Self {
        if head.starts_with(&ZSTD_MAGIC) {
            StreamCompression::Zstd
        } else if head.starts_with(&GZIP_MAGIC) {
            StreamCompression::Gzip
        } else {
            StreamCompression::Plain
        }
    }
}

/// Read up to four bytes of `reader` to sniff the compression, then hand
/// back a reader that yields the whole stream again, decompressed.
fn open_stream(mut reader: Box<dyn Read>) -> io::Result<(StreamCompression, Box<dyn Read>)> {
    let mut head = Vec::with_capacity(ZSTD_MAGIC.len());
    (&mut reader)
        .take(ZSTD_MAGIC.len() as u64)
        .read_to_end(&mut head)?;
    let compression = StreamCompression::detect(&head);
    let rewound = Cursor::new(head).chain(reader);

    let stream: Box<dyn Read> = match compression {
        StreamCompression::Plain => Box::new(rewound),
        StreamCompression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(rewound)),
        StreamCompression::Zstd => Box::new(zstd::stream::Decoder::new(rewound)?),
    };
    Ok((compression, stream))
}

pub struct TarSource {
    origin: String,
    archive: Option<tar::Archive<Box<dyn Read>>>,
}

impl TarSource {
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_reader(Box::new(f), path.display().to_string())
    }

    pub fn stdin() -> Result<Self> {
        Self::from_reader(Box::new(io::stdin()), "<stdin>".to_string())
    }

    pub fn from_reader(reader: Box<dyn Read>, origin: String) -> Result<Self> {
        let (compression, stream) = open_stream(reader)
            .with_context(|| format!("Failed to read archive header from {origin}"))?;
        log::debug!("{origin}: {compression:?} tar stream");
        Ok(Self {
            origin,
            archive: Some(tar::Archive::new(stream)),
        })
    }
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn entry_kind(ty: EntryType) -> Option<EntryKind> {
    let kind = match ty {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryKind::RegularFile,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        EntryType::Block => EntryKind::BlockDevice,
        EntryType::Char => EntryKind::CharDevice,
        EntryType::Fifo => EntryKind::Fifo,
        EntryType::Link => EntryKind::Unsupported("hard link".to_string()),
        // Archive-wide pax records carry no file.
        EntryType::XGlobalHeader => return None,
        other => EntryKind::Unsupported(format!("tar entry type {:?}", other.as_byte() as char)),
    };
    Some(kind)
}

impl EntrySource for TarSource {
    fn describe(&self) -> String {
        self.origin.clone()
    }

    fn visit(&mut self, f: &mut dyn FnMut(SourceEntry<'_>) -> Result<()>) -> Result<()> {
        let Some(mut archive) = self.archive.take() else {
            bail!("{} has already been read", self.origin);
        };

        let entries = archive
            .entries()
            .with_context(|| format!("Failed to read {}", self.origin))?;
        for entry in entries {
            let mut entry = entry.with_context(|| format!("Corrupt entry in {}", self.origin))?;
            let header = entry.header();
            let Some(kind) = entry_kind(header.entry_type()) else {
                continue;
            };
            let path = entry.path_bytes().into_owned();
            let shown = String::from_utf8_lossy(&path).into_owned();
            let ctx = || format!("Bad header for {shown} in {}", self.origin);

            let metadata = EntryMetadata::new(
                header.mode().with_context(ctx)?,
                clamp_u32(header.uid().with_context(ctx)?),
                clamp_u32(header.gid().with_context(ctx)?),
                clamp_u32(header.mtime().with_context(ctx)?),
            );
            let rdev = match kind {
                EntryKind::BlockDevice | EntryKind::CharDevice => encode_rdev(
                    header.device_major().with_context(ctx)?.unwrap_or(0),
                    header.device_minor().with_context(ctx)?.unwrap_or(0),
                ),
                _ => 0,
            };
            let target = entry
                .link_name_bytes()
                .map(|t| t.into_owned())
                .unwrap_or_default();
            let size = entry.size();

            let payload = match kind {
                EntryKind::RegularFile => EntryPayload::Data {
                    reader: &mut entry,
                    size,
                },
                EntryKind::Symlink => EntryPayload::Target(target),
                EntryKind::BlockDevice | EntryKind::CharDevice => EntryPayload::Device { rdev },
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
