//! Error type for the image writer.
//!
//! Everything below the entry-source boundary returns [`ImageError`]. The
//! adapters and the binary wrap it in `anyhow` with path context, the same
//! way the rest of the crate reports I/O failures.

use thiserror::Error;

/// Unified error for building a SquashFS image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Read, write, seek or truncate failure on the output stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The compression backend rejected a block.
    #[error("{codec} failed: {detail}")]
    Compression { codec: &'static str, detail: String },

    /// A single path component does not fit the 8-bit name length field.
    #[error("name too long ({len} bytes, limit 255) in path '{path}'")]
    NameTooLong { path: String, len: usize },

    /// The path cannot be placed in the tree.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// A file exceeds what the inode counters can describe.
    #[error("file too large for image: '{path}' ({size} bytes)")]
    FileTooLarge { path: String, size: u64 },

    /// More distinct uids/gids than the 16-bit id index can address.
    #[error("too many distinct uid/gid values ({count}, limit 65535)")]
    TooManyIds { count: usize },

    /// The entry source produced a type the image cannot represent.
    #[error("unsupported entry type '{kind}' at '{path}'")]
    UnsupportedEntry { path: String, kind: String },

    /// An image option is out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Operation attempted in a phase that does not accept it.
    #[error("cannot {operation} while image writer is {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },

    /// A background compression or write job failed.
    #[error("background writer failed: {0}")]
    WorkerFailed(String),
}

pub type Result<T, E = ImageError> = std::result::Result<T, E>;

/// Render a raw path for error messages.
pub(crate) fn display_path(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}
