//! Error types for the zipfs crate.

use std::io;

use thiserror::Error;

/// Errors that can occur when working with a ZIP filesystem.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Common library error.
    #[error("{0}")]
    Common(#[from] zipfs_common::Error),

    /// The archive structure is corrupt or could not be located.
    #[error("invalid ZIP archive: {0}")]
    Format(String),

    /// Invalid ZIP magic bytes.
    #[error("invalid ZIP signature: expected {expected:#010x}, got {actual:#010x}")]
    InvalidSignature { expected: u32, actual: u32 },

    /// Encrypted entries, unknown compression methods and the like.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No entry exists at the path.
    #[error("no such entry: {0}")]
    NotFound(String),

    /// An entry already exists at the path.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Path names a file where a directory was required.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Path names a directory where a file was required.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// Mutation attempted on an archive opened read-only.
    #[error("archive is read-only")]
    ReadOnly,

    /// The archive has been closed.
    #[error("archive is closed")]
    Closed,

    /// Invalid combination of options or arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub(crate) fn not_found(path: &[u8]) -> Self {
        Self::NotFound(String::from_utf8_lossy(path).into_owned())
    }

    pub(crate) fn already_exists(path: &[u8]) -> Self {
        Self::AlreadyExists(String::from_utf8_lossy(path).into_owned())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => e.kind(),
            Error::NotFound(_) => io::ErrorKind::NotFound,
            Error::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            Error::ReadOnly => io::ErrorKind::PermissionDenied,
            Error::InvalidInput(_) => io::ErrorKind::InvalidInput,
            Error::Format(_) | Error::InvalidSignature { .. } => io::ErrorKind::InvalidData,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result type for zipfs operations.
pub type Result<T> = std::result::Result<T, Error>;
