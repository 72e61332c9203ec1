//! ZIP format structures.
//!
//! This module contains the fixed-layout records of the ZIP format, including
//! the ZIP64 extensions, together with the encoders used when an archive is
//! written back. Every record is little-endian on disk; the 4-byte signature
//! is read and written separately from the record body.

pub mod central_dir;
mod eocd;
pub mod extra;
mod local;

pub use central_dir::CentralDirectoryHeader;
pub use eocd::{Eocd64Locator, Eocd64Record, EocdRecord};
pub use local::{DataDescriptor, LocalFileHeader};
pub(crate) use local::needs_zip64;

use crate::{Error, Result};

/// Sentinel stored in 32-bit fields whose real value lives in a ZIP64 record.
pub const ZIP64_SENTINEL_32: u32 = 0xFFFF_FFFF;

/// Sentinel stored in 16-bit count fields whose real value lives in a ZIP64 record.
pub const ZIP64_SENTINEL_16: u16 = 0xFFFF;

/// Longest archive comment the end record can describe.
pub const MAX_COMMENT_LEN: usize = 0xFFFF;

/// Longest name or extra field block a header's 16-bit length can describe.
pub const MAX_FIELD_LEN: usize = 0xFFFF;

/// "Version needed to extract" for entries using ZIP64 fields.
pub const VERSION_ZIP64: u16 = 45;

/// General purpose bit flags.
pub mod flags {
    /// Entry data is encrypted.
    pub const ENCRYPTED: u16 = 0x0001;
    /// CRC and sizes follow the data in a trailing descriptor.
    pub const DATA_DESCRIPTOR: u16 = 0x0008;
    /// Name and comment are UTF-8 (language encoding flag).
    pub const UTF8: u16 = 0x0800;
}

/// Compression methods supported by the archive engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum CompressionMethod {
    /// No compression (stored).
    Store = 0,
    /// DEFLATE compression.
    #[default]
    Deflate = 8,
}

impl CompressionMethod {
    /// Raw method id as stored in headers.
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Minimum "version needed to extract" for this method.
    #[inline]
    pub fn version_needed(self) -> u16 {
        match self {
            Self::Store => 10,
            Self::Deflate => 20,
        }
    }

    /// Parse a raw method id, rejecting anything but STORE and DEFLATE.
    pub(crate) fn parse(value: u16) -> Result<Self> {
        Self::try_from(value)
            .map_err(|m| Error::Unsupported(format!("compression method {m}")))
    }
}

impl TryFrom<u16> for CompressionMethod {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Store),
            8 => Ok(Self::Deflate),
            other => Err(other),
        }
    }
}
