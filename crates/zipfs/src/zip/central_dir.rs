//! Central Directory Header structures.

use std::io::{self, Write};

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Central Directory File Header (without signature).
///
/// This structure describes a single file entry in the archive's
/// central directory. The 4-byte signature (0x02014b50) is read
/// separately before this struct.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CentralDirectoryHeader {
    /// Version made by
    pub version_made_by: U16,
    /// Version needed to extract
    pub version_needed: U16,
    /// General purpose bit flag
    pub flags: U16,
    /// Compression method
    pub compression_method: U16,
    /// File last modification time and date (DOS format)
    pub last_modified: U32,
    /// CRC32 of uncompressed data
    pub crc32: U32,
    /// Compressed size
    pub compressed_size: U32,
    /// Uncompressed size
    pub uncompressed_size: U32,
    /// File name length
    pub file_name_length: U16,
    /// Extra field length
    pub extra_field_length: U16,
    /// File comment length
    pub file_comment_length: U16,
    /// Disk number where file starts
    pub disk_number_start: U16,
    /// Internal file attributes
    pub internal_attrs: U16,
    /// External file attributes
    pub external_attrs: U32,
    /// Relative offset of local file header
    pub local_header_offset: U32,
}

impl CentralDirectoryHeader {
    /// Central Directory signature bytes.
    pub const MAGIC: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];

    /// Central Directory signature as u32.
    pub const SIGNATURE: u32 = 0x02014b50;

    /// Size of the header including its signature.
    pub const SIZE: usize = 46;

    /// Total variable-length data size following this header.
    pub fn variable_data_size(&self) -> usize {
        self.file_name_length.get() as usize
            + self.extra_field_length.get() as usize
            + self.file_comment_length.get() as usize
    }

    /// Write signature and header.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&Self::MAGIC)?;
        out.write_all(self.as_bytes())
    }
}
