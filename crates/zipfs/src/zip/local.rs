//! Local File Header structures.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Local File Header (without signature).
///
/// This structure precedes the actual file data in the archive.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct LocalFileHeader {
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
}

impl LocalFileHeader {
    /// Local File Header signature bytes.
    pub const MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

    /// Local File Header signature as u32.
    pub const SIGNATURE: u32 = 0x04034b50;

    /// Size of the header including its signature.
    pub const SIZE: usize = 30;

    /// Total variable-length data size following this header.
    pub fn variable_data_size(&self) -> usize {
        self.file_name_length.get() as usize + self.extra_field_length.get() as usize
    }

    /// Write signature and header.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&Self::MAGIC)?;
        out.write_all(self.as_bytes())
    }
}

/// Trailing data descriptor written after entry data when
/// [`DATA_DESCRIPTOR`](super::flags::DATA_DESCRIPTOR) is set.
pub struct DataDescriptor;

impl DataDescriptor {
    /// Data descriptor signature as u32.
    pub const SIGNATURE: u32 = 0x08074b50;

    /// Size of a descriptor with 32-bit sizes, including signature.
    pub const SIZE: u64 = 16;

    /// Size of a descriptor with 64-bit sizes, including signature.
    pub const SIZE_ZIP64: u64 = 24;

    /// Size of the descriptor that follows an entry with the given sizes.
    pub fn size_for(size: u64, compressed_size: u64) -> u64 {
        if needs_zip64(size) || needs_zip64(compressed_size) {
            Self::SIZE_ZIP64
        } else {
            Self::SIZE
        }
    }

    /// Write a descriptor, returning the number of bytes written.
    pub fn write_to<W: Write>(
        out: &mut W,
        crc32: u32,
        size: u64,
        compressed_size: u64,
    ) -> io::Result<u64> {
        out.write_u32::<LittleEndian>(Self::SIGNATURE)?;
        out.write_u32::<LittleEndian>(crc32)?;
        if needs_zip64(size) || needs_zip64(compressed_size) {
            out.write_u64::<LittleEndian>(compressed_size)?;
            out.write_u64::<LittleEndian>(size)?;
            Ok(Self::SIZE_ZIP64)
        } else {
            out.write_u32::<LittleEndian>(compressed_size as u32)?;
            out.write_u32::<LittleEndian>(size as u32)?;
            Ok(Self::SIZE)
        }
    }
}

/// Whether a 64-bit value overflows a fixed 32-bit header field.
#[inline]
pub(crate) fn needs_zip64(value: u64) -> bool {
    value >= super::ZIP64_SENTINEL_32 as u64
}
