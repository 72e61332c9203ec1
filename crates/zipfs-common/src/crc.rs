//! CRC-32 checksum utilities.
//!
//! ZIP records the IEEE CRC-32 of every entry's uncompressed data. Streams
//! that compute the checksum incrementally use [`Crc32`] directly.

/// Incremental CRC-32 hasher.
pub use crc32fast::Hasher as Crc32;

/// Compute the CRC-32 of a byte slice.
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
