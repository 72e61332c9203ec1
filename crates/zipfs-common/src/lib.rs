//! Common utilities for zipfs.
//!
//! This crate provides the byte-level building blocks used by the archive engine:
//!
//! - [`BinaryReader`] - Zero-copy little-endian reading from byte slices
//! - [`crc`] - CRC-32 (IEEE) checksums as used by the ZIP format
//! - [`time`] - [`FileTime`] and the DOS, NTFS and Unix timestamp encodings

mod error;
mod reader;

pub mod crc;
pub mod time;

pub use error::{Error, Result};
pub use reader::BinaryReader;
pub use time::FileTime;

/// Re-export zerocopy traits for convenience
pub use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
