//! Mutable filesystem view over a ZIP archive.
//!
//! A [`ZipFileSystem`] indexes an archive's central directory and exposes its
//! entries as a tree of files and directories. Reads stream straight from the
//! archive; changes are staged in memory or in scratch files next to the
//! archive and written back by rebuilding the whole archive into a new file
//! that is renamed over the old one.
//!
//! # Format Support
//!
//! - Stored and DEFLATE entries
//! - ZIP64 sizes, offsets and end of central directory records
//! - Prefixed archives (a stub such as a launcher before the first entry)
//! - Extended timestamp and NTFS time extra fields
//!
//! Encrypted entries and multi-disk archives are rejected when opened.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use zipfs::{CopyOptions, ZipFileSystem};
//!
//! let fs = ZipFileSystem::open("bundle.zip")?;
//! for entry in fs.read_dir("/")? {
//!     println!("{} {}", entry.path(), if entry.is_dir() { "dir" } else { "file" });
//! }
//!
//! let mut manifest = String::new();
//! fs.open_read("/META-INF/MANIFEST.MF")?.read_to_string(&mut manifest)?;
//!
//! fs.rename("/README", "/README.txt", CopyOptions::default())?;
//! fs.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod channel;
mod codec;
mod config;
mod entry;
mod error;
mod fs;
mod index;
mod pool;
mod reader;
mod stream;
mod sync;
mod temp;
pub mod zip;

#[cfg(test)]
mod testutil;

pub use config::ZipFsConfig;
pub use entry::EntryAttributes;
pub use error::{Error, Result};
pub use fs::{ChannelOptions, CopyOptions, DirEntry, WriteOptions, ZipFileSystem};
pub use stream::{EntryChannel, EntryReader, EntryWriter};
pub use zip::CompressionMethod;
pub use zipfs_common::FileTime;
