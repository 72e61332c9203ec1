//! Options controlling how an archive is opened and written back.

use crate::zip::CompressionMethod;

/// Configuration for [`ZipFileSystem::open_with`](crate::ZipFileSystem::open_with).
///
/// # Example
///
/// ```no_run
/// use zipfs::{CompressionMethod, ZipFileSystem, ZipFsConfig};
///
/// let config = ZipFsConfig {
///     create: true,
///     compression: CompressionMethod::Store,
///     ..ZipFsConfig::default()
/// };
/// let fs = ZipFileSystem::open_with("bundle.zip", config)?;
/// # Ok::<(), zipfs::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ZipFsConfig {
    /// Create an empty archive when the file does not exist.
    pub create: bool,
    /// Refuse every mutation.
    pub read_only: bool,
    /// Stage written content in scratch files instead of memory.
    pub use_temp_file: bool,
    /// Method for newly written file entries.
    pub compression: CompressionMethod,
    /// Mark new entry names as UTF-8.
    pub utf8_names: bool,
    /// Always write the ZIP64 end records on sync.
    pub force_zip64_end: bool,
    /// Read access and creation times from local headers.
    pub extended_timestamps: bool,
}

impl Default for ZipFsConfig {
    fn default() -> Self {
        Self {
            create: false,
            read_only: false,
            use_temp_file: false,
            compression: CompressionMethod::Deflate,
            utf8_names: true,
            force_zip64_end: false,
            extended_timestamps: true,
        }
    }
}
