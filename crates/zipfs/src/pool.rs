//! Pooled compression contexts.

use flate2::{Compress, Compression, Decompress};
use parking_lot::Mutex;

/// Most contexts kept per pool; extras are freed on release.
pub(crate) const MAX_POOLED: usize = 20;

/// Bounded pools of raw DEFLATE compressors and decompressors.
///
/// A context is owned by exactly one stream between acquire and release.
#[derive(Debug, Default)]
pub(crate) struct CompressionPool {
    compressors: Mutex<Vec<Compress>>,
    decompressors: Mutex<Vec<Decompress>>,
}

impl CompressionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_compressor(&self) -> Compress {
        self.compressors
            .lock()
            .pop()
            .unwrap_or_else(|| Compress::new(Compression::default(), false))
    }

    pub fn release_compressor(&self, mut compress: Compress) {
        let mut pool = self.compressors.lock();
        if pool.len() < MAX_POOLED {
            compress.reset();
            pool.push(compress);
        }
    }

    pub fn acquire_decompressor(&self) -> Decompress {
        self.decompressors
            .lock()
            .pop()
            .unwrap_or_else(|| Decompress::new(false))
    }

    pub fn release_decompressor(&self, mut decompress: Decompress) {
        let mut pool = self.decompressors.lock();
        if pool.len() < MAX_POOLED {
            decompress.reset(false);
            pool.push(decompress);
        }
    }

    /// Free every pooled context.
    pub fn clear(&self) {
        self.compressors.lock().clear();
        self.decompressors.lock().clear();
    }

    /// Number of idle (compressor, decompressor) contexts.
    #[cfg(test)]
    pub fn idle(&self) -> (usize, usize) {
        (self.compressors.lock().len(), self.decompressors.lock().len())
    }
}
