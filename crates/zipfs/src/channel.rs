//! Shared access to the archive file.
//!
//! The archive file is one stateful handle (seek + read are not atomic
//! together), so every positioned read goes through [`ArchiveChannel`]'s
//! mutex, independently of the filesystem's structural lock.
//!
//! Each opened archive file is a [`Generation`]: the channel plus a registry
//! of readers streaming from it. When a sync replaces the file while readers
//! are still attached, the old file is renamed aside and its generation is
//! retired; the file is closed and deleted once the last reader lets go.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::temp::TempFileManager;
use crate::{Error, Result};

/// Positioned, serialized reads over the archive file.
#[derive(Debug)]
pub(crate) struct ArchiveChannel {
    file: Mutex<Option<File>>,
    len: u64,
}

impl ArchiveChannel {
    /// Open the archive file for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(Some(file)),
            len,
        })
    }

    /// Length of the archive file at open time.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Read as many bytes as are available at `pos`, up to `buf.len()`.
    ///
    /// Returns fewer bytes than requested only at end of file.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(pos))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Read exactly `buf.len()` bytes at `pos`.
    pub fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let n = self.read_at(buf, pos)?;
        if n != buf.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes at offset {pos}, got {n}", buf.len()),
            )));
        }
        Ok(())
    }

    /// Release the file handle; later reads fail with [`Error::Closed`].
    pub fn close(&self) {
        self.file.lock().take();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

#[derive(Debug, Default)]
struct Registry {
    readers: HashMap<u64, Arc<AtomicBool>>,
    retired: Option<PathBuf>,
}

/// One opened archive file and the readers attached to it.
#[derive(Debug)]
pub(crate) struct Generation {
    channel: ArchiveChannel,
    temps: Arc<TempFileManager>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Generation {
    pub fn new(channel: ArchiveChannel, temps: Arc<TempFileManager>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            temps,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn channel(&self) -> &ArchiveChannel {
        &self.channel
    }

    /// Attach a reader to this generation.
    pub fn register(self: &Arc<Self>) -> ReaderTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        self.registry.lock().readers.insert(id, Arc::clone(&closed));
        ReaderTicket {
            generation: Arc::clone(self),
            id,
            closed,
        }
    }

    /// Number of readers still attached.
    pub fn open_readers(&self) -> usize {
        self.registry.lock().readers.len()
    }

    /// Whether this generation's file has been renamed aside.
    pub fn is_retired(&self) -> bool {
        self.registry.lock().retired.is_some()
    }

    /// Mark the file at `path` (the renamed-aside archive) for deletion once
    /// no readers remain. Reclaims immediately if none are attached.
    pub fn retire(&self, path: PathBuf) {
        let mut registry = self.registry.lock();
        if registry.readers.is_empty() {
            drop(registry);
            self.reclaim(&path);
        } else {
            tracing::debug!(
                path = %path.display(),
                readers = registry.readers.len(),
                "deferring removal of superseded archive"
            );
            registry.retired = Some(path);
        }
    }

    /// Force every attached reader closed and reclaim a retired file.
    ///
    /// The channel of a live generation stays open; the archive still needs
    /// it for the final sync.
    pub fn close_readers(&self) {
        let retired = {
            let mut registry = self.registry.lock();
            for closed in registry.readers.values() {
                closed.store(true, Ordering::Release);
            }
            registry.readers.clear();
            registry.retired.take()
        };
        if let Some(path) = retired {
            self.reclaim(&path);
        }
    }

    fn unregister(&self, id: u64) {
        let retired = {
            let mut registry = self.registry.lock();
            registry.readers.remove(&id);
            if registry.readers.is_empty() {
                registry.retired.take()
            } else {
                None
            }
        };
        if let Some(path) = retired {
            self.reclaim(&path);
        }
    }

    fn reclaim(&self, path: &Path) {
        self.channel.close();
        match self.temps.remove(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed superseded archive"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove superseded archive")
            }
        }
    }
}

/// A reader's registration with a [`Generation`]; unregisters on drop.
#[derive(Debug)]
pub(crate) struct ReaderTicket {
    generation: Arc<Generation>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl ReaderTicket {
    #[inline]
    pub fn channel(&self) -> &ArchiveChannel {
        self.generation.channel()
    }

    /// Whether the archive force-closed this reader.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ReaderTicket {
    fn drop(&mut self) {
        self.generation.unregister(self.id);
    }
}
