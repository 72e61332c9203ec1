//! Streams over entry content.
//!
//! [`EntryReader`] decompresses on the fly from wherever the entry's payload
//! currently lives. [`EntryWriter`] compresses as it is written and commits a
//! staged entry when finished. [`EntryChannel`] gives random access to an
//! uncompressed scratch copy that is compressed only at sync.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use zipfs_common::crc::Crc32;
use zipfs_common::FileTime;

use crate::channel::ReaderTicket;
use crate::codec::{DeflateWriter, InflateReader};
use crate::entry::{Entry, EntryKind, StagedData};
use crate::fs::{Inner, State};
use crate::pool::CompressionPool;
use crate::zip::{flags, CompressionMethod};
use crate::{Error, Result};

/// Size and CRC-32 of a scratch file's whole content.
fn checksum_file(mut file: File) -> io::Result<(u64, u32)> {
    file.seek(SeekFrom::Start(0))?;
    let mut crc = Crc32::new();
    let mut size = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        crc.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, crc.finalize()))
}

/// Compressed payload read straight from the archive file.
struct ArchiveStream {
    ticket: ReaderTicket,
    pos: u64,
    remaining: u64,
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.ticket.is_closed() {
            return Err(Error::Closed.into());
        }
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.ticket.channel().read_at(&mut buf[..len], self.pos)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "entry data runs past the end of the archive",
            ));
        }
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reads an entry's uncompressed content.
///
/// A reader over an archive entry stays usable across a sync that replaces
/// the archive file, and fails with [`Error::Closed`] once the archive is
/// closed.
pub struct EntryReader {
    inner: Box<dyn Read + Send>,
    size: u64,
    remaining: u64,
}

impl EntryReader {
    pub(crate) fn open(pool: &Arc<CompressionPool>, state: &State, entry: &Entry) -> Result<Self> {
        let raw: Box<dyn Read + Send> = match &entry.kind {
            EntryKind::Cen | EntryKind::MetadataCopy => {
                let pos = entry.data_offset(state.channel(), state.directory.loc_base)?;
                Box::new(ArchiveStream {
                    ticket: state.generation.register(),
                    pos,
                    remaining: entry.csize,
                })
            }
            EntryKind::Staged(StagedData::Bytes(bytes)) => Box::new(Cursor::new(Arc::clone(bytes))),
            EntryKind::Staged(StagedData::File(path)) => {
                Box::new(File::open(path)?.take(entry.csize))
            }
            EntryKind::RawBacked(path) => {
                let file = File::open(path)?;
                let size = file.metadata()?.len();
                return Ok(Self {
                    inner: Box::new(file),
                    size,
                    remaining: size,
                });
            }
        };
        let inner: Box<dyn Read + Send> = match entry.method {
            CompressionMethod::Store => raw,
            CompressionMethod::Deflate => Box::new(InflateReader::new(raw, Arc::clone(pool))),
        };
        Ok(Self {
            inner,
            size: entry.size,
            remaining: entry.size,
        })
    }

    /// Uncompressed size of the entry.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..len])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "entry content shorter than its recorded size",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("size", &self.size)
            .field("remaining", &self.remaining)
            .finish()
    }
}

enum Target {
    Memory(Vec<u8>),
    File { out: BufWriter<File>, path: PathBuf },
}

impl Write for Target {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Memory(bytes) => bytes.write(buf),
            Self::File { out, .. } => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::File { out, .. } => out.flush(),
        }
    }
}

enum Sink {
    Store(Target),
    Deflate(DeflateWriter<Target>),
}

impl Sink {
    /// Finish compression, returning the target and the compressed size.
    fn finish(self, size: u64) -> io::Result<(Target, u64)> {
        match self {
            Self::Store(target) => Ok((target, size)),
            Self::Deflate(mut writer) => {
                let (_, csize) = writer.finish()?;
                let target = std::mem::replace(writer.get_mut(), Target::Memory(Vec::new()));
                Ok((target, csize))
            }
        }
    }
}

/// Writes new content for an entry.
///
/// Nothing is visible to other users of the archive until [`finish`]
/// commits the entry. Dropping an unfinished writer commits what was
/// written.
///
/// [`finish`]: EntryWriter::finish
pub struct EntryWriter {
    fs: Arc<Inner>,
    entry: Option<Entry>,
    sink: Option<Sink>,
    crc: Crc32,
    size: u64,
}

impl EntryWriter {
    pub(crate) fn new(fs: Arc<Inner>, mut entry: Entry) -> Result<Self> {
        entry.flag = flags::DATA_DESCRIPTOR | fs.new_entry_flags();
        entry.version = entry.method.version_needed();
        entry.mtime = FileTime::now();
        entry.kind = EntryKind::empty();

        let target = if fs.config.use_temp_file {
            let path = fs.temps.create()?;
            let file = OpenOptions::new().write(true).truncate(true).open(&path)?;
            Target::File {
                out: BufWriter::new(file),
                path,
            }
        } else {
            Target::Memory(Vec::with_capacity(8192))
        };
        let sink = match entry.method {
            CompressionMethod::Store => Sink::Store(target),
            CompressionMethod::Deflate => {
                Sink::Deflate(DeflateWriter::new(target, Arc::clone(&fs.pool)))
            }
        };

        Ok(Self {
            fs,
            entry: Some(entry),
            sink: Some(sink),
            crc: Crc32::new(),
            size: 0,
        })
    }

    /// Complete the content and make the entry visible.
    pub fn finish(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        let (Some(mut entry), Some(sink)) = (self.entry.take(), self.sink.take()) else {
            return Ok(());
        };
        let (target, csize) = sink.finish(self.size)?;
        let data = match target {
            Target::Memory(bytes) => StagedData::Bytes(bytes.into()),
            Target::File { out, path } => {
                out.into_inner().map_err(|e| e.into_error())?;
                StagedData::File(path)
            }
        };
        let scratch = match &data {
            StagedData::File(path) => Some(path.clone()),
            StagedData::Bytes(_) => None,
        };

        entry.kind = EntryKind::Staged(data);
        entry.size = self.size;
        entry.csize = csize;
        entry.crc = std::mem::take(&mut self.crc).finalize();

        let result = self.fs.commit(entry);
        if let (Err(_), Some(path)) = (&result, scratch) {
            let _ = self.fs.temps.remove(&path);
        }
        result
    }
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.sink.as_mut() {
            Some(Sink::Store(target)) => target.write(buf)?,
            Some(Sink::Deflate(writer)) => writer.write(buf)?,
            None => return Err(Error::Closed.into()),
        };
        self.crc.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Store(target)) => target.flush(),
            Some(Sink::Deflate(writer)) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        let Some(name) = self.entry.as_ref().map(|e| String::from_utf8_lossy(&e.name).into_owned())
        else {
            return;
        };
        if let Err(e) = self.commit() {
            tracing::warn!(entry = %name, error = %e, "failed to commit entry on drop");
        }
    }
}

impl std::fmt::Debug for EntryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryWriter")
            .field("entry", &self.entry.as_ref().map(|e| String::from_utf8_lossy(&e.name)))
            .field("size", &self.size)
            .finish()
    }
}

/// Random access to an entry's uncompressed content.
///
/// A writable channel commits the entry when closed; its content is
/// compressed when the archive is synced.
pub struct EntryChannel {
    fs: Arc<Inner>,
    file: Option<File>,
    path: PathBuf,
    entry: Option<Entry>,
    /// Scratch file belongs to an entry and outlives the channel.
    shared: bool,
}

impl EntryChannel {
    pub(crate) fn open(
        fs: Arc<Inner>,
        path: PathBuf,
        entry: Option<Entry>,
        shared: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(entry.is_some())
            .open(&path)?;
        Ok(Self {
            fs,
            file: Some(file),
            path,
            entry,
            shared,
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| Error::Closed.into())
    }

    pub fn is_writable(&self) -> bool {
        self.entry.is_some()
    }

    /// Current length of the content.
    pub fn len(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the content.
    pub fn set_len(&self, len: u64) -> Result<()> {
        if !self.is_writable() {
            return Err(not_writable().into());
        }
        let file = self.file.as_ref().ok_or(Error::Closed)?;
        file.set_len(len)?;
        Ok(())
    }

    /// Close the channel, committing the entry if it was opened for writing.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        match self.entry.take() {
            Some(mut entry) => {
                let (size, crc) = checksum_file(file)?;
                entry.size = size;
                entry.crc = crc;
                entry.mtime = FileTime::now();
                self.fs.commit(entry)
            }
            None => {
                drop(file);
                if !self.shared {
                    self.fs.temps.remove(&self.path)?;
                }
                Ok(())
            }
        }
    }
}

fn not_writable() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "channel is not open for writing")
}

impl Read for EntryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Write for EntryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_writable() {
            return Err(not_writable());
        }
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Seek for EntryChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

impl std::fmt::Debug for EntryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryChannel")
            .field("path", &self.path)
            .field("writable", &self.is_writable())
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl Drop for EntryChannel {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to close entry channel");
        }
    }
}
