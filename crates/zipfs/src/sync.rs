//! Writing pending changes back to the archive.
//!
//! A sync streams every live entry into a fresh scratch file next to the
//! archive, appends a new central directory and renames the result over the
//! archive. Unchanged entries are copied byte for byte; renamed or retimed
//! ones get a new local header in front of their original payload; staged
//! ones are written as they were compressed; channel-backed ones are
//! compressed on the way through.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use zipfs_common::crc::Crc32;

use crate::channel::ArchiveChannel;
use crate::codec::DeflateWriter;
use crate::entry::{read_local_header, Entry, EntryKind, StagedData};
use crate::fs::{Inner, State};
use crate::reader::DirectoryRecord;
use crate::zip::LocalFileHeader;
use crate::Result;

const COPY_BUF_SIZE: usize = 8192;

/// Tracks the output position, which becomes each entry's local header
/// offset.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn position(&self) -> u64 {
        self.written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `len` bytes starting at `pos` in the archive.
fn copy_range<W: Write>(channel: &ArchiveChannel, pos: u64, len: u64, out: &mut W) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0;
    while copied < len {
        let chunk = (len - copied).min(COPY_BUF_SIZE as u64) as usize;
        channel.read_exact_at(&mut buf[..chunk], pos + copied)?;
        out.write_all(&buf[..chunk])?;
        copied += chunk as u64;
    }
    Ok(())
}

impl Inner {
    /// Rebuild the archive if anything changed, returning whether it did.
    ///
    /// On success the archive file has been replaced and `state` still
    /// describes the old file; the caller either reloads it or is closing.
    /// A superseded file that still has readers is moved aside and deleted
    /// once the last of them is gone.
    pub(crate) fn sync(&self, state: &mut State) -> Result<bool> {
        state.retired.retain(|generation| generation.is_retired());
        if !state.dirty {
            return Ok(false);
        }

        let tmp = self.temps.create()?;
        let written = match self.write_archive(state, &tmp) {
            Ok(written) => written,
            Err(e) => {
                let _ = self.temps.remove(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = self.replace_archive(state, &tmp) {
            let _ = self.temps.remove(&tmp);
            return Err(e);
        }

        for entry in &written {
            if let EntryKind::Staged(StagedData::File(path)) = &entry.kind {
                if let Err(e) = self.temps.remove(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
                }
            }
        }
        state.dirty = false;
        tracing::debug!(
            path = %self.path.display(),
            entries = written.len(),
            "synced archive"
        );
        Ok(true)
    }

    /// Stream the new archive into `tmp`, returning the entries written.
    fn write_archive(&self, state: &State, tmp: &Path) -> Result<Vec<Entry>> {
        let file = File::create(tmp)?;
        let mut out = CountingWriter::new(BufWriter::new(file));
        let mut written = Vec::with_capacity(state.index.len());

        for (_, node) in state.index.iter() {
            if node.is_root() || node.is_synthesized() {
                continue;
            }
            let entry = match (&node.entry, node.cen_pos) {
                (Some(entry), _) => Ok(entry.clone()),
                (None, Some(pos)) => Entry::read_cen(
                    &state.directory.cen,
                    pos,
                    state.channel(),
                    state.directory.loc_base,
                    self.config.extended_timestamps,
                ),
                (None, None) => continue,
            };
            let result = entry.and_then(|mut entry| {
                let source = entry.locoff;
                entry.locoff = out.position();
                entry.check_header_lengths()?;
                self.write_entry(state, &mut entry, source, &mut out)?;
                // Final sizes may add a zip64 block to the central header.
                entry.check_header_lengths()?;
                Ok(entry)
            });
            match result {
                Ok(entry) => written.push(entry),
                Err(e) => tracing::warn!(
                    entry = %String::from_utf8_lossy(&node.name),
                    error = %e,
                    "skipping entry that could not be written"
                ),
            }
        }

        let cen_offset = out.position();
        for entry in &written {
            entry.write_cen(&mut out)?;
        }
        let cen_len = out.position() - cen_offset;
        DirectoryRecord::new(
            written.len() as u64,
            cen_offset,
            cen_len,
            state.directory.end.comment.clone(),
        )
        .write_to(&mut out, self.config.force_zip64_end)?;

        out.into_inner().into_inner().map_err(|e| e.into_error())?;
        Ok(written)
    }

    /// Write one entry. `source` is the entry's local header offset in the
    /// current archive, meaningful only for archive-backed entries.
    fn write_entry<W: Write>(
        &self,
        state: &State,
        entry: &mut Entry,
        source: u64,
        out: &mut W,
    ) -> Result<()> {
        let channel = state.channel();
        let pos = state.directory.loc_base + source;
        match &entry.kind {
            EntryKind::Cen => {
                // header, payload and descriptor exactly as they are
                let header = read_local_header(channel, pos)?;
                let len = LocalFileHeader::SIZE as u64
                    + header.variable_data_size() as u64
                    + entry.csize
                    + entry.descriptor_len();
                copy_range(channel, pos, len, out)?;
            }
            EntryKind::MetadataCopy => {
                let header = read_local_header(channel, pos)?;
                let data = pos + LocalFileHeader::SIZE as u64 + header.variable_data_size() as u64;
                entry.write_loc(out)?;
                copy_range(channel, data, entry.csize + entry.descriptor_len(), out)?;
            }
            EntryKind::Staged(data) => {
                entry.write_loc(out)?;
                match data {
                    StagedData::Bytes(bytes) => out.write_all(bytes)?,
                    StagedData::File(path) => {
                        io::copy(&mut File::open(path)?, out)?;
                    }
                }
                if entry.descriptor_len() != 0 {
                    entry.write_descriptor(out)?;
                }
            }
            EntryKind::RawBacked(path) => {
                let mut source = File::open(path)?;
                entry.write_loc(out)?;
                let mut crc = Crc32::new();
                let mut deflater = DeflateWriter::new(&mut *out, Arc::clone(&self.pool));
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                loop {
                    let n = source.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    crc.update(&buf[..n]);
                    deflater.write_all(&buf[..n])?;
                }
                let (size, csize) = deflater.finish()?;
                drop(deflater);
                entry.size = size;
                entry.csize = csize;
                entry.crc = crc.finalize();
                entry.write_descriptor(out)?;
            }
        }
        Ok(())
    }

    /// Move the rebuilt archive at `tmp` into place.
    fn replace_archive(&self, state: &mut State, tmp: &Path) -> Result<()> {
        if state.generation.open_readers() == 0 {
            state.channel().close();
        } else {
            let aside = self.temps.create()?;
            fs::rename(&self.path, &aside)?;
            state.generation.retire(aside);
            state.retired.push(Arc::clone(&state.generation));
        }
        fs::rename(tmp, &self.path)?;
        self.temps.untrack(tmp);
        Ok(())
    }
}
