//! The filesystem view over one archive.
//!
//! All index access goes through a single reader/writer lock. Lookups and
//! opening read streams take it shared; anything that can reshape the tree
//! or change an entry takes it exclusively, as does directory listing. Open
//! streams never hold the lock: writers take it again only for the moment
//! they commit.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use zipfs_common::FileTime;

use crate::channel::{ArchiveChannel, Generation};
use crate::config::ZipFsConfig;
use crate::entry::{Entry, EntryAttributes, EntryKind, StagedData};
use crate::index::{self, DirectoryIndex, NodeId};
use crate::pool::CompressionPool;
use crate::reader::{ArchiveReader, CentralDirectory, DirectoryRecord};
use crate::stream::{EntryChannel, EntryReader, EntryWriter};
use crate::temp::TempFileManager;
use crate::zip::{flags, CompressionMethod, MAX_FIELD_LEN};
use crate::{Error, Result};

/// Options for [`ZipFileSystem::copy`] and [`ZipFileSystem::rename`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Replace an existing target instead of failing.
    pub replace_existing: bool,
    /// Keep the source's timestamps; otherwise the target is stamped now.
    pub copy_attributes: bool,
}

/// Options for [`ZipFileSystem::open_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Create the entry if it does not exist.
    pub create: bool,
    /// Fail if the entry already exists.
    pub create_new: bool,
    /// Start from the entry's current content.
    pub append: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create: true,
            create_new: false,
            append: false,
        }
    }
}

/// Options for [`ZipFileSystem::open_channel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    path: String,
    file_name: String,
    is_dir: bool,
}

impl DirEntry {
    /// Absolute path inside the archive, e.g. `/dir/b.txt`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

/// Index and file state guarded by the structural lock.
#[derive(Debug)]
pub(crate) struct State {
    pub index: DirectoryIndex,
    pub directory: CentralDirectory,
    pub generation: Arc<Generation>,
    /// Superseded files still being read.
    pub retired: Vec<Arc<Generation>>,
    pub dirty: bool,
    pub closed: bool,
}

impl State {
    pub fn load(path: &Path, temps: &Arc<TempFileManager>) -> Result<Self> {
        let channel = ArchiveChannel::open(path)?;
        let directory = ArchiveReader::new(&channel).read_central_directory()?;
        let index = DirectoryIndex::build(&directory);
        Ok(Self {
            index,
            directory,
            generation: Generation::new(channel, Arc::clone(temps)),
            retired: Vec::new(),
            dirty: false,
            closed: false,
        })
    }

    #[inline]
    pub fn channel(&self) -> &ArchiveChannel {
        self.generation.channel()
    }

    fn lookup(&self, key: &[u8]) -> Result<NodeId> {
        self.index.find(key).ok_or_else(|| Error::not_found(key))
    }

    fn is_dir(&self, id: NodeId) -> bool {
        self.index.get(id).is_some_and(|node| node.is_dir())
    }

    /// The entry behind a node: its pending replacement, or its archive
    /// record decoded. `None` for the root and synthesized directories.
    pub fn resolve(&self, id: NodeId, extended_timestamps: bool) -> Result<Option<Entry>> {
        let Some(node) = self.index.get(id) else {
            return Ok(None);
        };
        if let Some(entry) = &node.entry {
            return Ok(Some(entry.clone()));
        }
        match node.cen_pos {
            Some(pos) => Entry::read_cen(
                &self.directory.cen,
                pos,
                self.channel(),
                self.directory.loc_base,
                extended_timestamps,
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// The parent of `key` must exist and be a directory.
    fn check_parent(&self, key: &[u8]) -> Result<()> {
        let parent = index::parent_of(key);
        match self.index.find(parent) {
            Some(id) if self.is_dir(id) => Ok(()),
            Some(_) => Err(Error::NotDirectory(
                String::from_utf8_lossy(parent).into_owned(),
            )),
            None => Err(Error::not_found(parent)),
        }
    }
}

pub(crate) struct Inner {
    pub path: PathBuf,
    pub config: ZipFsConfig,
    read_only: bool,
    open: AtomicBool,
    pub state: RwLock<State>,
    pub pool: Arc<CompressionPool>,
    pub temps: Arc<TempFileManager>,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// General purpose flags for a newly created entry.
    pub fn new_entry_flags(&self) -> u16 {
        if self.config.utf8_names {
            flags::UTF8
        } else {
            0
        }
    }

    fn directory_entry(&self, name: Vec<u8>) -> Entry {
        let mut entry = Entry::new(name, EntryKind::empty(), CompressionMethod::Store);
        entry.flag = self.new_entry_flags();
        entry
    }

    /// Make a finished entry visible, replacing whatever held its name.
    ///
    /// Streams still commit while the archive is closing, up to the final
    /// sync.
    pub fn commit(&self, entry: Entry) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(Error::Closed);
        }
        tracing::trace!(entry = %String::from_utf8_lossy(&entry.name), "committing entry");
        let (_, previous) = state.index.insert(entry);
        if let Some(previous) = previous {
            self.release_scratch(&previous);
        }
        state.dirty = true;
        Ok(())
    }

    /// Delete the staging file of an entry that is no longer referenced.
    ///
    /// Channel scratch files may still be open elsewhere and are left for
    /// close.
    pub fn release_scratch(&self, entry: &Entry) {
        if let EntryKind::Staged(StagedData::File(path)) = &entry.kind {
            if let Err(e) = self.temps.remove(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
            }
        }
    }

    fn copy_scratch(&self, source: &Path) -> Result<PathBuf> {
        let copy = self.temps.create()?;
        if let Err(e) = fs::copy(source, &copy) {
            let _ = self.temps.remove(&copy);
            return Err(e.into());
        }
        Ok(copy)
    }
}

/// Normalize a caller's path to an index key: no leading or trailing `/`,
/// the root being the empty key.
fn index_key(path: &str) -> Vec<u8> {
    path.trim_matches('/').as_bytes().to_vec()
}

/// Names are stored with a 16-bit length.
fn check_name_len(len: usize) -> Result<()> {
    if len > MAX_FIELD_LEN {
        return Err(Error::InvalidInput(format!(
            "entry name is {len} bytes, at most {MAX_FIELD_LEN} are allowed"
        )));
    }
    Ok(())
}

fn with_slash(mut key: Vec<u8>) -> Vec<u8> {
    key.push(b'/');
    key
}

/// A mutable filesystem view over a ZIP archive.
///
/// Changes are staged in memory or scratch files and written back to the
/// archive by [`flush`](Self::flush) or [`close`](Self::close), which build
/// a new archive next to the old one and rename it into place.
///
/// # Example
///
/// ```no_run
/// use std::io::{Read, Write};
/// use zipfs::{WriteOptions, ZipFileSystem};
///
/// let fs = ZipFileSystem::open("bundle.zip")?;
/// let mut writer = fs.open_write("/notes.txt", WriteOptions::default())?;
/// writer.write_all(b"hello")?;
/// writer.finish()?;
///
/// let mut text = String::new();
/// fs.open_read("/notes.txt")?.read_to_string(&mut text)?;
/// fs.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ZipFileSystem {
    inner: Arc<Inner>,
}

impl ZipFileSystem {
    /// Open an existing archive with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ZipFsConfig::default())
    }

    /// Open an archive, creating an empty one first if `config.create` is
    /// set and the file does not exist.
    pub fn open_with<P: AsRef<Path>>(path: P, config: ZipFsConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if !config.create {
                return Err(Error::NotFound(path.display().to_string()));
            }
            let mut file = File::create(&path)?;
            DirectoryRecord::default().write_to(&mut file, false)?;
            tracing::debug!(path = %path.display(), "created empty archive");
        }

        let writable = !fs::metadata(&path)?.permissions().readonly();
        let read_only = config.read_only || !writable;
        let temps = Arc::new(TempFileManager::new(&path));
        let state = State::load(&path, &temps)?;

        tracing::debug!(
            path = %path.display(),
            entries = state.directory.records.len(),
            zip64 = state.directory.end.zip64,
            read_only,
            "opened archive"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                config,
                read_only,
                open: AtomicBool::new(true),
                state: RwLock::new(state),
                pool: Arc::new(CompressionPool::new()),
                temps,
            }),
        })
    }

    /// Path of the archive file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.state.read().index.find(&index_key(path)).is_some())
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        let state = self.inner.state.read();
        Ok(state.index.find(&index_key(path)).is_some_and(|id| state.is_dir(id)))
    }

    /// Size, checksum, method and timestamps of an entry.
    pub fn metadata(&self, path: &str) -> Result<EntryAttributes> {
        self.inner.ensure_open()?;
        let state = self.inner.state.read();
        let id = state.lookup(&index_key(path))?;
        Ok(state
            .resolve(id, self.inner.config.extended_timestamps)?
            .map_or_else(EntryAttributes::synthesized_dir, |entry| entry.attributes()))
    }

    /// List the children of a directory.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.inner.ensure_open()?;
        let key = index_key(path);
        let state = self.inner.state.write();
        let id = state.lookup(&key)?;
        if !state.is_dir(id) {
            return Err(Error::NotDirectory(path.to_string()));
        }

        let entries = state
            .index
            .children(id)
            .iter()
            .filter_map(|&child| state.index.get(child))
            .map(|node| {
                let name = node.name.strip_suffix(b"/").unwrap_or(&node.name);
                DirEntry {
                    path: format!("/{}", String::from_utf8_lossy(name)),
                    file_name: String::from_utf8_lossy(index::file_name(&node.name)).into_owned(),
                    is_dir: node.is_dir(),
                }
            })
            .collect();
        Ok(entries)
    }

    /// Create an empty directory. Its parent must exist.
    pub fn create_directory(&self, path: &str) -> Result<()> {
        self.inner.ensure_writable()?;
        let key = index_key(path);
        check_name_len(key.len() + 1)?;
        let mut state = self.inner.state.write();
        if key.is_empty() || state.index.find(&key).is_some() {
            return Err(Error::already_exists(&key));
        }
        state.check_parent(&key)?;

        state.index.insert(self.inner.directory_entry(with_slash(key)));
        state.dirty = true;
        Ok(())
    }

    /// Delete an entry or empty directory.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.remove(path, true).map(|_| ())
    }

    /// Delete an entry if it exists, returning whether it did.
    pub fn delete_if_exists(&self, path: &str) -> Result<bool> {
        self.remove(path, false)
    }

    fn remove(&self, path: &str, must_exist: bool) -> Result<bool> {
        self.inner.ensure_writable()?;
        let key = index_key(path);
        if key.is_empty() {
            return Err(Error::InvalidInput("cannot delete the root directory".into()));
        }
        let mut state = self.inner.state.write();
        let Some(id) = state.index.find(&key) else {
            return if must_exist {
                Err(Error::not_found(&key))
            } else {
                Ok(false)
            };
        };
        if !state.index.children(id).is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        if let Some(entry) = state.index.remove(id).and_then(|node| node.entry) {
            self.inner.release_scratch(&entry);
        }
        state.dirty = true;
        Ok(true)
    }

    /// Copy an entry. Copying a directory creates an empty directory at the
    /// target; payload bytes of archive entries are reused as they are.
    pub fn copy(&self, src: &str, dst: &str, options: CopyOptions) -> Result<()> {
        self.transfer(src, dst, options, false)
    }

    /// Move an entry. Directories can only be moved while empty.
    pub fn rename(&self, src: &str, dst: &str, options: CopyOptions) -> Result<()> {
        self.transfer(src, dst, options, true)
    }

    fn transfer(&self, src: &str, dst: &str, options: CopyOptions, move_src: bool) -> Result<()> {
        self.inner.ensure_writable()?;
        let (src_key, dst_key) = (index_key(src), index_key(dst));
        if src_key == dst_key {
            return Ok(());
        }
        if src_key.is_empty() {
            return Err(Error::InvalidInput("cannot copy or move the root directory".into()));
        }
        if dst_key.is_empty() {
            return Err(Error::already_exists(&dst_key));
        }

        let mut state = self.inner.state.write();
        let src_id = state.lookup(&src_key)?;
        check_name_len(dst_key.len() + state.is_dir(src_id) as usize)?;
        let dst_id = state.index.find(&dst_key);
        match dst_id {
            Some(_) if !options.replace_existing => return Err(Error::already_exists(&dst_key)),
            Some(id) if !state.index.children(id).is_empty() => {
                return Err(Error::NotEmpty(dst.to_string()))
            }
            Some(_) => {}
            None => state.check_parent(&dst_key)?,
        }

        let source = state.resolve(src_id, self.inner.config.extended_timestamps)?;
        let mut entry = if state.is_dir(src_id) {
            if move_src && !state.index.children(src_id).is_empty() {
                return Err(Error::NotEmpty(src.to_string()));
            }
            let mut entry = self.inner.directory_entry(with_slash(dst_key));
            if let (true, Some(source)) = (options.copy_attributes, &source) {
                entry.mtime = source.mtime;
                entry.atime = source.atime;
                entry.ctime = source.ctime;
            }
            entry
        } else {
            let source = source.ok_or_else(|| Error::not_found(&src_key))?;
            let mut entry = source.clone();
            entry.name = dst_key;
            entry.kind = match source.kind {
                EntryKind::Cen | EntryKind::MetadataCopy => EntryKind::MetadataCopy,
                EntryKind::Staged(StagedData::File(path)) if !move_src => {
                    EntryKind::Staged(StagedData::File(self.inner.copy_scratch(&path)?))
                }
                EntryKind::RawBacked(path) if !move_src => {
                    EntryKind::RawBacked(self.inner.copy_scratch(&path)?)
                }
                kind => kind,
            };
            if !options.copy_attributes {
                let now = FileTime::now();
                entry.mtime = now;
                entry.atime = Some(now);
                entry.ctime = Some(now);
            }
            entry
        };

        if let Some(id) = dst_id {
            if let Some(replaced) = state.index.remove(id).and_then(|node| node.entry) {
                self.inner.release_scratch(&replaced);
            }
        }
        if move_src {
            state.index.remove(src_id);
        }
        state.index.insert(entry);
        state.dirty = true;
        Ok(())
    }

    /// Set any of an entry's timestamps. Archive entries keep their payload
    /// and only have their headers rewritten at sync.
    pub fn set_times(
        &self,
        path: &str,
        mtime: Option<FileTime>,
        atime: Option<FileTime>,
        ctime: Option<FileTime>,
    ) -> Result<()> {
        self.inner.ensure_writable()?;
        let key = index_key(path);
        let mut state = self.inner.state.write();
        let id = state.lookup(&key)?;
        let mut entry = match state.resolve(id, self.inner.config.extended_timestamps)? {
            Some(entry) => entry,
            None if key.is_empty() => {
                return Err(Error::InvalidInput("the root directory has no timestamps".into()))
            }
            // a directory implied by its children gets a record of its own
            None => self.inner.directory_entry(with_slash(key)),
        };
        if matches!(entry.kind, EntryKind::Cen) {
            entry.kind = EntryKind::MetadataCopy;
        }
        if let Some(mtime) = mtime {
            entry.mtime = mtime;
        }
        entry.atime = atime.or(entry.atime);
        entry.ctime = ctime.or(entry.ctime);

        state.index.insert(entry);
        state.dirty = true;
        Ok(())
    }

    /// Open an entry for reading.
    pub fn open_read(&self, path: &str) -> Result<EntryReader> {
        self.inner.ensure_open()?;
        let state = self.inner.state.read();
        let id = state.lookup(&index_key(path))?;
        if state.is_dir(id) {
            return Err(Error::IsDirectory(path.to_string()));
        }
        let entry = state
            .resolve(id, self.inner.config.extended_timestamps)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        EntryReader::open(&self.inner.pool, &state, &entry)
    }

    /// Open an entry for writing. The new content replaces the entry when
    /// the writer is finished.
    pub fn open_write(&self, path: &str, options: WriteOptions) -> Result<EntryWriter> {
        self.inner.ensure_writable()?;
        let key = index_key(path);
        if key.is_empty() {
            return Err(Error::already_exists(&key));
        }
        check_name_len(key.len())?;

        let state = self.inner.state.read();
        let (template, existing) = match state.index.find(&key) {
            Some(id) => {
                if state.is_dir(id) || options.create_new {
                    return Err(Error::already_exists(&key));
                }
                let existing = state
                    .resolve(id, self.inner.config.extended_timestamps)?
                    .ok_or_else(|| Error::not_found(&key))?;
                let mut template = existing.clone();
                template.name = key;
                (template, Some(existing))
            }
            None => {
                if !options.create && !options.create_new {
                    return Err(Error::not_found(&key));
                }
                state.check_parent(&key)?;
                let entry = Entry::new(key, EntryKind::empty(), self.inner.config.compression);
                (entry, None)
            }
        };
        let previous = match (&existing, options.append) {
            (Some(existing), true) => Some(EntryReader::open(&self.inner.pool, &state, existing)?),
            _ => None,
        };
        drop(state);

        let mut writer = EntryWriter::new(Arc::clone(&self.inner), template)?;
        if let Some(mut previous) = previous {
            io::copy(&mut previous, &mut writer)?;
        }
        Ok(writer)
    }

    /// Open a random-access channel on an entry's uncompressed content.
    pub fn open_channel(&self, path: &str, options: ChannelOptions) -> Result<EntryChannel> {
        if options.write {
            self.inner.ensure_writable()?;
        } else {
            self.inner.ensure_open()?;
        }
        let key = index_key(path);
        if options.write {
            check_name_len(key.len())?;
        }

        let state = self.inner.state.read();
        let found = state.index.find(&key);
        match found {
            Some(id) if options.write && (options.create_new || state.is_dir(id)) => {
                return Err(Error::already_exists(&key));
            }
            Some(id) if !options.write && state.is_dir(id) => {
                return Err(Error::IsDirectory(path.to_string()));
            }
            Some(_) => {}
            None if options.write && (options.create || options.create_new) => {
                state.check_parent(&key)?;
            }
            None => return Err(Error::not_found(&key)),
        }

        let existing = match found {
            Some(id) => state.resolve(id, self.inner.config.extended_timestamps)?,
            None => None,
        };
        let (scratch, shared) = match existing.as_ref().map(|e| &e.kind) {
            Some(EntryKind::RawBacked(path)) => (path.clone(), true),
            _ => {
                let scratch = match &existing {
                    Some(entry) => {
                        let mut reader = EntryReader::open(&self.inner.pool, &state, entry)?;
                        self.inner.temps.create_from(&mut reader)?
                    }
                    None => self.inner.temps.create()?,
                };
                (scratch, false)
            }
        };
        drop(state);

        let entry = options.write.then(|| {
            let kind = EntryKind::RawBacked(scratch.clone());
            let mut entry = existing.unwrap_or_else(|| {
                Entry::new(key.clone(), kind.clone(), CompressionMethod::Deflate)
            });
            entry.name = key;
            entry.kind = kind;
            entry.method = CompressionMethod::Deflate;
            entry.flag = flags::DATA_DESCRIPTOR | self.inner.new_entry_flags();
            entry
        });
        EntryChannel::open(Arc::clone(&self.inner), scratch, entry, shared)
    }

    /// Write pending changes back to the archive now.
    ///
    /// The rebuilt archive is re-indexed, so later reads see the new layout.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.write();
        if self.inner.sync(&mut state)? {
            let retired = std::mem::take(&mut state.retired);
            *state = State::load(&self.inner.path, &self.inner.temps)?;
            state.retired = retired;
        }
        Ok(())
    }

    /// Write pending changes back and release every resource.
    ///
    /// Read streams still open are closed. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        {
            let _state = self.inner.state.write();
            if !self.inner.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
        }

        let mut state = self.inner.state.write();
        state.generation.close_readers();
        for generation in state.retired.drain(..) {
            generation.close_readers();
        }
        let synced = self.inner.sync(&mut state);
        state.channel().close();
        state.closed = true;
        drop(state);

        self.inner.pool.clear();
        let cleaned = self.inner.temps.cleanup();
        tracing::debug!(path = %self.inner.path.display(), "closed archive");

        synced?;
        cleaned?;
        Ok(())
    }
}

impl Drop for ZipFileSystem {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                tracing::warn!(path = %self.inner.path.display(), error = %e, "failed to close archive");
            }
        }
    }
}

impl std::fmt::Debug for ZipFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipFileSystem")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.read_only)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ArchiveBuilder, FIXTURE_MTIME};
    use std::io::{Read, Seek, SeekFrom, Write};

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("test.zip");
        ArchiveBuilder::new()
            .file("a.txt", b"alpha alpha alpha")
            .stored("dir/b.txt", b"beta")
            .dir("empty/")
            .comment(b"kept comment")
            .write(&path);
        path
    }

    fn read_all(fs: &ZipFileSystem, path: &str) -> Vec<u8> {
        let mut data = Vec::new();
        fs.open_read(path).unwrap().read_to_end(&mut data).unwrap();
        data
    }

    fn write_all(fs: &ZipFileSystem, path: &str, data: &[u8]) {
        let mut writer = fs.open_write(path, WriteOptions::default()).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    fn scratch_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("zipfstmp"))
            .count()
    }

    #[test]
    fn test_read_entries() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
        assert_eq!(read_all(&fs, "dir/b.txt"), b"beta");
        assert!(fs.is_directory("/dir").unwrap());
        assert!(fs.is_directory("/empty/").unwrap());
        assert!(!fs.exists("/missing").unwrap());

        let meta = fs.metadata("/a.txt").unwrap();
        assert_eq!(meta.size, 17);
        assert_eq!(meta.method, CompressionMethod::Deflate);
        assert_eq!(meta.modified, Some(FIXTURE_MTIME));
        assert!(matches!(fs.open_read("/dir"), Err(Error::IsDirectory(_))));
    }

    #[test]
    fn test_read_dir_includes_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        let mut root: Vec<_> = fs.read_dir("/").unwrap();
        root.sort_by(|a, b| a.path().cmp(b.path()));
        let paths: Vec<_> = root.iter().map(|e| (e.path(), e.is_dir())).collect();
        assert_eq!(paths, vec![("/a.txt", false), ("/dir", true), ("/empty", true)]);

        let children = fs.read_dir("/dir").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].file_name(), "b.txt");
        assert!(fs.metadata("/dir").unwrap().is_dir);
        assert!(matches!(fs.read_dir("/a.txt"), Err(Error::NotDirectory(_))));
    }

    #[test]
    fn test_write_visible_before_and_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();

        write_all(&fs, "/c.txt", b"hi");
        assert_eq!(read_all(&fs, "/c.txt"), b"hi");
        fs.flush().unwrap();
        assert_eq!(read_all(&fs, "/c.txt"), b"hi");
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        let meta = fs.metadata("/c.txt").unwrap();
        assert_eq!(meta.size, 2);
        assert_eq!(meta.crc, 0xD893_2AAC);
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
    }

    #[test]
    fn test_write_through_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ZipFsConfig {
            use_temp_file: true,
            ..ZipFsConfig::default()
        };
        let fs = ZipFileSystem::open_with(fixture(dir.path()), config).unwrap();

        let data = b"scratch staged content ".repeat(100);
        write_all(&fs, "/dir/big.txt", &data);
        assert_eq!(scratch_files(dir.path()), 1);
        assert_eq!(read_all(&fs, "/dir/big.txt"), data);

        fs.flush().unwrap();
        assert_eq!(scratch_files(dir.path()), 0);
        assert_eq!(read_all(&fs, "/dir/big.txt"), data);
    }

    #[test]
    fn test_dropped_writer_commits() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();
        {
            let mut writer = fs.open_write("/dropped.txt", WriteOptions::default()).unwrap();
            writer.write_all(b"still here").unwrap();
        }
        assert_eq!(read_all(&fs, "/dropped.txt"), b"still here");
    }

    #[test]
    fn test_open_write_options() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        let create_new = WriteOptions {
            create_new: true,
            ..WriteOptions::default()
        };
        assert!(matches!(fs.open_write("/a.txt", create_new), Err(Error::AlreadyExists(_))));

        let no_create = WriteOptions {
            create: false,
            ..WriteOptions::default()
        };
        assert!(matches!(fs.open_write("/new.txt", no_create), Err(Error::NotFound(_))));
        assert!(matches!(
            fs.open_write("/nope/new.txt", WriteOptions::default()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fs.open_write("/a.txt/child", WriteOptions::default()),
            Err(Error::NotDirectory(_))
        ));
        assert!(matches!(fs.open_write("/dir", WriteOptions::default()), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        let append = WriteOptions {
            append: true,
            ..WriteOptions::default()
        };
        let mut writer = fs.open_write("/dir/b.txt", append).unwrap();
        writer.write_all(b" gamma").unwrap();
        writer.finish().unwrap();

        assert_eq!(read_all(&fs, "/dir/b.txt"), b"beta gamma");
        // an existing entry keeps its method
        assert_eq!(fs.metadata("/dir/b.txt").unwrap().method, CompressionMethod::Store);
        fs.flush().unwrap();
        assert_eq!(read_all(&fs, "/dir/b.txt"), b"beta gamma");
    }

    #[test]
    fn test_create_and_delete_directories() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        fs.create_directory("/dir/sub").unwrap();
        assert!(fs.is_directory("/dir/sub").unwrap());
        assert!(matches!(fs.create_directory("/dir/sub"), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.create_directory("/x/y"), Err(Error::NotFound(_))));

        assert!(matches!(fs.delete("/dir"), Err(Error::NotEmpty(_))));
        fs.delete("/dir/sub").unwrap();
        fs.delete("/dir/b.txt").unwrap();
        // the synthesized parent has no children left
        fs.delete("/dir").unwrap();
        assert!(!fs.exists("/dir").unwrap());
        assert!(!fs.delete_if_exists("/dir").unwrap());
        assert!(matches!(fs.delete("/"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_rename_reuses_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let before = std::fs::read(&path).unwrap();
        let fs = ZipFileSystem::open(&path).unwrap();

        fs.rename("/a.txt", "/dir/moved.txt", CopyOptions::default()).unwrap();
        assert!(!fs.exists("/a.txt").unwrap());
        assert_eq!(read_all(&fs, "/dir/moved.txt"), b"alpha alpha alpha");
        fs.close().unwrap();

        let payload = {
            let fs = ZipFileSystem::open(&path).unwrap();
            let meta = fs.metadata("/dir/moved.txt").unwrap();
            assert_eq!(meta.method, CompressionMethod::Deflate);
            meta.compressed_size.unwrap() as usize
        };
        let after = std::fs::read(&path).unwrap();
        // compressed bytes are copied, never recompressed
        let start = 30 + "a.txt".len();
        let original = &before[start..start + payload];
        assert!(testutil::find(&after, original).is_some());
    }

    #[test]
    fn test_copy_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        fs.copy("/a.txt", "/copy.txt", CopyOptions::default()).unwrap();
        assert_eq!(read_all(&fs, "/copy.txt"), b"alpha alpha alpha");
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");

        assert!(matches!(
            fs.copy("/dir/b.txt", "/copy.txt", CopyOptions::default()),
            Err(Error::AlreadyExists(_))
        ));
        let replace = CopyOptions {
            replace_existing: true,
            copy_attributes: true,
        };
        fs.copy("/dir/b.txt", "/copy.txt", replace).unwrap();
        assert_eq!(read_all(&fs, "/copy.txt"), b"beta");
        assert_eq!(fs.metadata("/copy.txt").unwrap().modified, Some(FIXTURE_MTIME));

        fs.copy("/dir", "/dir2", CopyOptions::default()).unwrap();
        assert!(fs.read_dir("/dir2").unwrap().is_empty());
        assert!(matches!(
            fs.rename("/dir", "/dir3", CopyOptions::default()),
            Err(Error::NotEmpty(_))
        ));

        fs.flush().unwrap();
        assert_eq!(read_all(&fs, "/copy.txt"), b"beta");
        assert!(fs.is_directory("/dir2").unwrap());
    }

    #[test]
    fn test_set_times_survives_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();

        let mtime = FileTime::from_millis(1_600_000_000_000);
        let atime = FileTime::from_millis(1_600_000_100_000);
        fs.set_times("/a.txt", Some(mtime), Some(atime), None).unwrap();
        fs.set_times("/dir", Some(mtime), None, None).unwrap();
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        let meta = fs.metadata("/a.txt").unwrap();
        assert_eq!(meta.modified, Some(mtime));
        assert_eq!(meta.accessed, Some(atime));
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
        assert_eq!(fs.metadata("/dir").unwrap().modified, Some(mtime));
    }

    #[test]
    fn test_channel_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();

        let options = ChannelOptions {
            write: true,
            create: true,
            ..ChannelOptions::default()
        };
        let mut channel = fs.open_channel("/a.txt", options).unwrap();
        assert_eq!(channel.len().unwrap(), 17);
        channel.seek(SeekFrom::Start(6)).unwrap();
        channel.write_all(b"ALPHA").unwrap();
        channel.close().unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha ALPHA alpha");
        let meta = fs.metadata("/a.txt").unwrap();
        assert_eq!(meta.size, 17);
        assert_eq!(meta.crc, zipfs_common::crc::checksum(b"alpha ALPHA alpha"));
        assert_eq!(meta.compressed_size, None);

        let mut channel = fs.open_channel("/new.bin", options).unwrap();
        channel.write_all(&[7u8; 1000]).unwrap();
        channel.set_len(10).unwrap();
        channel.close().unwrap();

        let mut reader = fs.open_channel("/a.txt", ChannelOptions::default()).unwrap();
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "alpha ALPHA alpha");
        assert!(reader.write_all(b"x").is_err());
        drop(reader);

        fs.close().unwrap();
        assert_eq!(scratch_files(dir.path()), 0);

        let fs = ZipFileSystem::open(&path).unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha ALPHA alpha");
        assert_eq!(read_all(&fs, "/new.bin"), [7u8; 10]);
        let meta = fs.metadata("/new.bin").unwrap();
        assert_eq!(meta.method, CompressionMethod::Deflate);
        assert_eq!(meta.crc, zipfs_common::crc::checksum(&[7u8; 10]));
        assert!(meta.compressed_size.is_some());
        let meta = fs.metadata("/a.txt").unwrap();
        assert_eq!(meta.crc, zipfs_common::crc::checksum(b"alpha ALPHA alpha"));
    }

    #[test]
    fn test_reader_survives_flush() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        let mut reader = fs.open_read("/a.txt").unwrap();
        fs.delete("/a.txt").unwrap();
        fs.flush().unwrap();
        // the superseded file is kept aside for the open reader
        assert_eq!(scratch_files(dir.path()), 1);

        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"alpha alpha alpha");
        drop(reader);
        assert_eq!(scratch_files(dir.path()), 0);
        assert!(!fs.exists("/a.txt").unwrap());
    }

    #[test]
    fn test_close_fails_open_readers() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ZipFileSystem::open(fixture(dir.path())).unwrap();

        let mut reader = fs.open_read("/a.txt").unwrap();
        fs.close().unwrap();
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());

        assert!(!fs.is_open());
        assert!(matches!(fs.exists("/a.txt"), Err(Error::Closed)));
        assert!(matches!(fs.open_read("/a.txt"), Err(Error::Closed)));
        fs.close().unwrap();
    }

    #[test]
    fn test_read_only_rejects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let before = std::fs::read(&path).unwrap();
        let config = ZipFsConfig {
            read_only: true,
            ..ZipFsConfig::default()
        };
        let fs = ZipFileSystem::open_with(&path, config).unwrap();

        assert!(fs.is_read_only());
        assert!(matches!(fs.delete("/a.txt"), Err(Error::ReadOnly)));
        assert!(matches!(fs.create_directory("/x"), Err(Error::ReadOnly)));
        assert!(matches!(
            fs.open_write("/x.txt", WriteOptions::default()),
            Err(Error::ReadOnly)
        ));
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
        fs.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_unchanged_archive_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let before = std::fs::read(&path).unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
        fs.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_create_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.zip");
        assert!(matches!(ZipFileSystem::open(&path), Err(Error::NotFound(_))));

        let config = ZipFsConfig {
            create: true,
            compression: CompressionMethod::Store,
            ..ZipFsConfig::default()
        };
        let fs = ZipFileSystem::open_with(&path, config).unwrap();
        assert!(fs.read_dir("/").unwrap().is_empty());
        write_all(&fs, "/stored.txt", b"plain");
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        let meta = fs.metadata("/stored.txt").unwrap();
        assert_eq!(meta.method, CompressionMethod::Store);
        assert_eq!(meta.compressed_size, Some(5));
    }

    #[test]
    fn test_comment_and_stub_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.zip");
        ArchiveBuilder::new()
            .file("a.txt", b"alpha")
            .comment(b"archive comment")
            .prefix(b"#!/bin/sh\nexit 0\n")
            .write(&path);

        let fs = ZipFileSystem::open(&path).unwrap();
        write_all(&fs, "/b.txt", b"beta");
        fs.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(&crate::zip::LocalFileHeader::MAGIC));
        assert!(bytes.ends_with(b"archive comment"));
        let fs = ZipFileSystem::open(&path).unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha");
        assert_eq!(read_all(&fs, "/b.txt"), b"beta");
    }

    #[test]
    fn test_sync_skips_unreadable_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();

        let mut lost = Entry::new(
            b"lost.txt".to_vec(),
            EntryKind::RawBacked(dir.path().join("vanished")),
            CompressionMethod::Deflate,
        );
        lost.flag = flags::DATA_DESCRIPTOR;
        fs.inner.commit(lost).unwrap();
        write_all(&fs, "/kept.txt", b"kept");
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        assert!(!fs.exists("/lost.txt").unwrap());
        assert_eq!(read_all(&fs, "/kept.txt"), b"kept");
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
    }

    #[test]
    fn test_overlong_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();
        let long = format!("/{}", "n".repeat(MAX_FIELD_LEN + 1));
        let longest_dir = format!("/{}", "d".repeat(MAX_FIELD_LEN));

        assert!(matches!(
            fs.open_write(&long, WriteOptions::default()),
            Err(Error::InvalidInput(_))
        ));
        let options = ChannelOptions {
            write: true,
            create: true,
            ..ChannelOptions::default()
        };
        assert!(matches!(fs.open_channel(&long, options), Err(Error::InvalidInput(_))));
        // The trailing slash pushes this one over.
        assert!(matches!(fs.create_directory(&longest_dir), Err(Error::InvalidInput(_))));
        assert!(matches!(
            fs.copy("/a.txt", &long, CopyOptions::default()),
            Err(Error::InvalidInput(_))
        ));
        assert!(!fs.exists(&long).unwrap());

        write_all(&fs, "/keep.txt", b"keep");
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        assert_eq!(read_all(&fs, "/keep.txt"), b"keep");
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha alpha alpha");
    }

    #[test]
    fn test_sync_skips_entry_with_overlong_extra() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let fs = ZipFileSystem::open(&path).unwrap();

        let mut bloated = Entry::new(
            b"bloated.txt".to_vec(),
            EntryKind::Staged(StagedData::Bytes(Arc::from(b"data".to_vec()))),
            CompressionMethod::Store,
        );
        // An unknown extra block that fills the whole 16-bit length.
        let mut extra = vec![0xAD, 0xDE];
        extra.extend_from_slice(&((MAX_FIELD_LEN - 4) as u16).to_le_bytes());
        extra.resize(MAX_FIELD_LEN, 0);
        bloated.extra = extra;
        fs.inner.commit(bloated).unwrap();
        write_all(&fs, "/kept.txt", b"kept");
        fs.close().unwrap();

        let fs = ZipFileSystem::open(&path).unwrap();
        assert!(!fs.exists("/bloated.txt").unwrap());
        assert_eq!(read_all(&fs, "/kept.txt"), b"kept");
        assert_eq!(read_all(&fs, "/dir/b.txt"), b"beta");
    }

    #[test]
    fn test_zip64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.zip");
        ArchiveBuilder::new()
            .file("a.txt", b"alpha")
            .stored("b.txt", b"beta")
            .zip64()
            .write(&path);

        let config = ZipFsConfig {
            force_zip64_end: true,
            ..ZipFsConfig::default()
        };
        let fs = ZipFileSystem::open_with(&path, config).unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha");
        write_all(&fs, "/c.txt", b"gamma");
        fs.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(testutil::find(&bytes, b"PK\x06\x06").is_some());
        let fs = ZipFileSystem::open(&path).unwrap();
        assert_eq!(read_all(&fs, "/a.txt"), b"alpha");
        assert_eq!(read_all(&fs, "/b.txt"), b"beta");
        assert_eq!(read_all(&fs, "/c.txt"), b"gamma");
    }
}
