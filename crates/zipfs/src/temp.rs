//! Scratch files colocated with the archive.
//!
//! Staged entry content, random-access channels and the rebuilt archive all
//! live in scratch files created next to the archive, so the final rename
//! never crosses a volume boundary. Every path handed out is tracked until it
//! is removed or moved into place; whatever is left at close gets deleted.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

const PREFIX: &str = "zipfstmp";

/// Creates and tracks scratch files in the archive's directory.
#[derive(Debug)]
pub(crate) struct TempFileManager {
    dir: PathBuf,
    paths: Mutex<HashSet<PathBuf>>,
}

impl TempFileManager {
    /// Manager for scratch files next to `archive`.
    pub fn new(archive: &Path) -> Self {
        let dir = match archive.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            dir,
            paths: Mutex::new(HashSet::new()),
        }
    }

    /// Create a new empty scratch file and start tracking it.
    pub fn create(&self) -> io::Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempfile_in(&self.dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        self.paths.lock().insert(path.clone());
        Ok(path)
    }

    /// Create a scratch file holding everything `source` yields.
    pub fn create_from<R: Read>(&self, source: &mut R) -> io::Result<PathBuf> {
        let path = self.create()?;
        let copied = File::create(&path).and_then(|mut file| io::copy(source, &mut file));
        if let Err(e) = copied {
            let _ = self.remove(&path);
            return Err(e);
        }
        Ok(path)
    }

    /// Delete a scratch file and stop tracking it.
    pub fn remove(&self, path: &Path) -> io::Result<()> {
        self.paths.lock().remove(path);
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Stop tracking a scratch file that has been moved into place.
    pub fn untrack(&self, path: &Path) {
        self.paths.lock().remove(path);
    }

    /// Whether `path` is a live scratch file.
    #[cfg(test)]
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    /// Number of scratch files currently tracked.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    /// Delete every tracked scratch file, reporting the first failure after
    /// attempting all of them.
    pub fn cleanup(&self) -> io::Result<()> {
        let paths: Vec<PathBuf> = self.paths.lock().drain().collect();
        let mut first_error = None;
        for path in paths {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() == io::ErrorKind::NotFound {
                    continue;
                }
                tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
