//! Atomic file commits and small filesystem helpers.
//!
//! Every mutation of on-disk state goes through [`AtomicFile`]: bytes are
//! written to a temp sibling in the destination directory, then fsynced and
//! renamed into place on commit. Dropping an uncommitted handle unlinks the
//! temp file, so readers can never observe a partial write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// A pending write that becomes visible only on [`commit`](Self::commit).
pub struct AtomicFile {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl AtomicFile {
    /// Opens a writable handle whose contents will land at `path` on commit.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<AtomicFile> {
        let dest = path.into();
        let dir = dest.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent directory")
        })?;
        fs::create_dir_all(dir)?;
        let temp = NamedTempFile::new_in(dir)?;
        Ok(AtomicFile { temp, dest })
    }

    /// Durably renames the temp file over the destination. Concurrent
    /// commits to the same path serialize on the rename; last one wins.
    pub fn commit(self) -> io::Result<()> {
        self.temp.as_file().sync_all()?;
        let dir = self.dest.parent().map(Path::to_path_buf);
        self.temp.persist(&self.dest).map_err(|e| e.error)?;
        if let Some(dir) = dir {
            fsync_dir(&dir)?;
        }
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.as_file_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.as_file_mut().flush()
    }
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// File size in bytes, or `None` when the file is missing or unreadable.
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Removes a file, treating "already gone" as success.
pub fn delete_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Removes a directory tree, treating "already gone" as success.
pub fn delete_directory(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
