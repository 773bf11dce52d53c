//! On-disk filesystem implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as LockFileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{AtomicFile, FileReader, FileSystem, LockGuard};
use crate::error::{FpindexError, Result};

/// Directory-backed filesystem. Atomic writers are temp files in the same
/// directory renamed into place on commit; locks are `flock`-style
/// advisory locks.
pub struct DiskFileSystem {
    path: PathBuf,
}

impl DiskFileSystem {
    /// Open a directory, optionally creating it if it does not exist.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        match fs::metadata(path) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(FpindexError::InvalidInput(format!(
                        "{} is not a directory",
                        path.display()
                    )));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound && create => {
                fs::create_dir_all(path)?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

struct DiskFile {
    file: File,
    len: u64,
}

impl FileReader for DiskFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

struct DiskAtomicFile {
    temp: Option<NamedTempFile>,
    dest: PathBuf,
}

impl Write for DiskAtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.temp {
            Some(temp) => temp.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "file already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.temp {
            Some(temp) => temp.flush(),
            None => Ok(()),
        }
    }
}

impl AtomicFile for DiskAtomicFile {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let mut temp = self
            .temp
            .take()
            .ok_or_else(|| FpindexError::InvalidInput("file already committed".into()))?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.dest)
            .map_err(|err| FpindexError::Io(err.error))?;
        Ok(())
    }
}

struct DiskLockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard for DiskLockGuard {}

impl Drop for DiskLockGuard {
    fn drop(&mut self) {
        if let Err(err) = LockFileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

impl FileSystem for DiskFileSystem {
    fn open_file(&self, name: &str) -> Result<Arc<dyn FileReader>> {
        let file = File::open(self.full_path(name)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                FpindexError::NotFound(name.to_string())
            } else {
                err.into()
            }
        })?;
        let len = file.metadata()?.len();
        Ok(Arc::new(DiskFile { file, len }))
    }

    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>> {
        let temp = NamedTempFile::new_in(&self.path)?;
        Ok(Box::new(DiskAtomicFile {
            temp: Some(temp),
            dest: self.full_path(name),
        }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.full_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn lock(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let path = self.full_path(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Box::new(DiskLockGuard { file, path }))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}
