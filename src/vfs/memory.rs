//! In-memory filesystem used by tests.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{AtomicFile, FileReader, FileSystem, LockGuard};
use crate::error::{FpindexError, Result};

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Arc<Vec<u8>>>,
    locks: HashSet<String>,
}

/// Concurrency-safe in-memory filesystem with the same semantics as the
/// disk implementation, except that locks are cooperative.
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryFile {
    data: Arc<Vec<u8>>,
}

impl FileReader for MemoryFile {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

struct MemoryAtomicFile {
    buf: Vec<u8>,
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl Write for MemoryAtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AtomicFile for MemoryAtomicFile {
    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.state.lock();
        state.entries.insert(this.name, Arc::new(this.buf));
        Ok(())
    }
}

struct MemoryLockGuard {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.state.lock().locks.remove(&self.name);
    }
}

impl FileSystem for MemoryFileSystem {
    fn open_file(&self, name: &str) -> Result<Arc<dyn FileReader>> {
        let state = self.state.lock();
        match state.entries.get(name) {
            Some(data) => Ok(Arc::new(MemoryFile { data: data.clone() })),
            None => Err(FpindexError::NotFound(name.to_string())),
        }
    }

    fn create_atomic_file(&self, name: &str) -> Result<Box<dyn AtomicFile>> {
        Ok(Box::new(MemoryAtomicFile {
            buf: Vec::new(),
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.state.lock().entries.remove(name);
        Ok(())
    }

    fn lock(&self, name: &str) -> Result<Box<dyn LockGuard>> {
        let mut state = self.state.lock();
        if !state.locks.insert(name.to_string()) {
            return Err(FpindexError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("lock {name} is already held"),
            )));
        }
        Ok(Box::new(MemoryLockGuard {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().entries.keys().cloned().collect())
    }
}
