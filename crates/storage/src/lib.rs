//! Relay blob storage.
//!
//! The network layer persists a single opaque document (the known-peers
//! directory) and only needs three operations from its backend: read the
//! whole document, replace it, and close the backend. This crate provides
//! a file-backed implementation for nodes, an in-memory one for tests and
//! embedded use, and a no-op one for nodes that should forget everything
//! on restart.

use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Storage is closed")]
    Closed,
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Abstract storage trait
///
/// `read` returns an empty buffer when nothing has been saved yet. Closing
/// only stops writes; the last saved document stays readable.
pub trait Storage: Send + Sync {
    fn read(&self) -> Result<Vec<u8>>;
    fn save(&self, data: &[u8]) -> Result<()>;
    fn close(&self);
}

/// File-backed implementation.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write never leaves a truncated document behind.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    // serialises writers; readers never observe the temp file
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    fn save(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| StorageError::io(&temp_path, e))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| StorageError::io(&self.path, e))?;
        debug!(path = %self.path.display(), bytes = data.len(), "saved document");
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory backend, keeps the last saved document.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Storage for MemoryStorage {
    fn read(&self) -> Result<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn save(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        *self.data.write() = data.to_vec();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl Storage for NoopStorage {
    fn read(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn save(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}
