//! File-backed backend: a disk image on the local filesystem.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::backend::{Backend, BackendStat};
use crate::error::{Error, Result};

/// A backend over an on-disk image file, opened read-write or read-only.
pub struct FileBackend {
    file: Mutex<File>,
    writable: bool,
}

impl FileBackend {
    /// Opens `path` for both reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            writable: true,
        })
    }

    /// Opens `path` for reading only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            writable: false,
        })
    }

    /// Creates a new image file of exactly `size` bytes, truncating it if it exists.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file: Mutex::new(file),
            writable: true,
        })
    }
}

impl Backend for FileBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.file.lock().expect("file backend poisoned");
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let file = self.file.lock().expect("file backend poisoned");
        file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn stat(&self) -> Result<BackendStat> {
        let file = self.file.lock().expect("file backend poisoned");
        let size = file.metadata()?.len();
        Ok(BackendStat {
            size,
            writable: self.writable,
        })
    }
}
