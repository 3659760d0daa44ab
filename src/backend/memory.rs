//! In-memory backend, used by unit and property tests.

use std::sync::Mutex;

use crate::backend::{Backend, BackendStat};
use crate::error::{Error, Result};

/// A backend that holds its whole image in a growable `Vec<u8>`.
pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
    writable: bool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            writable: true,
        }
    }

    #[must_use]
    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            writable: false,
        }
    }

    /// Returns a snapshot of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().expect("memory backend poisoned").clone()
    }
}

impl Backend for MemoryBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.data.lock().expect("memory backend poisoned");
        let offset = usize::try_from(offset).map_err(|_| Error::OutOfRange {
            offset,
            length: buf.len() as u64,
            size: data.len() as u64,
        })?;
        let end = offset.checked_add(buf.len()).ok_or(Error::OutOfRange {
            offset: offset as u64,
            length: buf.len() as u64,
            size: data.len() as u64,
        })?;
        if end > data.len() {
            return Err(Error::OutOfRange {
                offset: offset as u64,
                length: buf.len() as u64,
                size: data.len() as u64,
            });
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut data = self.data.lock().expect("memory backend poisoned");
        let offset = usize::try_from(offset).map_err(|_| Error::OutOfRange {
            offset,
            length: buf.len() as u64,
            size: data.len() as u64,
        })?;
        let end = offset.checked_add(buf.len()).ok_or(Error::OutOfRange {
            offset: offset as u64,
            length: buf.len() as u64,
            size: data.len() as u64,
        })?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn stat(&self) -> Result<BackendStat> {
        let data = self.data.lock().expect("memory backend poisoned");
        Ok(BackendStat {
            size: data.len() as u64,
            writable: self.writable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let backend = MemoryBackend::new(vec![0u8; 64]);
        backend.write_at(b"hello", 8).unwrap();
        let mut buf = [0u8; 5];
        backend.read_at(&mut buf, 8).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_only_rejects_writes() {
        let backend = MemoryBackend::read_only(vec![0u8; 64]);
        assert!(backend.write_at(b"x", 0).is_err());
    }
}
