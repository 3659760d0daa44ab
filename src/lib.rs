//! A pure-userspace `ext4` filesystem library.
//!
//! This crate parses and mutates `ext4`-formatted disk images without ever calling into an
//! operating system's filesystem driver: callers hand it any [`backend::Backend`] — a file, an
//! in-memory buffer, a partition slice — and get back a directory/file abstraction that
//! preserves the on-disk invariants (superblock/group-descriptor checksums, inode checksums,
//! extent trees, allocation bitmaps) as it reads and writes.
//!
//! The entry points are [`ext4::Ext4Fs::mount`] (open an existing image) and
//! [`ext4::Ext4Fs::create`] (format a new one). Everything below that — superblock, group
//! descriptors, inodes, extent trees, directories, the allocator — is reachable through
//! [`ext4`] for callers who want to work at a lower level than the façade.

pub mod backend;
pub mod bitmap;
pub mod crc16;
pub mod crc32c;
pub mod error;
pub mod ext4;
pub mod timestamp;

pub use backend::{Backend, BackendStat, SubRange};
pub use error::{Error, Result};
pub use ext4::{CreateOptions, Ext4Fs};
