//! Crate-wide error taxonomy.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced while parsing, mounting, or mutating an ext4 volume.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("superblock magic mismatch: expected 0xEF53, found {found:#06x}")]
    BadMagic { found: u16 },

    #[error("superblock checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    BadSuperblockChecksum { expected: u32, computed: u32 },

    #[error("group descriptor {group} checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    BadGroupDescriptorChecksum {
        group: u32,
        expected: u16,
        computed: u16,
    },

    #[error("inode {inode} checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    BadInodeChecksum {
        inode: u32,
        expected: u32,
        computed: u32,
    },

    #[error("bitmap checksum mismatch for group {group}")]
    BadBitmapChecksum { group: u32 },

    #[error("extent block checksum mismatch for inode {inode}")]
    BadExtentChecksum { inode: u32 },

    #[error("required feature not supported: {0}")]
    UnsupportedFeature(&'static str),

    #[error("incompatible feature set: {0:#x} requires support this library lacks")]
    IncompatibleFeatureSet(u32),

    #[error("extent tree exhausted maximum depth (5)")]
    ExtentTreeDepthExhausted,

    #[error("no free blocks available to satisfy allocation of {requested} block(s)")]
    OutOfBlocks { requested: u64 },

    #[error("no free inodes available")]
    OutOfInodes,

    #[error("malformed on-disk structure: {0}")]
    Malformed(&'static str),

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("path already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("backend is read-only")]
    ReadOnly,

    #[error("offset {offset} + length {length} exceeds backend size {size}")]
    OutOfRange {
        offset: u64,
        length: u64,
        size: u64,
    },

    #[error("not yet implemented: {0}")]
    NotImplemented(&'static str),
}
