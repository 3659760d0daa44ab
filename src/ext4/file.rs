//! Open file handles (part of C10, §4.8): `open`/`read`/`write`/`seek`/`close` over a regular
//! file, turning a byte cursor plus flags into extent-tree reads and writes.
//!
//! A [`FileHandle`] carries no reference to the [`Ext4Fs`] that opened it — it is a plain,
//! `Copy` value (inode number, flags, cursor) always used together with the filesystem's own
//! `&self`/`&mut self`, the same shape the rest of this façade uses for everything else (§6.1:
//! the backend never seeks, so nothing here keeps one either).

use std::path::PathBuf;

use log::debug;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::ext4::dir::DirFileType;
use crate::ext4::extent::{find_blocks, Extent, Root};
use crate::ext4::inode::{FileMode, FileType, InodeBlock, InodeFlags, InodeNumber};
use crate::ext4::{current_timestamp, dir_entry, Ext4Fs};

/// Flags accepted by [`Ext4Fs::open`]. Bitwise-combine with `|`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: Self = Self(0x1);
    pub const WRITE: Self = Self(0x2);
    /// Create the file if it does not already exist.
    pub const CREATE: Self = Self(0x4);
    /// Position the cursor at end-of-file after opening, rather than at 0.
    pub const APPEND: Self = Self(0x8);
    /// Truncate an existing file to empty after opening.
    pub const TRUNCATE: Self = Self(0x10);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A position to move a [`FileHandle`]'s cursor to, mirroring `std::io::SeekFrom`'s three
/// variants without requiring the backend itself to support seeking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// A handle to an open regular file: an inode number, the flags it was opened with, and a byte
/// cursor. Obtained from [`Ext4Fs::open`] and passed back into [`Ext4Fs::read`],
/// [`Ext4Fs::write`], [`Ext4Fs::seek`], and [`Ext4Fs::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle {
    pub(crate) inode: InodeNumber,
    pub(crate) flags: OpenFlags,
    cursor: u64,
}

impl FileHandle {
    /// The handle's current cursor position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor
    }
}

impl<B: Backend> Ext4Fs<B> {
    /// Opens the regular file at `path`, optionally creating it (`OpenFlags::CREATE`).
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        match self.resolve(path) {
            Ok(ino) => {
                let rec = self.read_inode_record(ino)?;
                if rec.file_type() == FileType::Directory {
                    return Err(Error::IsADirectory(PathBuf::from(path)));
                }
                if flags.contains(OpenFlags::TRUNCATE) {
                    self.truncate_inode(ino, 0)?;
                }
                let cursor = if flags.contains(OpenFlags::APPEND) {
                    self.read_inode_record(ino)?.size()
                } else {
                    0
                };
                Ok(FileHandle { inode: ino, flags, cursor })
            }
            Err(Error::NotFound(_)) if flags.contains(OpenFlags::CREATE) => {
                let (parent_ino, name) = self.resolve_parent(path)?;
                let ino = self.allocate_inode()?;
                let now = current_timestamp();
                let mut rec = self.new_inode_record(FileMode::new(FileType::Regular, 0o644), now);
                rec.base.flags = rec.base.flags | InodeFlags::EXTENTS;
                rec.base.block = InodeBlock(Root::Empty.serialize());
                self.write_inode_record(ino, &mut rec)?;
                self.dir_insert(parent_ino, dir_entry(ino, &name, DirFileType::REGULAR))?;
                debug!("created file {path:?} as inode {ino}");
                Ok(FileHandle { inode: ino, flags, cursor: 0 })
            }
            Err(err) => Err(err),
        }
    }

    /// Reads up to `buf.len()` bytes at the handle's cursor, advancing it by the amount read.
    /// Returns the number of bytes actually read; reading at or past end-of-file returns `0`
    /// without error.
    pub fn read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        let rec = self.read_inode_record(handle.inode)?;
        let size = rec.size();
        if handle.cursor >= size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((size - handle.cursor) as usize);
        self.read_inode_range(&rec, handle.cursor, &mut buf[..n])?;
        handle.cursor += n as u64;
        Ok(n)
    }

    /// Writes `buf` at the handle's cursor, allocating and mapping blocks as needed and
    /// extending the file's size if the write runs past the current end-of-file. Any gap between
    /// the old end-of-file and the start of the write is left as a hole (reads back as zero).
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut rec = self.read_inode_record(handle.inode)?;
        let block_size = self.superblock.block_size();
        let old_size = rec.size();
        let write_end = handle.cursor + buf.len() as u64;

        let start_block = handle.cursor / block_size;
        let end_block = write_end.div_ceil(block_size);
        let block_count = end_block - start_block;

        // Map every file block the write touches, allocating runs of holes both beyond the old
        // end-of-file and inside it (a prior write may have left the middle of the file sparse).
        let root = if rec.uses_extent_tree() {
            Root::parse(&rec.base.block.0)?
        } else {
            Root::Empty
        };
        let existing = find_blocks(&root, &mut |b| self.read_block(b), start_block, block_count)?;
        if existing.iter().any(Option::is_none) {
            let group_hint = self.inode_group(handle.inode);
            let mut new_extents = Vec::new();
            let mut i = 0usize;
            while i < existing.len() {
                if existing[i].is_some() {
                    i += 1;
                    continue;
                }
                let run_start = i;
                while i < existing.len() && existing[i].is_none() {
                    i += 1;
                }
                let run_len = (i - run_start) as u64;
                let mut file_block = start_block + run_start as u64;
                for (disk_start, len) in self.allocate_blocks(run_len, Some(group_hint))? {
                    new_extents.push(Extent::new(file_block as u32, len as u16, disk_start, true));
                    file_block += len;
                }
            }
            self.extend_inode_blocks(handle.inode, &mut rec, new_extents)?;
        }

        let root = Root::parse(&rec.base.block.0)?;
        let mapped = find_blocks(&root, &mut |b| self.read_block(b), start_block, block_count)?;

        let mut written = 0usize;
        for (i, slot) in mapped.iter().enumerate() {
            let file_block_no = start_block + i as u64;
            let block_off_in_file = file_block_no * block_size;
            if block_off_in_file >= write_end {
                break;
            }
            let copy_start = handle.cursor.max(block_off_in_file) - block_off_in_file;
            let copy_end = write_end.min(block_off_in_file + block_size) - block_off_in_file;
            if copy_end <= copy_start {
                continue;
            }
            let Some(disk_block) = slot else {
                return Err(Error::Malformed("write target block unexpectedly unmapped"));
            };
            // A block this write just allocated to fill a hole carries whatever was previously on
            // disk there; start from zero rather than exposing it in the untouched remainder.
            let mut data = if existing[i].is_none() {
                vec![0u8; block_size as usize]
            } else {
                self.read_block(*disk_block)?
            };
            let src_start = (block_off_in_file + copy_start - handle.cursor) as usize;
            let src_end = src_start + (copy_end - copy_start) as usize;
            data[copy_start as usize..copy_end as usize].copy_from_slice(&buf[src_start..src_end]);
            self.write_block(*disk_block, &data)?;
            written += src_end - src_start;
        }

        if write_end > old_size {
            rec.set_size(write_end);
        }
        let phys_blocks: u64 = self.inode_physical_blocks(&rec)?.iter().map(|&(_, len)| len).sum();
        rec.set_block_count(phys_blocks * (block_size / 512), false, false);
        let now = current_timestamp();
        rec.set_change_time(now);
        rec.set_modification_time(now);
        self.write_inode_record(handle.inode, &mut rec)?;
        handle.cursor += written as u64;
        Ok(written)
    }

    /// Moves `handle`'s cursor and returns its new absolute position. `SeekFrom::Current`/`End`
    /// reject a resulting negative offset.
    pub fn seek(&self, handle: &mut FileHandle, pos: SeekFrom) -> Result<u64> {
        let new_cursor = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => add_signed(handle.cursor, delta)?,
            SeekFrom::End(delta) => {
                let rec = self.read_inode_record(handle.inode)?;
                add_signed(rec.size(), delta)?
            }
        };
        handle.cursor = new_cursor;
        Ok(new_cursor)
    }

    /// Returns the current size, in bytes, of the file `handle` refers to.
    pub fn file_size(&self, handle: &FileHandle) -> Result<u64> {
        Ok(self.read_inode_record(handle.inode)?.size())
    }

    /// Closes `handle`. A handle carries no backend resources of its own, so this is a no-op
    /// kept for symmetry with [`Ext4Fs::open`] and to give future additions (e.g. deferred
    /// metadata flush) a place to live.
    pub fn close(&self, _handle: FileHandle) {}
}

fn add_signed(base: u64, delta: i64) -> Result<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
            .ok_or(Error::Malformed("seek overflowed a 64-bit offset"))
    } else {
        base.checked_sub(delta.unsigned_abs())
            .ok_or(Error::Malformed("seek before the start of the file"))
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::memory::MemoryBackend;
    use crate::ext4::sb::CreateOptions;
    use crate::ext4::{Ext4Fs, OpenFlags, SeekFrom};

    fn fresh() -> Ext4Fs<MemoryBackend> {
        let size = 4 * 1024 * 1024;
        let backend = MemoryBackend::new(vec![0u8; size]);
        Ext4Fs::create(backend, size as u64, CreateOptions::default()).unwrap()
    }

    #[test]
    fn create_write_read_round_trips() {
        let mut fs = fresh();
        let mut h = fs.open("greeting.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        let written = fs.write(&mut h, b"hello world").unwrap();
        assert_eq!(written, 11);

        fs.seek(&mut h, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 11];
        let read = fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn open_without_create_on_missing_file_fails() {
        let mut fs = fresh();
        assert!(fs.open("nope.txt", OpenFlags::READ).is_err());
    }

    #[test]
    fn open_on_directory_fails() {
        let mut fs = fresh();
        fs.mkdir("a-dir").unwrap();
        assert!(fs.open("a-dir", OpenFlags::READ).is_err());
    }

    #[test]
    fn writing_past_eof_leaves_a_readable_hole() {
        let mut fs = fresh();
        let mut h = fs.open("sparse.bin", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        fs.write(&mut h, b"START").unwrap();
        fs.seek(&mut h, SeekFrom::Start(8192)).unwrap();
        fs.write(&mut h, b"END").unwrap();

        let mut buf = [0u8; 5];
        fs.seek(&mut h, SeekFrom::Start(0)).unwrap();
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(&buf, b"START");

        let mut hole = [0xFFu8; 3];
        fs.seek(&mut h, SeekFrom::Start(5)).unwrap();
        fs.read(&mut h, &mut hole).unwrap();
        assert_eq!(hole, [0u8; 3]);

        let mut tail = [0u8; 3];
        fs.seek(&mut h, SeekFrom::Start(8192)).unwrap();
        fs.read(&mut h, &mut tail).unwrap();
        assert_eq!(&tail, b"END");
    }

    #[test]
    fn write_spanning_many_blocks_forces_extent_tree_growth() {
        let mut fs = fresh();
        let mut h = fs.open("big.bin", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        let chunk = vec![0xABu8; 4096];
        for _ in 0..600 {
            fs.write(&mut h, &chunk).unwrap();
        }
        assert_eq!(fs.file_size(&h).unwrap(), 600 * 4096);

        fs.seek(&mut h, SeekFrom::Start(500 * 4096)).unwrap();
        let mut buf = vec![0u8; 4096];
        fs.read(&mut h, &mut buf).unwrap();
        assert_eq!(buf, chunk);
    }
}
