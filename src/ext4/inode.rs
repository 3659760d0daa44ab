//! Inode (C6): per-file/directory metadata, timestamps, and the 60-byte extent/symlink area.
//!
//! [`Inode`] mirrors the 128-byte base record byte for byte; filesystems with `inode_size > 128`
//! append extra fields (`i_extra_isize`, the high halves of the timestamps, the checksum high
//! half, the project id) immediately after, which this struct also models so a single
//! `#[repr(C)]` cast covers the common 160-byte and 256-byte inode sizes the allocator produces.

use bytemuck::{Pod, Zeroable};
use log::{debug, error};

use crate::crc32c::crc32c_extend;
use crate::error::{Error, Result};
use crate::timestamp::UnixTimestamp;

/// A 32-bit inode number. Inode 0 is not a valid identifier; it marks an unused directory entry.
pub type InodeNumber = u32;

/// Inode 2: the root directory.
pub const ROOT_INODE: InodeNumber = 2;
/// Inode 3: reserved for the user quota file.
pub const USER_QUOTA_INODE: InodeNumber = 3;
/// Inode 4: reserved for the group quota file.
pub const GROUP_QUOTA_INODE: InodeNumber = 4;
/// Inode 7: reserved group descriptors inode (online resize).
pub const RESIZE_INODE: InodeNumber = 7;
/// Inode 8: the journal.
pub const JOURNAL_INODE: InodeNumber = 8;
/// Inode 9: exclude inode, used by snapshots.
pub const EXCLUDE_INODE: InodeNumber = 9;
/// Inode 11: conventionally `lost+found`, the first inode past the reserved range.
pub const LOST_AND_FOUND_INODE: InodeNumber = 11;
/// Inode numbers below this are reserved by the standard and never handed out by the allocator.
pub const FIRST_NON_RESERVED_INODE: InodeNumber = 11;

/// `i_mode`: POSIX permission bits plus the file-type nibble (top 4 bits).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    pub const IXOTH: Self = Self(0o0001);
    pub const IWOTH: Self = Self(0o0002);
    pub const IROTH: Self = Self(0o0004);
    pub const IXGRP: Self = Self(0o0010);
    pub const IWGRP: Self = Self(0o0020);
    pub const IRGRP: Self = Self(0o0040);
    pub const IXUSR: Self = Self(0o0100);
    pub const IWUSR: Self = Self(0o0200);
    pub const IRUSR: Self = Self(0o0400);
    pub const ISVTX: Self = Self(0o1000);
    pub const ISGID: Self = Self(0o2000);
    pub const ISUID: Self = Self(0o4000);

    pub const IFIFO: Self = Self(0x1000);
    pub const IFCHR: Self = Self(0x2000);
    pub const IFDIR: Self = Self(0x4000);
    pub const IFBLK: Self = Self(0x6000);
    pub const IFREG: Self = Self(0x8000);
    pub const IFLNK: Self = Self(0xA000);
    pub const IFSOCK: Self = Self(0xC000);

    const TYPE_MASK: u16 = 0xF000;
    const PERM_MASK: u16 = 0x0FFF;

    /// Builds a mode from a file type and permission bits (masked to 12 bits).
    #[must_use]
    pub fn new(file_type: FileType, perm: u16) -> Self {
        Self(file_type.to_mode_bits() | (perm & Self::PERM_MASK))
    }

    #[must_use]
    pub fn file_type(self) -> FileType {
        FileType::from_mode(self)
    }

    #[must_use]
    pub fn permissions(self) -> u16 {
        self.0 & Self::PERM_MASK
    }

    #[must_use]
    pub fn contains(self, bits: Self) -> bool {
        self.0 & bits.0 == bits.0
    }
}

impl core::ops::BitOr for FileMode {
    type Output = FileMode;

    /// Unions permission bits while leaving the receiver's file-type nibble untouched: the two
    /// file types cannot both survive an OR, so the left-hand type wins.
    fn bitor(self, rhs: Self) -> Self::Output {
        let perm = (self.0 | rhs.0) & Self::PERM_MASK;
        FileMode((self.0 & Self::TYPE_MASK) | perm)
    }
}

impl core::fmt::Display for FileMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bit = |set: Self, c: char| if self.contains(set) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}{}{}{}{}{}",
            bit(Self::IRUSR, 'r'),
            bit(Self::IWUSR, 'w'),
            bit(Self::IXUSR, 'x'),
            bit(Self::IRGRP, 'r'),
            bit(Self::IWGRP, 'w'),
            bit(Self::IXGRP, 'x'),
            bit(Self::IROTH, 'r'),
            bit(Self::IWOTH, 'w'),
            bit(Self::IXOTH, 'x'),
        )
    }
}

/// The kind of filesystem object an inode represents, decoded from the top nibble of `i_mode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Fifo,
    CharacterDevice,
    BlockDevice,
    SymbolicLink,
    Socket,
}

impl FileType {
    fn to_mode_bits(self) -> u16 {
        match self {
            FileType::Fifo => FileMode::IFIFO.0,
            FileType::CharacterDevice => FileMode::IFCHR.0,
            FileType::Directory => FileMode::IFDIR.0,
            FileType::BlockDevice => FileMode::IFBLK.0,
            FileType::Regular => FileMode::IFREG.0,
            FileType::SymbolicLink => FileMode::IFLNK.0,
            FileType::Socket => FileMode::IFSOCK.0,
        }
    }

    fn from_mode(mode: FileMode) -> Self {
        match FileMode(mode.0 & FileMode::TYPE_MASK) {
            FileMode::IFSOCK => Self::Socket,
            FileMode::IFLNK => Self::SymbolicLink,
            FileMode::IFCHR => Self::CharacterDevice,
            FileMode::IFBLK => Self::BlockDevice,
            FileMode::IFIFO => Self::Fifo,
            FileMode::IFDIR => Self::Directory,
            _ => Self::Regular,
        }
    }
}

/// `i_flags`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    pub const SYNC: Self = Self(0x8);
    pub const IMMUTABLE: Self = Self(0x10);
    pub const APPEND: Self = Self(0x20);
    pub const NOATIME: Self = Self(0x80);
    pub const INDEX: Self = Self(0x1000);
    /// Uses a hashed directory index (htree), per §4.6.
    pub const HASHED_DIRECTORY_INDEXES: Self = Self::INDEX;
    pub const HUGE_FILE: Self = Self(0x4_0000);
    /// Uses an extent tree rather than the legacy block map.
    pub const EXTENTS: Self = Self(0x8_0000);
    pub const EOFBLOCKS: Self = Self(0x40_0000);
    pub const INLINE_DATA: Self = Self(0x1000_0000 >> 4);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl core::ops::BitOr for InodeFlags {
    type Output = InodeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        InodeFlags(self.0 | rhs.0)
    }
}

/// The 60-byte `i_block` area: either an extent-tree root (when [`InodeFlags::EXTENTS`] is set)
/// or, for a short symbolic link, the raw link target with no terminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeBlock(pub [u8; 60]);

impl Default for InodeBlock {
    fn default() -> Self {
        Self([0; 60])
    }
}

impl InodeBlock {
    /// Interprets the area as an inline symlink target of `len` bytes (caller-supplied, since the
    /// length lives in `i_size`, not in this struct).
    #[must_use]
    pub fn as_inline_symlink(&self, len: u64) -> &[u8] {
        &self.0[..(len as usize).min(60)]
    }

    /// Stores `target` as an inline symlink target; `target.len()` must be `< 60`.
    pub fn set_inline_symlink(&mut self, target: &[u8]) {
        debug_assert!(target.len() < 60);
        self.0 = [0; 60];
        self.0[..target.len()].copy_from_slice(target);
    }
}

/// The on-disk base inode record (128 bytes). Larger `inode_size` filesystems append the fields
/// in [`InodeExtra`] immediately after this struct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    pub mode: FileMode,
    pub uid_lo: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid_lo: u16,
    pub links_count: u16,
    pub blocks_lo: u32,
    pub flags: InodeFlags,
    pub version_lo: u32,
    pub block: InodeBlock,
    pub generation: u32,
    pub file_acl_lo: u32,
    pub size_hi: u32,
    pub faddr: u32,
    pub blocks_hi: u16,
    pub file_acl_hi: u16,
    pub uid_hi: u16,
    pub gid_hi: u16,
    pub checksum_lo: u16,
    pub reserved: u16,
}

const BASE_SIZE: usize = 128;
const _: () = assert!(core::mem::size_of::<Inode>() == BASE_SIZE);

/// The fields appended after the base 128 bytes when `inode_size > 128`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct InodeExtra {
    pub extra_isize: u16,
    pub checksum_hi: u16,
    pub ctime_extra: u32,
    pub mtime_extra: u32,
    pub atime_extra: u32,
    pub crtime: u32,
    pub crtime_extra: u32,
    pub version_hi: u32,
    pub projid: u32,
}

const EXTRA_SIZE: usize = 32;
const _: () = assert!(core::mem::size_of::<InodeExtra>() == EXTRA_SIZE);

/// An inode record together with however much of the "extra" area its `inode_size` provides.
/// `extra` is `None` for the 128-byte (no-extra) inode size, matching `i_extra_isize == 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeRecord {
    pub base: Inode,
    pub extra: Option<InodeExtra>,
}

impl InodeRecord {
    /// Parses a record of exactly `inode_size` bytes (128 or larger).
    pub fn parse(bytes: &[u8], inode_size: u16) -> Result<Self> {
        let inode_size = inode_size as usize;
        if bytes.len() < inode_size || inode_size < BASE_SIZE {
            return Err(Error::Malformed("truncated inode record"));
        }
        let base = *bytemuck::from_bytes::<Inode>(&bytes[..BASE_SIZE]);
        let extra = if inode_size > BASE_SIZE {
            let mut buf = [0u8; EXTRA_SIZE];
            let available = (inode_size - BASE_SIZE).min(EXTRA_SIZE);
            buf[..available].copy_from_slice(&bytes[BASE_SIZE..BASE_SIZE + available]);
            Some(*bytemuck::from_bytes::<InodeExtra>(&buf))
        } else {
            None
        };
        Ok(Self { base, extra })
    }

    /// Serializes this record to exactly `inode_size` bytes, zero-padding any tail beyond the
    /// fields this struct models.
    #[must_use]
    pub fn serialize(&self, inode_size: u16) -> Vec<u8> {
        let inode_size = inode_size as usize;
        let mut out = vec![0u8; inode_size.max(BASE_SIZE)];
        out[..BASE_SIZE].copy_from_slice(bytemuck::bytes_of(&self.base));
        if let Some(extra) = self.extra {
            let available = (inode_size.saturating_sub(BASE_SIZE)).min(EXTRA_SIZE);
            out[BASE_SIZE..BASE_SIZE + available]
                .copy_from_slice(&bytemuck::bytes_of(&extra)[..available]);
        }
        out.truncate(inode_size);
        out
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.base.mode.file_type()
    }

    #[must_use]
    pub fn uid(&self) -> u32 {
        u32::from(self.base.uid_lo) | (u32::from(self.base.uid_hi) << 16)
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.base.uid_lo = uid as u16;
        self.base.uid_hi = (uid >> 16) as u16;
    }

    #[must_use]
    pub fn gid(&self) -> u32 {
        u32::from(self.base.gid_lo) | (u32::from(self.base.gid_hi) << 16)
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.base.gid_lo = gid as u16;
        self.base.gid_hi = (gid >> 16) as u16;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.base.size_lo) | (u64::from(self.base.size_hi) << 32)
    }

    pub fn set_size(&mut self, size: u64) {
        self.base.size_lo = size as u32;
        self.base.size_hi = (size >> 32) as u32;
    }

    /// Block count, accounting for the superblock/inode `huge_file` interaction (§4.4): neither
    /// flag set means a 32-bit 512-byte-sector count; superblock-only means a 48-bit sector
    /// count; both set means a 48-bit filesystem-block count.
    #[must_use]
    pub fn block_count(&self, sb_huge_file: bool) -> u64 {
        let lo_hi = u64::from(self.base.blocks_lo) | (u64::from(self.base.blocks_hi) << 32);
        if !sb_huge_file {
            u64::from(self.base.blocks_lo)
        } else {
            lo_hi
        }
    }

    /// Sets the block count, choosing the sector-count or block-count encoding the same way
    /// [`Self::block_count`] reads it back.
    pub fn set_block_count(&mut self, count: u64, sb_huge_file: bool, inode_huge_file: bool) {
        if !sb_huge_file {
            self.base.blocks_lo = count as u32;
            self.base.blocks_hi = 0;
        } else {
            self.base.blocks_lo = count as u32;
            self.base.blocks_hi = (count >> 32) as u16;
        }
        if inode_huge_file {
            self.base.flags = self.base.flags | InodeFlags::HUGE_FILE;
        }
    }

    fn timestamp(seconds: u32, extra: u32) -> UnixTimestamp {
        UnixTimestamp::from(u64::from(seconds) | (u64::from(extra) << 32))
    }

    #[must_use]
    pub fn access_time(&self) -> UnixTimestamp {
        Self::timestamp(self.base.atime, self.extra.map_or(0, |e| e.atime_extra))
    }

    #[must_use]
    pub fn change_time(&self) -> UnixTimestamp {
        Self::timestamp(self.base.ctime, self.extra.map_or(0, |e| e.ctime_extra))
    }

    #[must_use]
    pub fn modification_time(&self) -> UnixTimestamp {
        Self::timestamp(self.base.mtime, self.extra.map_or(0, |e| e.mtime_extra))
    }

    #[must_use]
    pub fn creation_time(&self) -> Option<UnixTimestamp> {
        self.extra
            .map(|e| Self::timestamp(e.crtime, e.crtime_extra))
    }

    pub fn set_access_time(&mut self, ts: UnixTimestamp) {
        self.base.atime = ts.raw_seconds() as u32;
        if let Some(extra) = &mut self.extra {
            extra.atime_extra = (ts.0 >> 32) as u32;
        }
    }

    pub fn set_change_time(&mut self, ts: UnixTimestamp) {
        self.base.ctime = ts.raw_seconds() as u32;
        if let Some(extra) = &mut self.extra {
            extra.ctime_extra = (ts.0 >> 32) as u32;
        }
    }

    pub fn set_modification_time(&mut self, ts: UnixTimestamp) {
        self.base.mtime = ts.raw_seconds() as u32;
        if let Some(extra) = &mut self.extra {
            extra.mtime_extra = (ts.0 >> 32) as u32;
        }
    }

    pub fn uses_extent_tree(&self) -> bool {
        self.base.flags.contains(InodeFlags::EXTENTS)
    }

    pub fn is_symlink_inline(&self) -> bool {
        self.file_type() == FileType::SymbolicLink && self.size() < 60
    }

    /// Computes the split inode checksum: `crc32c(seed, inode_no) -> s1`,
    /// `crc32c(s1, generation) -> s2`, `crc32c(s2, record_with_checksum_zeroed)`.
    #[must_use]
    pub fn compute_checksum(&self, seed: u32, inode_no: InodeNumber, inode_size: u16) -> u32 {
        let s1 = crc32c_extend(seed, &inode_no.to_le_bytes());
        let s2 = crc32c_extend(s1, &self.base.generation.to_le_bytes());
        let mut zeroed = *self;
        zeroed.base.checksum_lo = 0;
        if let Some(extra) = &mut zeroed.extra {
            extra.checksum_hi = 0;
        }
        crc32c_extend(s2, &zeroed.serialize(inode_size))
    }

    /// Verifies the checksum, logging and returning an error on mismatch. Only the low 16 bits
    /// are meaningful when `i_extra_isize == 0` (no high half to compare).
    pub fn verify_checksum(&self, seed: u32, inode_no: InodeNumber, inode_size: u16) -> Result<()> {
        let computed = self.compute_checksum(seed, inode_no, inode_size);
        let on_disk = self.stored_checksum();
        let matches = if self.extra.is_none() {
            on_disk & 0xFFFF == computed & 0xFFFF
        } else {
            on_disk == computed
        };
        if !matches {
            error!("inode {inode_no} checksum mismatch: expected {on_disk:#010x}, computed {computed:#010x}");
            return Err(Error::BadInodeChecksum {
                inode: inode_no,
                expected: on_disk,
                computed,
            });
        }
        debug!("inode {inode_no} checksum verified");
        Ok(())
    }

    /// Recomputes and stores the checksum, splitting it across the low/high fields per §4.4.
    pub fn update_checksum(&mut self, seed: u32, inode_no: InodeNumber, inode_size: u16) {
        let checksum = self.compute_checksum(seed, inode_no, inode_size);
        self.base.checksum_lo = checksum as u16;
        if let Some(extra) = &mut self.extra {
            extra.checksum_hi = (checksum >> 16) as u16;
        }
    }

    fn stored_checksum(&self) -> u32 {
        u32::from(self.base.checksum_lo)
            | self.extra.map_or(0, |e| u32::from(e.checksum_hi) << 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(inode_size: u16) -> InodeRecord {
        let mut rec = InodeRecord {
            base: Inode::zeroed(),
            extra: if inode_size > BASE_SIZE as u16 {
                Some(InodeExtra::zeroed())
            } else {
                None
            },
        };
        rec.base.mode = FileMode::new(FileType::Regular, 0o644);
        rec.set_size(12345);
        rec.set_uid(70_000);
        rec
    }

    #[test]
    fn round_trips_through_bytes_128() {
        let rec = sample(128);
        let bytes = rec.serialize(128);
        assert_eq!(bytes.len(), 128);
        let back = InodeRecord::parse(&bytes, 128).unwrap();
        assert_eq!(back.size(), 12345);
        assert_eq!(back.uid(), 70_000);
        assert_eq!(back.file_type(), FileType::Regular);
    }

    #[test]
    fn round_trips_through_bytes_256() {
        let rec = sample(256);
        let bytes = rec.serialize(256);
        assert_eq!(bytes.len(), 256);
        let back = InodeRecord::parse(&bytes, 256).unwrap();
        assert_eq!(back.size(), 12345);
        assert!(back.extra.is_some());
    }

    #[test]
    fn checksum_round_trips_with_extra() {
        let mut rec = sample(256);
        rec.update_checksum(0xDEAD_BEEF, ROOT_INODE, 256);
        assert!(rec.verify_checksum(0xDEAD_BEEF, ROOT_INODE, 256).is_ok());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut rec = sample(256);
        rec.update_checksum(0x1234, ROOT_INODE, 256);
        rec.set_size(1);
        assert!(rec.verify_checksum(0x1234, ROOT_INODE, 256).is_err());
    }

    #[test]
    fn inline_symlink_round_trips() {
        let mut block = InodeBlock::default();
        block.set_inline_symlink(b"../target");
        assert_eq!(block.as_inline_symlink(9), b"../target");
    }

    #[test]
    fn block_count_respects_huge_file_flags() {
        let mut rec = sample(256);
        rec.set_block_count(100, false, false);
        assert_eq!(rec.block_count(false), 100);
        rec.set_block_count(1 << 40, true, true);
        assert_eq!(rec.block_count(true), 1 << 40);
    }
}
