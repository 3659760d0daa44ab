//! Superblock (C4): global parameters, feature flags, counters, derived layout.
//!
//! The `Ext4Superblock` struct mirrors the on-disk layout byte for byte (`#[repr(C)]`, zero-copy
//! via [`bytemuck`]) so `parse`/`serialize` are a single cast plus a checksum pass. A copy lives at
//! byte 1024 of the filesystem and, unless `sparse_super` restricts it, at the start of every
//! backup group (§4.2).

use bytemuck::{Pod, Zeroable};
use log::{debug, warn};

use crate::crc32c::crc32c;
use crate::error::{Error, Result};
use crate::timestamp::UnixTimestamp32;

/// Byte offset of the superblock from the start of the filesystem region.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// On-disk size of the superblock structure.
pub const SUPERBLOCK_SIZE: usize = 1024;
const MAGIC: u16 = 0xEF53;

macro_rules! feature_flags {
    ($name:ident, $($variant:ident = $val:expr),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $(pub const $variant: Self = Self($val);)+

            #[must_use]
            pub fn contains(self, flag: Self) -> bool {
                self.0 & flag.0 == flag.0
            }

            pub fn insert(&mut self, flag: Self) {
                self.0 |= flag.0;
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

feature_flags!(CompatFeatures,
    DIR_PREALLOC = 0x0001,
    IMAGIC_INODES = 0x0002,
    HAS_JOURNAL = 0x0004,
    EXT_ATTR = 0x0008,
    RESIZE_INODE = 0x0010,
    DIR_INDEX = 0x0020,
    SPARSE_SUPER2 = 0x0200,
    FAST_COMMIT = 0x0400,
);

feature_flags!(IncompatFeatures,
    COMPRESSION = 0x0001,
    FILETYPE = 0x0002,
    RECOVER = 0x0004,
    JOURNAL_DEV = 0x0008,
    META_BG = 0x0010,
    EXTENTS = 0x0040,
    BIT64 = 0x0080,
    MMP = 0x0100,
    FLEX_BG = 0x0200,
    EA_INODE = 0x0400,
    CSUM_SEED = 0x2000,
    LARGEDIR = 0x4000,
    INLINE_DATA = 0x8000,
    ENCRYPT = 0x10000,
);

feature_flags!(RoCompatFeatures,
    SPARSE_SUPER = 0x0001,
    LARGE_FILE = 0x0002,
    BTREE_DIR = 0x0004,
    HUGE_FILE = 0x0008,
    GDT_CSUM = 0x0010,
    DIR_NLINK = 0x0020,
    EXTRA_ISIZE = 0x0040,
    QUOTA = 0x0100,
    BIGALLOC = 0x0200,
    METADATA_CSUM = 0x0400,
    READONLY = 0x1000,
    PROJECT = 0x2000,
);

/// How backup superblocks/GDTs are distributed across groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SparseSuperPolicy {
    /// Every group carries a backup.
    Everywhere,
    /// Group 0 and every group whose index is a power of 3, 5, or 7.
    Default,
    /// Only groups 0, 1, and the last group (`sparse_super2`).
    V2,
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    if n == 0 {
        return false;
    }
    while n % base == 0 {
        n /= base;
    }
    n == 1
}

impl SparseSuperPolicy {
    /// Returns whether `group` carries a backup superblock/GDT copy under this policy.
    #[must_use]
    pub fn has_backup(self, group: u32, group_count: u32) -> bool {
        if group == 0 {
            return true;
        }
        match self {
            SparseSuperPolicy::Everywhere => true,
            SparseSuperPolicy::Default => {
                is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
            }
            SparseSuperPolicy::V2 => group == 1 || group == group_count.saturating_sub(1),
        }
    }
}

/// The ext4 on-disk superblock, laid out exactly as it appears at byte 1024 of the filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count_lo: u32,
    pub r_blocks_count_lo: u32,
    pub free_blocks_count_lo: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: UnixTimestamp32,
    pub wtime: UnixTimestamp32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: UnixTimestamp32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub algorithm_usage_bitmap: u32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
    pub reserved_gdt_blocks: u16,
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub jnl_backup_type: u8,
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
    pub mkfs_time: UnixTimestamp32,
    pub jnl_blocks: [u32; 17],
    pub blocks_count_hi: u32,
    pub r_blocks_count_hi: u32,
    pub free_blocks_count_hi: u32,
    pub min_extra_isize: u16,
    pub want_extra_isize: u16,
    pub flags: u32,
    pub raid_stride: u16,
    pub mmp_interval: u16,
    pub mmp_block: u64,
    pub raid_stripe_width: u32,
    pub log_groups_per_flex: u8,
    pub checksum_type: u8,
    pub reserved_pad: u16,
    pub kbytes_written: u64,
    pub snapshot_inum: u32,
    pub snapshot_id: u32,
    pub snapshot_r_blocks_count: u64,
    pub snapshot_list: u32,
    pub error_count: u32,
    pub first_error_time: UnixTimestamp32,
    pub first_error_ino: u32,
    pub first_error_block: u64,
    pub first_error_func: [u8; 32],
    pub first_error_line: u32,
    pub last_error_time: UnixTimestamp32,
    pub last_error_ino: u32,
    pub last_error_line: u32,
    pub last_error_block: u64,
    pub last_error_func: [u8; 32],
    pub mount_opts: [u8; 64],
    pub usr_quota_inum: u32,
    pub grp_quota_inum: u32,
    pub overhead_blocks: u32,
    pub backup_bgs: [u32; 2],
    pub encrypt_algos: [u8; 4],
    pub encrypt_pw_salt: [u8; 16],
    pub lpf_ino: u32,
    pub prj_quota_inum: u32,
    pub checksum_seed: u32,
    pub wtime_hi: u8,
    pub mtime_hi: u8,
    pub mkfs_time_hi: u8,
    pub lastcheck_hi: u8,
    pub first_error_time_hi: u8,
    pub last_error_time_hi: u8,
    pub first_error_errcode: u8,
    pub last_error_errcode: u8,
    pub encoding: u16,
    pub encoding_flags: u16,
    pub orphan_file_inum: u32,
    pub reserved: [u32; 94],
    pub checksum: u32,
}

const _: () = assert!(core::mem::size_of::<Ext4Superblock>() == SUPERBLOCK_SIZE);

impl Ext4Superblock {
    /// Parses a superblock from its 1024-byte on-disk representation.
    pub fn parse(bytes: &[u8; SUPERBLOCK_SIZE]) -> Result<Self> {
        let sb: Self = *bytemuck::from_bytes(bytes);
        if sb.magic != MAGIC {
            return Err(Error::BadMagic { found: sb.magic });
        }
        let computed = sb.compute_checksum();
        if sb.feature_ro_compat.contains(RoCompatFeatures::METADATA_CSUM) && computed != sb.checksum
        {
            return Err(Error::BadSuperblockChecksum {
                expected: sb.checksum,
                computed,
            });
        }
        debug!(
            "parsed superblock: {} blocks, {} inodes, block_size={}",
            sb.block_count(),
            sb.inodes_count,
            sb.block_size()
        );
        if sb.feature_incompat.0 & !Self::SUPPORTED_INCOMPAT != 0 {
            warn!(
                "superblock requests incompat features {:#x} beyond what this library supports",
                sb.feature_incompat.0
            );
        }
        Ok(sb)
    }

    const SUPPORTED_INCOMPAT: u32 = IncompatFeatures::FILETYPE.0
        | IncompatFeatures::EXTENTS.0
        | IncompatFeatures::BIT64.0
        | IncompatFeatures::FLEX_BG.0
        | IncompatFeatures::CSUM_SEED.0;

    /// Serializes this superblock back to its 1024-byte on-disk representation, with the checksum
    /// field freshly recomputed.
    #[must_use]
    pub fn serialize(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut sb = *self;
        sb.checksum = sb.compute_checksum();
        *bytemuck::bytes_of(&sb)
            .try_into()
            .expect("superblock size is fixed")
    }

    /// Block size in bytes, derived from `log_block_size`.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        1024u64 << self.log_block_size
    }

    /// Total block count, combining the 32-bit low and high halves when the 64-bit feature is on.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        if self.feature_incompat.contains(IncompatFeatures::BIT64) {
            u64::from(self.blocks_count_lo) | (u64::from(self.blocks_count_hi) << 32)
        } else {
            u64::from(self.blocks_count_lo)
        }
    }

    pub fn set_block_count(&mut self, count: u64) {
        self.blocks_count_lo = count as u32;
        self.blocks_count_hi = (count >> 32) as u32;
    }

    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        if self.feature_incompat.contains(IncompatFeatures::BIT64) {
            u64::from(self.free_blocks_count_lo) | (u64::from(self.free_blocks_count_hi) << 32)
        } else {
            u64::from(self.free_blocks_count_lo)
        }
    }

    pub fn set_free_block_count(&mut self, count: u64) {
        self.free_blocks_count_lo = count as u32;
        self.free_blocks_count_hi = (count >> 32) as u32;
    }

    /// Number of block groups spanning the filesystem.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.block_count().div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// Blocks consumed by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks_per_group(&self) -> u64 {
        (u64::from(self.inodes_per_group) * u64::from(self.inode_size)).div_ceil(self.block_size())
    }

    /// Size of a group descriptor record: 64 bytes when the 64-bit feature is set, else 32.
    #[must_use]
    pub fn group_descriptor_size(&self) -> u16 {
        if self.feature_incompat.contains(IncompatFeatures::BIT64) {
            64
        } else {
            32
        }
    }

    /// The policy governing which groups carry backup superblocks/GDTs.
    #[must_use]
    pub fn sparse_super_policy(&self) -> SparseSuperPolicy {
        if self.feature_compat.contains(CompatFeatures::SPARSE_SUPER2) {
            SparseSuperPolicy::V2
        } else if self.feature_ro_compat.contains(RoCompatFeatures::SPARSE_SUPER) {
            SparseSuperPolicy::Default
        } else {
            SparseSuperPolicy::Everywhere
        }
    }

    /// Block at which the group descriptor table begins (block 1 if block size > 1024, else 2).
    #[must_use]
    pub fn gdt_start_block(&self) -> u64 {
        if self.block_size() > 1024 {
            1
        } else {
            2
        }
    }

    /// Checksum seed: `crc32c(0xFFFFFFFF, uuid)`, persisted so callers never recompute it.
    #[must_use]
    pub fn derive_checksum_seed(&self) -> u32 {
        if self.feature_incompat.contains(IncompatFeatures::CSUM_SEED) {
            self.checksum_seed
        } else {
            crc32c(&self.uuid)
        }
    }

    /// Trimmed (at the first NUL) volume label.
    #[must_use]
    pub fn label(&self) -> String {
        let end = self.volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }

    /// Sets the volume label, truncating to 16 bytes and NUL-padding the remainder.
    pub fn set_label(&mut self, label: &str) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(16);
        self.volume_name = [0u8; 16];
        self.volume_name[..len].copy_from_slice(&bytes[..len]);
    }

    fn compute_checksum(&self) -> u32 {
        let mut zeroed = *self;
        zeroed.checksum = 0;
        let bytes = bytemuck::bytes_of(&zeroed);
        crc32c(&bytes[..1020])
    }
}

/// `Create()`-time parameters, overridable from the §6.4 defaults.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    pub block_size: u32,
    pub inode_ratio: u32,
    pub inode_size: u16,
    pub label: String,
    pub reserved_blocks_percent: u8,
    pub sparse_super: SparseSuperPolicy,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inode_ratio: 8192,
            inode_size: 256,
            label: "diskfs_ext4".to_string(),
            reserved_blocks_percent: 5,
            sparse_super: SparseSuperPolicy::Default,
        }
    }
}

impl CreateOptions {
    #[must_use]
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn inode_size(mut self, size: u16) -> Self {
        self.inode_size = size;
        self
    }

    #[must_use]
    pub fn inode_ratio(mut self, ratio: u32) -> Self {
        self.inode_ratio = ratio;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ext4Superblock {
        let mut sb = Ext4Superblock::zeroed();
        sb.magic = MAGIC;
        sb.log_block_size = 2;
        sb.blocks_per_group = 32768;
        sb.inodes_per_group = 8192;
        sb.inode_size = 256;
        sb.set_block_count(65536);
        sb.uuid = [0x42; 16];
        sb.set_label("roundtrip");
        sb
    }

    #[test]
    fn round_trips_through_serialize() {
        let sb = sample();
        let bytes = sb.serialize();
        let back = Ext4Superblock::parse(&bytes).unwrap();
        assert_eq!(back.block_count(), 65536);
        assert_eq!(back.label(), "roundtrip");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut sb = sample();
        sb.magic = 0;
        let bytes = sb.serialize();
        assert!(matches!(
            Ext4Superblock::parse(&bytes),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn block_size_matches_log_block_size() {
        let sb = sample();
        assert_eq!(sb.block_size(), 4096);
    }

    #[test]
    fn default_sparse_policy_skips_non_power_groups() {
        let policy = SparseSuperPolicy::Default;
        assert!(policy.has_backup(0, 100));
        assert!(policy.has_backup(3, 100));
        assert!(policy.has_backup(9, 100));
        assert!(!policy.has_backup(2, 100));
        assert!(!policy.has_backup(4, 100));
    }

    #[test]
    fn v2_sparse_policy_only_keeps_first_and_last() {
        let policy = SparseSuperPolicy::V2;
        assert!(policy.has_backup(0, 10));
        assert!(policy.has_backup(1, 10));
        assert!(policy.has_backup(9, 10));
        assert!(!policy.has_backup(5, 10));
    }
}
