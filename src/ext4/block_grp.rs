//! Group descriptor table (C5): per-group metadata, redundant per the sparse-super policy.

use bytemuck::{Pod, Zeroable};
use log::{debug, error};

use crate::crc16::crc16;
use crate::crc32c::crc32c_extend;
use crate::error::{Error, Result};
use crate::ext4::sb::{Ext4Superblock, RoCompatFeatures};

/// Block-group-level flags (`EXT4_BG_*`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct GroupFlags(pub u16);

impl GroupFlags {
    pub const INODE_UNINIT: Self = Self(0x0001);
    pub const BLOCK_UNINIT: Self = Self(0x0002);
    pub const INODE_ZEROED: Self = Self(0x0004);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// Which checksum, if any, protects a group descriptor (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GdChecksumKind {
    None,
    /// CRC16 with the ext2 polynomial, over `fs_uuid || group_index_le || descriptor`.
    Gdt,
    /// CRC32c truncated to 16 bits, same input shape as `Gdt`.
    Metadata,
}

impl GdChecksumKind {
    /// Picks the checksum kind a mounted filesystem's feature flags call for: `metadata_csum`
    /// wins over the older `gdt_csum` when (incorrectly) both are set, and neither means a group
    /// descriptor carries no checksum at all.
    #[must_use]
    pub fn from_superblock(sb: &Ext4Superblock) -> Self {
        if sb.feature_ro_compat.contains(RoCompatFeatures::METADATA_CSUM) {
            Self::Metadata
        } else if sb.feature_ro_compat.contains(RoCompatFeatures::GDT_CSUM) {
            Self::Gdt
        } else {
            Self::None
        }
    }
}

/// The 64-byte on-disk group descriptor record. When the filesystem uses 32-byte descriptors
/// (the 64-bit feature is off) only the first half of this struct is read or written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct GroupDescriptor {
    pub block_bitmap_lo: u32,
    pub inode_bitmap_lo: u32,
    pub inode_table_lo: u32,
    pub free_blocks_count_lo: u16,
    pub free_inodes_count_lo: u16,
    pub used_dirs_count_lo: u16,
    pub flags: GroupFlags,
    pub exclude_bitmap_lo: u32,
    pub block_bitmap_csum_lo: u16,
    pub inode_bitmap_csum_lo: u16,
    pub itable_unused_lo: u16,
    pub checksum: u16,
    pub block_bitmap_hi: u32,
    pub inode_bitmap_hi: u32,
    pub inode_table_hi: u32,
    pub free_blocks_count_hi: u16,
    pub free_inodes_count_hi: u16,
    pub used_dirs_count_hi: u16,
    pub itable_unused_hi: u16,
    pub exclude_bitmap_hi: u32,
    pub block_bitmap_csum_hi: u16,
    pub inode_bitmap_csum_hi: u16,
    pub reserved: u32,
}

const _: () = assert!(core::mem::size_of::<GroupDescriptor>() == 64);

/// Small (32-byte) on-disk encoding of a [`GroupDescriptor`].
pub const SMALL_SIZE: usize = 32;
/// Large (64-byte) on-disk encoding, used when the 64-bit feature is enabled.
pub const LARGE_SIZE: usize = 64;

impl GroupDescriptor {
    /// Parses one descriptor record of `gd_size` bytes (32 or 64) at the front of `bytes`.
    pub fn parse(bytes: &[u8], gd_size: u16) -> Result<Self> {
        let gd_size = gd_size as usize;
        if bytes.len() < gd_size {
            return Err(Error::Malformed("truncated group descriptor"));
        }
        let mut buf = [0u8; LARGE_SIZE];
        buf[..gd_size].copy_from_slice(&bytes[..gd_size]);
        Ok(*bytemuck::from_bytes(&buf))
    }

    /// Serializes this descriptor to `gd_size` bytes (32 or 64).
    #[must_use]
    pub fn serialize(&self, gd_size: u16) -> Vec<u8> {
        let full = *bytemuck::bytes_of(self);
        full[..gd_size as usize].to_vec()
    }

    #[must_use]
    pub fn block_bitmap_block(&self) -> u64 {
        u64::from(self.block_bitmap_lo) | (u64::from(self.block_bitmap_hi) << 32)
    }

    pub fn set_block_bitmap_block(&mut self, block: u64) {
        self.block_bitmap_lo = block as u32;
        self.block_bitmap_hi = (block >> 32) as u32;
    }

    #[must_use]
    pub fn inode_bitmap_block(&self) -> u64 {
        u64::from(self.inode_bitmap_lo) | (u64::from(self.inode_bitmap_hi) << 32)
    }

    pub fn set_inode_bitmap_block(&mut self, block: u64) {
        self.inode_bitmap_lo = block as u32;
        self.inode_bitmap_hi = (block >> 32) as u32;
    }

    #[must_use]
    pub fn inode_table_block(&self) -> u64 {
        u64::from(self.inode_table_lo) | (u64::from(self.inode_table_hi) << 32)
    }

    pub fn set_inode_table_block(&mut self, block: u64) {
        self.inode_table_lo = block as u32;
        self.inode_table_hi = (block >> 32) as u32;
    }

    #[must_use]
    pub fn free_blocks_count(&self) -> u32 {
        u32::from(self.free_blocks_count_lo) | (u32::from(self.free_blocks_count_hi) << 16)
    }

    pub fn set_free_blocks_count(&mut self, count: u32) {
        self.free_blocks_count_lo = count as u16;
        self.free_blocks_count_hi = (count >> 16) as u16;
    }

    #[must_use]
    pub fn free_inodes_count(&self) -> u32 {
        u32::from(self.free_inodes_count_lo) | (u32::from(self.free_inodes_count_hi) << 16)
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        self.free_inodes_count_lo = count as u16;
        self.free_inodes_count_hi = (count >> 16) as u16;
    }

    #[must_use]
    pub fn used_dirs_count(&self) -> u32 {
        u32::from(self.used_dirs_count_lo) | (u32::from(self.used_dirs_count_hi) << 16)
    }

    pub fn set_used_dirs_count(&mut self, count: u32) {
        self.used_dirs_count_lo = count as u16;
        self.used_dirs_count_hi = (count >> 16) as u16;
    }

    #[must_use]
    pub fn unused_inodes_count(&self) -> u32 {
        u32::from(self.itable_unused_lo) | (u32::from(self.itable_unused_hi) << 16)
    }

    pub fn set_unused_inodes_count(&mut self, count: u32) {
        self.itable_unused_lo = count as u16;
        self.itable_unused_hi = (count >> 16) as u16;
    }

    /// Computes this descriptor's checksum as `group_index` within the filesystem described by
    /// `seed` (the superblock's checksum seed).
    #[must_use]
    pub fn compute_checksum(&self, kind: GdChecksumKind, seed: u32, group_index: u32) -> u16 {
        let mut zeroed = *self;
        zeroed.checksum = 0;
        let group_seed = crc32c_extend(seed, &group_index.to_le_bytes());
        let bytes = bytemuck::bytes_of(&zeroed);
        match kind {
            GdChecksumKind::None => 0,
            GdChecksumKind::Gdt => crc16(&[&group_seed.to_le_bytes()[..], bytes].concat()),
            GdChecksumKind::Metadata => {
                (crc32c_extend(group_seed, bytes) & 0xFFFF) as u16
            }
        }
    }

    /// Verifies `self.checksum` against a freshly computed value, logging and returning an error
    /// on mismatch.
    pub fn verify_checksum(&self, kind: GdChecksumKind, seed: u32, group_index: u32) -> Result<()> {
        if kind == GdChecksumKind::None {
            return Ok(());
        }
        let computed = self.compute_checksum(kind, seed, group_index);
        if computed != self.checksum {
            error!(
                "group {group_index} descriptor checksum mismatch: expected {:#06x}, computed {:#06x}",
                self.checksum, computed
            );
            return Err(Error::BadGroupDescriptorChecksum {
                group: group_index,
                expected: self.checksum,
                computed,
            });
        }
        debug!("group {group_index} descriptor checksum verified");
        Ok(())
    }

    /// Recomputes and stores this descriptor's checksum.
    pub fn update_checksum(&mut self, kind: GdChecksumKind, seed: u32, group_index: u32) {
        self.checksum = self.compute_checksum(kind, seed, group_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes_large() {
        let mut gd = GroupDescriptor::zeroed();
        gd.set_block_bitmap_block(12345);
        gd.set_free_blocks_count(999);
        let bytes = gd.serialize(LARGE_SIZE as u16);
        let back = GroupDescriptor::parse(&bytes, LARGE_SIZE as u16).unwrap();
        assert_eq!(back.block_bitmap_block(), 12345);
        assert_eq!(back.free_blocks_count(), 999);
    }

    #[test]
    fn round_trips_through_bytes_small() {
        let mut gd = GroupDescriptor::zeroed();
        gd.set_block_bitmap_block(77);
        let bytes = gd.serialize(SMALL_SIZE as u16);
        assert_eq!(bytes.len(), SMALL_SIZE);
        let back = GroupDescriptor::parse(&bytes, SMALL_SIZE as u16).unwrap();
        assert_eq!(back.block_bitmap_block(), 77);
    }

    #[test]
    fn gdt_checksum_round_trips() {
        let mut gd = GroupDescriptor::zeroed();
        gd.set_block_bitmap_block(1);
        gd.set_inode_bitmap_block(2);
        gd.set_inode_table_block(3);
        gd.update_checksum(GdChecksumKind::Gdt, 0xABCD_EF01, 4);
        assert!(gd.verify_checksum(GdChecksumKind::Gdt, 0xABCD_EF01, 4).is_ok());
    }

    #[test]
    fn metadata_checksum_detects_corruption() {
        let mut gd = GroupDescriptor::zeroed();
        gd.update_checksum(GdChecksumKind::Metadata, 0x1234, 0);
        gd.set_free_blocks_count(1);
        assert!(gd.verify_checksum(GdChecksumKind::Metadata, 0x1234, 0).is_err());
    }
}
