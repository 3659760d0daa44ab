//! Group bitmaps: the on-disk block/inode bitmap for one block group, bridging the generic
//! [`crate::bitmap::Bitmap`] (C3) primitive to the group-descriptor checksum fields that protect
//! it (§4.3, §4.7).

use crate::bitmap::Bitmap;
use crate::crc32c::crc32c_extend;

/// A group's block or inode bitmap together with the metadata needed to check/update the
/// `*_csum_lo`/`*_csum_hi` fields the group descriptor carries for it.
#[derive(Clone, Debug)]
pub struct GroupBitmap {
    pub bits: Bitmap,
}

impl GroupBitmap {
    /// Loads a group bitmap of `entity_count` live bits from one on-disk block.
    #[must_use]
    pub fn from_block(block: &[u8], entity_count: usize) -> Self {
        Self {
            bits: Bitmap::from_bytes(block, entity_count),
        }
    }

    /// Encodes this bitmap back to a full `block_size`-byte block.
    #[must_use]
    pub fn to_block(&self, block_size: usize) -> Vec<u8> {
        self.bits.to_bytes(block_size)
    }

    /// Computes the bitmap checksum ext4 stores split across a group descriptor's
    /// `*_csum_lo`/`*_csum_hi` fields: `crc32c(seed, bitmap_bytes)`, truncated to 32 bits total
    /// (the high half is only meaningful when the descriptor is 64 bytes).
    #[must_use]
    pub fn checksum(&self, seed: u32, block_size: usize) -> u32 {
        crc32c_extend(seed, &self.to_block(block_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_block_bytes() {
        let mut gb = GroupBitmap {
            bits: Bitmap::zeroed(100),
        };
        gb.bits.set(3);
        gb.bits.set(99);
        let block = gb.to_block(32);
        let back = GroupBitmap::from_block(&block, 100);
        assert!(back.bits.check(3));
        assert!(back.bits.check(99));
        assert!(!back.bits.check(4));
    }

    #[test]
    fn checksum_changes_with_contents() {
        let a = GroupBitmap {
            bits: Bitmap::zeroed(64),
        };
        let mut b = GroupBitmap {
            bits: Bitmap::zeroed(64),
        };
        b.bits.set(0);
        assert_ne!(a.checksum(0x1234, 8), b.checksum(0x1234, 8));
    }
}
