//! The block and inode allocator (C9): per-group bitmap search with free-counter bookkeeping
//! kept consistent across the bitmap, group descriptor, and superblock on every call (§4.7).
//!
//! Allocation never spans a partially-filled group's metadata update across calls: each of the
//! four entry points here reads the bitmap it needs, mutates it, and persists the bitmap, the
//! group descriptor table, and the superblock before returning, so callers elsewhere in the
//! façade never have to remember to flush allocator-owned state themselves.

use log::debug;

use crate::error::{Error, Result};
use crate::ext4::bitmap::GroupBitmap;
use crate::ext4::inode::{InodeNumber, FIRST_NON_RESERVED_INODE};
use crate::ext4::Ext4Fs;
use crate::backend::Backend;

impl<B: Backend> Ext4Fs<B> {
    /// Allocates `count` blocks, scanning groups starting at `group_hint` (defaulting to group 0)
    /// and wrapping around the volume once. Returns the allocated blocks as `(start, len)` runs
    /// in the order they were filled, which is not necessarily one contiguous run if a group
    /// fragments or fills up mid-request.
    pub(crate) fn allocate_blocks(&mut self, count: u64, group_hint: Option<u32>) -> Result<Vec<(u64, u64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let group_count = self.group_descriptors.len() as u32;
        let start_group = group_hint.unwrap_or(0) % group_count;
        let mut remaining = count;
        let mut runs: Vec<(u64, u64)> = Vec::new();

        for offset in 0..group_count {
            if remaining == 0 {
                break;
            }
            let group = (start_group + offset) % group_count;
            if self.group_descriptors[group as usize].free_blocks_count() == 0 {
                continue;
            }

            let gd = self.group_descriptors[group as usize];
            let entity_count = self.blocks_in_group(group) as usize;
            let mut bm = GroupBitmap::from_block(&self.read_block(gd.block_bitmap_block())?, entity_count);
            let group_start = self.group_start_block(group);

            while remaining > 0 {
                let Some(bit) = bm.bits.find_first_free() else {
                    break;
                };
                bm.bits.set(bit);
                remaining -= 1;
                let block = group_start + bit as u64;
                match runs.last_mut() {
                    Some((run_start, run_len)) if *run_start + *run_len == block => *run_len += 1,
                    _ => runs.push((block, 1)),
                }
            }

            let block_size = self.superblock.block_size() as usize;
            self.write_block(gd.block_bitmap_block(), &bm.to_block(block_size))?;
            self.group_descriptors[group as usize].set_free_blocks_count(bm.bits.count_free() as u32);
        }

        if remaining > 0 {
            return Err(Error::OutOfBlocks { requested: count });
        }

        let new_total = self.superblock.free_block_count().saturating_sub(count);
        self.superblock.set_free_block_count(new_total);
        self.persist_gdt()?;
        self.persist_superblock()?;
        debug!("allocated {count} blocks across {} run(s)", runs.len());
        Ok(runs)
    }

    /// Returns `blocks` (each a `(start, len)` run, as produced by [`Self::allocate_blocks`] or
    /// [`super::compress_runs`]) to their groups' free bitmaps.
    pub(crate) fn free_blocks(&mut self, blocks: &[(u64, u64)]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut freed_total = 0u64;
        let mut touched_groups: Vec<u32> = Vec::new();

        for &(start, len) in blocks {
            for i in 0..len {
                let block = start + i;
                let group = self.block_group_of(block);
                if !touched_groups.contains(&group) {
                    touched_groups.push(group);
                }
            }
        }

        for group in touched_groups {
            let gd = self.group_descriptors[group as usize];
            let entity_count = self.blocks_in_group(group) as usize;
            let mut bm = GroupBitmap::from_block(&self.read_block(gd.block_bitmap_block())?, entity_count);
            let group_start = self.group_start_block(group);

            for &(start, len) in blocks {
                for i in 0..len {
                    let block = start + i;
                    if self.block_group_of(block) != group {
                        continue;
                    }
                    let bit = (block - group_start) as usize;
                    if bm.bits.clear(bit) {
                        freed_total += 1;
                    }
                }
            }

            let block_size = self.superblock.block_size() as usize;
            self.write_block(gd.block_bitmap_block(), &bm.to_block(block_size))?;
            self.group_descriptors[group as usize].set_free_blocks_count(bm.bits.count_free() as u32);
        }

        let new_total = self.superblock.free_block_count() + freed_total;
        self.superblock.set_free_block_count(new_total);
        self.persist_gdt()?;
        self.persist_superblock()?;
        debug!("freed {freed_total} block(s)");
        Ok(())
    }

    /// Allocates the lowest-numbered free inode, skipping the reserved range below
    /// [`FIRST_NON_RESERVED_INODE`] (already marked used by every group-0 inode bitmap a volume
    /// is created with, but skipped here too in case a caller ever mounts a volume that isn't).
    pub(crate) fn allocate_inode(&mut self) -> Result<InodeNumber> {
        let group_count = self.group_descriptors.len() as u32;
        for group in 0..group_count {
            if self.group_descriptors[group as usize].free_inodes_count() == 0 {
                continue;
            }
            let gd = self.group_descriptors[group as usize];
            let entity_count = self.superblock.inodes_per_group as usize;
            let mut bm = crate::bitmap::Bitmap::from_bytes(
                &self.read_block(gd.inode_bitmap_block())?,
                entity_count,
            );

            // Inode numbering is contiguous across groups (`group * inodes_per_group + bit + 1`),
            // so only group 0 can ever contain a reserved inode.
            let min_bit = if group == 0 {
                (FIRST_NON_RESERVED_INODE - 1) as usize
            } else {
                0
            };
            let Some(bit) = (min_bit..entity_count).find(|&b| !bm.check(b)) else {
                continue;
            };
            let ino = group * self.superblock.inodes_per_group + bit as u32 + 1;
            bm.set(bit);

            let block_size = self.superblock.block_size() as usize;
            self.write_block(gd.inode_bitmap_block(), &bm.to_bytes(block_size))?;
            self.group_descriptors[group as usize].set_free_inodes_count(bm.count_free() as u32);
            self.superblock.free_inodes_count = self.superblock.free_inodes_count.saturating_sub(1);
            self.persist_gdt()?;
            self.persist_superblock()?;
            debug!("allocated inode {ino}");
            return Ok(ino);
        }
        Err(Error::OutOfInodes)
    }

    /// Frees `ino`, clearing its bit in its group's inode bitmap.
    pub(crate) fn free_inode(&mut self, ino: InodeNumber) -> Result<()> {
        let group = (ino - 1) / self.superblock.inodes_per_group;
        let bit = ((ino - 1) % self.superblock.inodes_per_group) as usize;
        let gd = self.group_descriptors[group as usize];
        let entity_count = self.superblock.inodes_per_group as usize;
        let mut bm = crate::bitmap::Bitmap::from_bytes(&self.read_block(gd.inode_bitmap_block())?, entity_count);

        if !bm.clear(bit) {
            return Ok(());
        }
        let block_size = self.superblock.block_size() as usize;
        self.write_block(gd.inode_bitmap_block(), &bm.to_bytes(block_size))?;
        self.group_descriptors[group as usize].set_free_inodes_count(bm.count_free() as u32);
        self.superblock.free_inodes_count += 1;
        self.persist_gdt()?;
        self.persist_superblock()?;
        debug!("freed inode {ino}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::memory::MemoryBackend;
    use crate::ext4::sb::CreateOptions;
    use crate::ext4::Ext4Fs;

    fn fresh() -> Ext4Fs<MemoryBackend> {
        let size = 4 * 1024 * 1024;
        let backend = MemoryBackend::new(vec![0u8; size]);
        Ext4Fs::create(backend, size as u64, CreateOptions::default()).unwrap()
    }

    #[test]
    fn allocate_blocks_avoids_double_assignment() {
        let mut fs = fresh();
        let a = fs.allocate_blocks(4, None).unwrap();
        let b = fs.allocate_blocks(4, None).unwrap();
        let a_blocks: Vec<u64> = a.iter().flat_map(|&(s, l)| s..s + l).collect();
        let b_blocks: Vec<u64> = b.iter().flat_map(|&(s, l)| s..s + l).collect();
        for block in &b_blocks {
            assert!(!a_blocks.contains(block));
        }
    }

    #[test]
    fn freed_blocks_are_reusable() {
        let mut fs = fresh();
        let run = fs.allocate_blocks(2, None).unwrap();
        fs.free_blocks(&run).unwrap();
        let run2 = fs.allocate_blocks(2, None).unwrap();
        assert_eq!(run, run2);
    }

    #[test]
    fn allocate_inode_skips_reserved_range() {
        let mut fs = fresh();
        let ino = fs.allocate_inode().unwrap();
        assert!(ino >= crate::ext4::inode::FIRST_NON_RESERVED_INODE);
    }

    #[test]
    fn freed_inode_is_reusable() {
        let mut fs = fresh();
        let ino = fs.allocate_inode().unwrap();
        fs.free_inode(ino).unwrap();
        let ino2 = fs.allocate_inode().unwrap();
        assert_eq!(ino, ino2);
    }

    /// Sums a group's bitmap population count against its recorded free-block count across a
    /// random sequence of allocate/free calls (P4): the two must always add up to the group's
    /// total block capacity.
    fn group_capacities(fs: &Ext4Fs<MemoryBackend>) -> Vec<u32> {
        (0..fs.group_descriptors.len() as u32)
            .map(|g| fs.blocks_in_group(g))
            .collect()
    }

    proptest::proptest! {
        #[test]
        fn bitmap_and_free_counter_stay_consistent(
            ops in proptest::collection::vec((proptest::prelude::any::<bool>(), 1u64..8), 1..20),
        ) {
            let mut fs = fresh();
            let capacities = group_capacities(&fs);
            let mut outstanding: Vec<(u64, u64)> = Vec::new();

            for (allocate, amount) in ops {
                if allocate || outstanding.is_empty() {
                    if let Ok(run) = fs.allocate_blocks(amount, None) {
                        outstanding.extend(run);
                    }
                } else {
                    let run = outstanding.remove(0);
                    fs.free_blocks(&[run]).unwrap();
                }

                for (group, &capacity) in capacities.iter().enumerate() {
                    let gd = fs.group_descriptors[group];
                    let entity_count = capacity as usize;
                    let bm = crate::ext4::bitmap::GroupBitmap::from_block(
                        &fs.read_block(gd.block_bitmap_block()).unwrap(),
                        entity_count,
                    );
                    let used = bm.bits.count_used() as u32;
                    let free = bm.bits.count_free() as u32;
                    proptest::prop_assert_eq!(used + free, capacity);
                    proptest::prop_assert_eq!(free, gd.free_blocks_count());
                }
            }
        }
    }
}
