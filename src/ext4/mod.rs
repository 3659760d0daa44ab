//! The filesystem façade (C10): owns a mounted (or freshly created) volume's superblock and group
//! descriptor table, and turns path-based operations into the lower-level reads/writes the other
//! modules describe. Everything here is built from [`Backend`] alone — no module in this crate
//! ever reaches past it to touch an operating system's own filesystem driver.

use std::path::PathBuf;

use bytemuck::Zeroable;
use log::info;

use crate::backend::Backend;
use crate::error::{Error, Result};

pub mod bitmap;
pub mod block_grp;
pub mod dir;
pub mod extent;
pub mod file;
pub mod hash;
pub mod inode;
pub mod sb;

mod alloc;

pub use file::{FileHandle, OpenFlags, SeekFrom};
pub use sb::CreateOptions;

use crate::bitmap::Bitmap;
use bitmap::GroupBitmap;
use block_grp::{GdChecksumKind, GroupDescriptor};
use dir::{DirFileType, LinearEntry};
use extent::{Extent, Root};
use inode::{
    FileMode, FileType, Inode, InodeBlock, InodeExtra, InodeFlags, InodeNumber, InodeRecord,
    FIRST_NON_RESERVED_INODE, LOST_AND_FOUND_INODE, ROOT_INODE,
};
use sb::{Ext4Superblock, RoCompatFeatures, SparseSuperPolicy, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use crate::timestamp::UnixTimestamp;

/// A mounted or freshly created ext4 volume, backed by any [`Backend`].
///
/// `Ext4Fs` owns the superblock and group descriptor table in memory and keeps them consistent
/// with the backend on every mutation; a [`FileHandle`] returned from [`Ext4Fs::open`] carries no
/// borrow of its own and is always used together with `&self`/`&mut self` of the filesystem that
/// opened it.
pub struct Ext4Fs<B: Backend> {
    backend: B,
    superblock: Ext4Superblock,
    group_descriptors: Vec<GroupDescriptor>,
    checksum_seed: u32,
    gd_checksum_kind: GdChecksumKind,
}

/// One entry returned by [`Ext4Fs::read_dir`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeNumber,
    pub file_type: FileType,
}

/// A snapshot of an inode's metadata, returned by [`Ext4Fs::stat`].
#[derive(Clone, Debug)]
pub struct Metadata {
    pub inode: InodeNumber,
    pub file_type: FileType,
    pub permissions: u16,
    pub size: u64,
    pub links_count: u16,
    pub uid: u32,
    pub gid: u32,
    pub block_count_512: u64,
    pub access_time: UnixTimestamp,
    pub modification_time: UnixTimestamp,
    pub change_time: UnixTimestamp,
    pub creation_time: Option<UnixTimestamp>,
}

const MAX_SYMLINK_HOPS: u32 = 40;

fn current_timestamp() -> UnixTimestamp {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    UnixTimestamp::from_parts(dur.as_secs() as i64, dur.subsec_nanos())
}

fn split_path(path: &str) -> Result<Vec<String>> {
    if path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn split_parent(path: &str) -> Result<(String, String)> {
    let comps = split_path(path)?;
    let name = comps
        .last()
        .cloned()
        .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
    let parent = comps[..comps.len() - 1].join("/");
    Ok((parent, name))
}

fn dir_entry(inode: InodeNumber, name: &str, file_type: DirFileType) -> LinearEntry {
    LinearEntry {
        inode,
        rec_len: LinearEntry::packed_len(name.len()),
        file_type,
        name: name.as_bytes().to_vec(),
    }
}

/// Merges ascending, distinct block numbers into contiguous `(start, len)` runs.
pub(crate) fn compress_runs(blocks: &[u64]) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for &b in blocks {
        if let Some(last) = runs.last_mut() {
            if last.0 + last.1 == b {
                last.1 += 1;
                continue;
            }
        }
        runs.push((b, 1));
    }
    runs
}

impl<B: Backend> Ext4Fs<B> {
    /// Mounts an existing ext4 image, parsing and checksum-verifying the superblock and the whole
    /// group descriptor table.
    pub fn mount(backend: B) -> Result<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        backend.read_at(&mut raw, SUPERBLOCK_OFFSET)?;
        let superblock = Ext4Superblock::parse(&raw)?;
        let gd_checksum_kind = GdChecksumKind::from_superblock(&superblock);
        let checksum_seed = superblock.derive_checksum_seed();

        let group_count = superblock.group_count();
        let gd_size = superblock.group_descriptor_size();
        let gdt_start = superblock.gdt_start_block();
        let gdt_bytes_needed = u64::from(group_count) * u64::from(gd_size);
        let gdt_block_count = gdt_bytes_needed.div_ceil(superblock.block_size());
        let mut gdt_buf = vec![0u8; (gdt_block_count * superblock.block_size()) as usize];
        backend.read_at(&mut gdt_buf, gdt_start * superblock.block_size())?;

        let mut group_descriptors = Vec::with_capacity(group_count as usize);
        for group in 0..group_count {
            let off = group as usize * gd_size as usize;
            let gd = GroupDescriptor::parse(&gdt_buf[off..off + gd_size as usize], gd_size)?;
            if gd_checksum_kind != GdChecksumKind::None {
                gd.verify_checksum(gd_checksum_kind, checksum_seed, group)?;
            }
            group_descriptors.push(gd);
        }

        info!(
            "mounted ext4 volume {:?}: {} groups, {} blocks, {} inodes",
            superblock.label(),
            group_count,
            superblock.block_count(),
            superblock.inodes_count
        );

        Ok(Self {
            backend,
            superblock,
            group_descriptors,
            checksum_seed,
            gd_checksum_kind,
        })
    }

    /// Formats `backend`'s first `total_size` bytes as a new ext4 volume: superblock, group
    /// descriptor table, a block/inode bitmap per group, and the two reserved directories every
    /// ext4 volume carries (`/` and `/lost+found`).
    pub fn create(backend: B, total_size: u64, options: CreateOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || !(1024..=65536).contains(&block_size) {
            return Err(Error::UnsupportedFeature(
                "block size must be a power of two between 1024 and 65536",
            ));
        }
        let backend_size = backend.stat()?.size;
        if backend_size < total_size {
            return Err(Error::OutOfRange {
                offset: 0,
                length: total_size,
                size: backend_size,
            });
        }

        let log_block_size = (block_size / 1024).trailing_zeros();
        let first_data_block: u32 = if block_size > 1024 { 0 } else { 1 };
        let total_blocks = total_size / u64::from(block_size);
        let usable_blocks = total_blocks.saturating_sub(u64::from(first_data_block));
        let blocks_per_group = 8 * block_size;
        let group_count = usable_blocks.div_ceil(u64::from(blocks_per_group)) as u32;
        if group_count == 0 {
            return Err(Error::UnsupportedFeature(
                "volume too small to hold even one block group",
            ));
        }

        let total_inodes_target =
            ((total_size / u64::from(options.inode_ratio)) as u32).max(group_count * 8);
        let inodes_per_group = total_inodes_target.div_ceil(group_count);

        let mut sb = Ext4Superblock::zeroed();
        sb.magic = 0xEF53;
        sb.log_block_size = log_block_size;
        sb.log_cluster_size = log_block_size;
        sb.first_data_block = first_data_block;
        sb.blocks_per_group = blocks_per_group;
        sb.clusters_per_group = blocks_per_group;
        sb.set_block_count(total_blocks);
        sb.inodes_per_group = inodes_per_group;
        sb.inodes_count = inodes_per_group * group_count;
        sb.inode_size = options.inode_size;
        sb.r_blocks_count_lo =
            ((u128::from(total_blocks) * u128::from(options.reserved_blocks_percent)) / 100) as u32;
        sb.first_ino = FIRST_NON_RESERVED_INODE + 1;
        sb.rev_level = 1;
        sb.state = 1;
        sb.errors = 1;
        sb.max_mnt_count = 0xFFFF;
        sb.min_extra_isize = 32;
        sb.want_extra_isize = 32;
        sb.def_hash_version = hash::HashVersion::HalfMd4.code();
        sb.feature_incompat = sb::IncompatFeatures::FILETYPE
            | sb::IncompatFeatures::EXTENTS
            | sb::IncompatFeatures::CSUM_SEED;
        let mut ro = RoCompatFeatures::EXTRA_ISIZE | RoCompatFeatures::METADATA_CSUM;
        match options.sparse_super {
            SparseSuperPolicy::Default => ro = ro | RoCompatFeatures::SPARSE_SUPER,
            SparseSuperPolicy::V2 => {
                sb.feature_compat = sb.feature_compat | sb::CompatFeatures::SPARSE_SUPER2;
            }
            SparseSuperPolicy::Everywhere => {}
        }
        sb.feature_ro_compat = ro;
        sb.uuid = *uuid::Uuid::new_v4().as_bytes();
        sb.checksum_seed = crate::crc32c::crc32c(&sb.uuid);
        let seed_bytes = *uuid::Uuid::new_v4().as_bytes();
        sb.hash_seed = [
            u32::from_le_bytes(seed_bytes[0..4].try_into().unwrap()),
            u32::from_le_bytes(seed_bytes[4..8].try_into().unwrap()),
            u32::from_le_bytes(seed_bytes[8..12].try_into().unwrap()),
            u32::from_le_bytes(seed_bytes[12..16].try_into().unwrap()),
        ];
        sb.set_label(&options.label);
        let now = current_timestamp();
        sb.mkfs_time = (now.raw_seconds() as u32).into();
        sb.wtime = sb.mkfs_time;
        sb.mtime = sb.mkfs_time;

        let gd_checksum_kind = GdChecksumKind::from_superblock(&sb);
        let checksum_seed = sb.derive_checksum_seed();

        let mut fs = Self {
            backend,
            superblock: sb,
            group_descriptors: vec![GroupDescriptor::zeroed(); group_count as usize],
            checksum_seed,
            gd_checksum_kind,
        };

        let mut group_bitmaps: Vec<GroupBitmap> = Vec::with_capacity(group_count as usize);
        for group in 0..group_count {
            let entity_count = fs.blocks_in_group(group) as usize;
            let mut bm = GroupBitmap {
                bits: Bitmap::zeroed(entity_count),
            };
            let overhead = fs.group_overhead_blocks(group);
            let inode_table_len = fs.superblock.inode_table_blocks_per_group();
            for b in 0..(overhead + 2 + inode_table_len) {
                bm.bits.set(b as usize);
            }

            let start = fs.group_start_block(group);
            let mut gd = GroupDescriptor::zeroed();
            gd.set_block_bitmap_block(start + overhead);
            gd.set_inode_bitmap_block(start + overhead + 1);
            gd.set_inode_table_block(start + overhead + 2);
            fs.group_descriptors[group as usize] = gd;
            group_bitmaps.push(bm);
        }

        let group0_start = fs.group_start_block(0);
        let group0_data_start = group0_start + fs.metadata_blocks_in_group(0);
        let root_data_block = group0_data_start;
        let lost_found_data_block = group0_data_start + 1;
        group_bitmaps[0].bits.set((root_data_block - group0_start) as usize);
        group_bitmaps[0]
            .bits
            .set((lost_found_data_block - group0_start) as usize);

        let mut inode_bitmaps: Vec<Bitmap> = (0..group_count)
            .map(|_| Bitmap::zeroed(inodes_per_group as usize))
            .collect();
        for i in 0..FIRST_NON_RESERVED_INODE {
            inode_bitmaps[0].set(i as usize);
        }

        for group in 0..group_count {
            let gd = fs.group_descriptors[group as usize];
            let len_bytes = fs.superblock.inode_table_blocks_per_group() * fs.superblock.block_size();
            fs.write_block_range(gd.inode_table_block(), &vec![0u8; len_bytes as usize])?;
        }

        let mut root_rec = fs.new_inode_record(FileMode::new(FileType::Directory, 0o755), now);
        root_rec.base.links_count = 3;
        root_rec.set_size(fs.superblock.block_size());
        root_rec.base.flags = root_rec.base.flags | InodeFlags::EXTENTS;
        root_rec.base.block = InodeBlock(Root::Leaf(vec![Extent::new(0, 1, root_data_block, true)]).serialize());
        root_rec.set_block_count(fs.superblock.block_size() / 512, false, false);
        fs.write_inode_record(ROOT_INODE, &mut root_rec)?;

        let mut lf_rec = fs.new_inode_record(FileMode::new(FileType::Directory, 0o755), now);
        lf_rec.base.links_count = 2;
        lf_rec.set_size(fs.superblock.block_size());
        lf_rec.base.flags = lf_rec.base.flags | InodeFlags::EXTENTS;
        lf_rec.base.block =
            InodeBlock(Root::Leaf(vec![Extent::new(0, 1, lost_found_data_block, true)]).serialize());
        lf_rec.set_block_count(fs.superblock.block_size() / 512, false, false);
        fs.write_inode_record(LOST_AND_FOUND_INODE, &mut lf_rec)?;

        fs.write_dir_block(
            root_data_block,
            ROOT_INODE,
            root_rec.base.generation,
            &[
                dir_entry(ROOT_INODE, ".", DirFileType::DIRECTORY),
                dir_entry(ROOT_INODE, "..", DirFileType::DIRECTORY),
                dir_entry(LOST_AND_FOUND_INODE, "lost+found", DirFileType::DIRECTORY),
            ],
        )?;
        fs.write_dir_block(
            lost_found_data_block,
            LOST_AND_FOUND_INODE,
            lf_rec.base.generation,
            &[
                dir_entry(LOST_AND_FOUND_INODE, ".", DirFileType::DIRECTORY),
                dir_entry(ROOT_INODE, "..", DirFileType::DIRECTORY),
            ],
        )?;

        let mut total_free_blocks = 0u64;
        let mut total_free_inodes = 0u32;
        for group in 0..group_count {
            let free_blocks = group_bitmaps[group as usize].bits.count_free() as u32;
            total_free_blocks += u64::from(free_blocks);
            fs.group_descriptors[group as usize].set_free_blocks_count(free_blocks);
            let free_inodes = inode_bitmaps[group as usize].count_free() as u32;
            total_free_inodes += free_inodes;
            fs.group_descriptors[group as usize].set_free_inodes_count(free_inodes);
            fs.group_descriptors[group as usize].set_used_dirs_count(if group == 0 { 2 } else { 0 });

            let block_size = fs.superblock.block_size() as usize;
            fs.write_block(
                fs.group_descriptors[group as usize].block_bitmap_block(),
                &group_bitmaps[group as usize].to_block(block_size),
            )?;
            fs.write_block(
                fs.group_descriptors[group as usize].inode_bitmap_block(),
                &inode_bitmaps[group as usize].to_bytes(block_size),
            )?;
        }
        fs.superblock.set_free_block_count(total_free_blocks);
        fs.superblock.free_inodes_count = total_free_inodes;

        fs.persist_gdt()?;
        fs.persist_superblock()?;

        info!(
            "created ext4 volume {:?}: {} groups, {} blocks, {} inodes",
            fs.superblock.label(),
            group_count,
            total_blocks,
            fs.superblock.inodes_count
        );
        Ok(fs)
    }

    /// The volume label.
    #[must_use]
    pub fn label(&self) -> String {
        self.superblock.label()
    }

    /// Sets and persists the volume label.
    pub fn set_label(&mut self, label: &str) -> Result<()> {
        self.superblock.set_label(label);
        self.persist_superblock()
    }

    /// Resolves `path` (slash-separated, relative to the volume root; a leading slash is
    /// rejected since there is no concept of a parent above this volume) to its inode, following
    /// symlinks including a trailing one.
    pub fn resolve(&self, path: &str) -> Result<InodeNumber> {
        Ok(self.resolve_impl(ROOT_INODE, path, true, 0)?.0)
    }

    fn resolve_no_follow(&self, path: &str) -> Result<(InodeNumber, FileType)> {
        self.resolve_impl(ROOT_INODE, path, false, 0)
    }

    fn resolve_impl(
        &self,
        start_dir: InodeNumber,
        path: &str,
        follow_final: bool,
        hops: u32,
    ) -> Result<(InodeNumber, FileType)> {
        if hops >= MAX_SYMLINK_HOPS {
            return Err(Error::Malformed("too many symlink hops while resolving path"));
        }
        let components = split_path(path)?;
        if components.is_empty() {
            let rec = self.read_inode_record(start_dir)?;
            return Ok((start_dir, rec.file_type()));
        }
        let mut dir = start_dir;
        let n = components.len();
        for (i, comp) in components.iter().enumerate() {
            let (child_ino, child_ft) = self
                .lookup_child(dir, comp)?
                .ok_or_else(|| Error::NotFound(PathBuf::from(path)))?;
            let is_last = i + 1 == n;
            if child_ft == FileType::SymbolicLink && (!is_last || follow_final) {
                let target = self.read_symlink_target(child_ino)?;
                let target = String::from_utf8_lossy(&target).into_owned();
                let (resolved_ino, resolved_ft) = if let Some(rest) = target.strip_prefix('/') {
                    self.resolve_impl(ROOT_INODE, rest, true, hops + 1)?
                } else {
                    self.resolve_impl(dir, &target, true, hops + 1)?
                };
                if is_last {
                    return Ok((resolved_ino, resolved_ft));
                }
                dir = resolved_ino;
            } else if is_last {
                return Ok((child_ino, child_ft));
            } else {
                dir = child_ino;
            }
        }
        unreachable!("a non-empty component list always returns from inside the loop")
    }

    fn resolve_parent(&self, path: &str) -> Result<(InodeNumber, String)> {
        let (parent_path, name) = split_parent(path)?;
        let parent_ino = self.resolve(&parent_path)?;
        let parent_rec = self.read_inode_record(parent_ino)?;
        if parent_rec.file_type() != FileType::Directory {
            return Err(Error::NotADirectory(PathBuf::from(parent_path)));
        }
        Ok((parent_ino, name))
    }

    fn lookup_child(&self, dir_ino: InodeNumber, name: &str) -> Result<Option<(InodeNumber, FileType)>> {
        let rec = self.read_inode_record(dir_ino)?;
        if rec.file_type() != FileType::Directory {
            return Err(Error::NotADirectory(PathBuf::from(name)));
        }
        for entry in self.dir_entries_raw(&rec)? {
            if entry.name == name.as_bytes() {
                let child = self.read_inode_record(entry.inode)?;
                return Ok(Some((entry.inode, child.file_type())));
            }
        }
        Ok(None)
    }

    fn dir_entries_raw(&self, rec: &InodeRecord) -> Result<Vec<LinearEntry>> {
        let block_size = self.superblock.block_size();
        let n_blocks = rec.size().div_ceil(block_size);
        let root = Root::parse(&rec.base.block.0)?;
        let mut out = Vec::new();
        for idx in 0..n_blocks {
            let mapped = extent::find_blocks(&root, &mut |b| self.read_block(b), idx, 1)?;
            let Some(Some(disk_block)) = mapped.into_iter().next() else {
                continue;
            };
            let data = self.read_block(disk_block)?;
            out.extend(dir::decode_block(&data)?);
        }
        Ok(out)
    }

    /// Lists the entries of the directory at `path`, excluding `.` and `..`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let ino = self.resolve(path)?;
        let rec = self.read_inode_record(ino)?;
        if rec.file_type() != FileType::Directory {
            return Err(Error::NotADirectory(PathBuf::from(path)));
        }
        let mut out = Vec::new();
        for entry in self.dir_entries_raw(&rec)? {
            if entry.name == b"." || entry.name == b".." {
                continue;
            }
            let child = self.read_inode_record(entry.inode)?;
            out.push(DirEntry {
                name: String::from_utf8_lossy(&entry.name).into_owned(),
                inode: entry.inode,
                file_type: child.file_type(),
            });
        }
        Ok(out)
    }

    /// Returns metadata for the inode `path` resolves to.
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let ino = self.resolve(path)?;
        let rec = self.read_inode_record(ino)?;
        Ok(Metadata {
            inode: ino,
            file_type: rec.file_type(),
            permissions: rec.base.mode.permissions(),
            size: rec.size(),
            links_count: rec.base.links_count,
            uid: rec.uid(),
            gid: rec.gid(),
            block_count_512: rec.block_count(self.superblock.feature_ro_compat.contains(RoCompatFeatures::HUGE_FILE)),
            access_time: rec.access_time(),
            modification_time: rec.modification_time(),
            change_time: rec.change_time(),
            creation_time: rec.creation_time(),
        })
    }

    /// Creates a directory at `path`. The parent must already exist.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        if self.lookup_child(parent_ino, &name)?.is_some() {
            return Err(Error::AlreadyExists(PathBuf::from(path)));
        }

        let new_ino = self.allocate_inode()?;
        let (data_block, _) = self
            .allocate_blocks(1, None)?
            .into_iter()
            .next()
            .ok_or(Error::OutOfBlocks { requested: 1 })?;

        let now = current_timestamp();
        let mut rec = self.new_inode_record(FileMode::new(FileType::Directory, 0o755), now);
        rec.base.links_count = 2;
        rec.set_size(self.superblock.block_size());
        rec.base.flags = rec.base.flags | InodeFlags::EXTENTS;
        rec.base.block = InodeBlock(Root::Leaf(vec![Extent::new(0, 1, data_block, true)]).serialize());
        rec.set_block_count(self.superblock.block_size() / 512, false, false);
        self.write_inode_record(new_ino, &mut rec)?;

        self.write_dir_block(
            data_block,
            new_ino,
            rec.base.generation,
            &[
                dir_entry(new_ino, ".", DirFileType::DIRECTORY),
                dir_entry(parent_ino, "..", DirFileType::DIRECTORY),
            ],
        )?;

        self.dir_insert(parent_ino, dir_entry(new_ino, &name, DirFileType::DIRECTORY))?;
        let mut parent_rec = self.read_inode_record(parent_ino)?;
        parent_rec.base.links_count += 1;
        self.write_inode_record(parent_ino, &mut parent_rec)?;

        let group = self.inode_group(new_ino);
        let used = self.group_descriptors[group as usize].used_dirs_count() + 1;
        self.group_descriptors[group as usize].set_used_dirs_count(used);
        self.persist_gdt()?;
        Ok(())
    }

    /// Removes an empty file or directory at `path`.
    pub fn rm(&mut self, path: &str) -> Result<()> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let (ino, ft) = self.resolve_no_follow(path)?;
        if ft == FileType::Directory {
            let rec = self.read_inode_record(ino)?;
            if !self.dir_entries_raw(&rec)?.iter().all(|e| e.name == b"." || e.name == b"..") {
                return Err(Error::DirectoryNotEmpty(PathBuf::from(path)));
            }
        }

        self.dir_remove(parent_ino, &name)?;

        if ft == FileType::Directory {
            let mut parent_rec = self.read_inode_record(parent_ino)?;
            parent_rec.base.links_count = parent_rec.base.links_count.saturating_sub(1);
            self.write_inode_record(parent_ino, &mut parent_rec)?;
            let group = self.inode_group(ino);
            let used = self.group_descriptors[group as usize].used_dirs_count().saturating_sub(1);
            self.group_descriptors[group as usize].set_used_dirs_count(used);
        }

        let rec = self.read_inode_record(ino)?;
        let blocks = self.inode_physical_blocks(&rec)?;
        self.free_blocks(&blocks)?;
        self.free_inode(ino)?;
        self.persist_gdt()?;
        Ok(())
    }

    /// Creates a symbolic link at `link_path` pointing to `target` (stored verbatim, not
    /// validated or resolved at creation time).
    pub fn symlink(&mut self, target: &str, link_path: &str) -> Result<()> {
        let (parent_ino, name) = self.resolve_parent(link_path)?;
        if self.lookup_child(parent_ino, &name)?.is_some() {
            return Err(Error::AlreadyExists(PathBuf::from(link_path)));
        }

        let ino = self.allocate_inode()?;
        let now = current_timestamp();
        let mut rec = self.new_inode_record(FileMode::new(FileType::SymbolicLink, 0o777), now);
        let target_bytes = target.as_bytes();

        if target_bytes.len() < 60 {
            rec.base.block.set_inline_symlink(target_bytes);
            rec.set_size(target_bytes.len() as u64);
        } else {
            rec.base.flags = rec.base.flags | InodeFlags::EXTENTS;
            rec.base.block = InodeBlock(Root::Empty.serialize());
            rec.set_size(target_bytes.len() as u64);
            let block_size = self.superblock.block_size();
            let n_blocks = (target_bytes.len() as u64).div_ceil(block_size);
            let mut extents = Vec::new();
            for i in 0..n_blocks {
                let (block, _) = self
                    .allocate_blocks(1, None)?
                    .into_iter()
                    .next()
                    .ok_or(Error::OutOfBlocks { requested: 1 })?;
                let start = (i * block_size) as usize;
                let end = (((i + 1) * block_size) as usize).min(target_bytes.len());
                let mut data = vec![0u8; block_size as usize];
                data[..end - start].copy_from_slice(&target_bytes[start..end]);
                self.write_block(block, &data)?;
                extents.push(Extent::new(i as u32, 1, block, true));
            }
            self.extend_inode_blocks(ino, &mut rec, extents)?;
            let block_count = (target_bytes.len() as u64).div_ceil(block_size) * block_size / 512;
            rec.set_block_count(block_count, false, false);
        }

        self.write_inode_record(ino, &mut rec)?;
        self.dir_insert(parent_ino, dir_entry(ino, &name, DirFileType::SYMLINK))?;
        Ok(())
    }

    /// Reads the target of the symbolic link at `path`, without following it.
    pub fn readlink(&self, path: &str) -> Result<String> {
        let (ino, ft) = self.resolve_no_follow(path)?;
        if ft != FileType::SymbolicLink {
            return Err(Error::Malformed("not a symbolic link"));
        }
        let bytes = self.read_symlink_target(ino)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_symlink_target(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let rec = self.read_inode_record(ino)?;
        if rec.is_symlink_inline() {
            Ok(rec.base.block.as_inline_symlink(rec.size()).to_vec())
        } else {
            let size = rec.size();
            let mut buf = vec![0u8; size as usize];
            self.read_inode_range(&rec, 0, &mut buf)?;
            Ok(buf)
        }
    }

    /// Truncates (or zero-extends) the regular file at `path` to exactly `new_size` bytes.
    pub fn truncate(&mut self, path: &str, new_size: u64) -> Result<()> {
        let ino = self.resolve(path)?;
        let rec = self.read_inode_record(ino)?;
        if rec.file_type() == FileType::Directory {
            return Err(Error::IsADirectory(PathBuf::from(path)));
        }
        self.truncate_inode(ino, new_size)
    }

    pub(crate) fn truncate_inode(&mut self, ino: InodeNumber, new_size: u64) -> Result<()> {
        let mut rec = self.read_inode_record(ino)?;
        let block_size = self.superblock.block_size();
        let old_blocks = rec.size().div_ceil(block_size);
        let new_blocks = new_size.div_ceil(block_size);

        if new_blocks < old_blocks && rec.uses_extent_tree() {
            let root = Root::parse(&rec.base.block.0)?;
            let (leaves, old_nodes) = extent::collect_tree_blocks(&root, &mut |b| self.read_block(b))?;
            let mut freed: Vec<(u64, u64)> = old_nodes.into_iter().map(|n| (n, 1)).collect();
            let mut kept = Vec::new();
            for e in leaves {
                let e_start = u64::from(e.block);
                let e_len = u64::from(e.length());
                if e_start >= new_blocks {
                    if e.is_initialized() {
                        freed.push((e.start_block(), e_len));
                    }
                } else if e_start + e_len > new_blocks {
                    let keep_len = (new_blocks - e_start) as u16;
                    if e.is_initialized() {
                        freed.push((e.start_block() + u64::from(keep_len), e_len - u64::from(keep_len)));
                    }
                    kept.push(Extent::new(e.block, keep_len, e.start_block(), e.is_initialized()));
                } else {
                    kept.push(e);
                }
            }
            self.free_blocks(&freed)?;
            let generation = rec.base.generation;
            let seed = self.checksum_seed;
            let result = extent::extend(kept, vec![], block_size as u32, seed, ino, generation, &mut || {
                Err(Error::Malformed("truncate should never need to allocate a block"))
            })?;
            rec.base.block = InodeBlock(result.root.serialize());
        }

        rec.set_size(new_size);
        rec.set_change_time(current_timestamp());
        self.write_inode_record(ino, &mut rec)?;
        Ok(())
    }

    fn dir_insert(&mut self, dir_ino: InodeNumber, new_entry: LinearEntry) -> Result<()> {
        let mut dir_rec = self.read_inode_record(dir_ino)?;
        let block_size = self.superblock.block_size();
        let n_blocks = dir_rec.size().div_ceil(block_size);
        let tail_on = self.dir_tail_checksum_enabled();
        let root = Root::parse(&dir_rec.base.block.0)?;

        for idx in 0..n_blocks {
            let mapped = extent::find_blocks(&root, &mut |b| self.read_block(b), idx, 1)?;
            let Some(Some(disk_block)) = mapped.into_iter().next() else {
                continue;
            };
            let data = self.read_block(disk_block)?;
            let mut entries = dir::decode_block(&data)?;
            if dir::insert_linear(&mut entries, new_entry.clone(), block_size as usize, tail_on) {
                self.write_dir_block(disk_block, dir_ino, dir_rec.base.generation, &entries)?;
                return Ok(());
            }
        }

        let new_block = self.extend_single_block(dir_ino, &mut dir_rec)?;
        self.write_dir_block(new_block, dir_ino, dir_rec.base.generation, std::slice::from_ref(&new_entry))?;
        dir_rec.set_size(dir_rec.size() + block_size);
        self.write_inode_record(dir_ino, &mut dir_rec)?;
        Ok(())
    }

    fn dir_remove(&mut self, dir_ino: InodeNumber, name: &str) -> Result<()> {
        let dir_rec = self.read_inode_record(dir_ino)?;
        let block_size = self.superblock.block_size();
        let n_blocks = dir_rec.size().div_ceil(block_size);
        let root = Root::parse(&dir_rec.base.block.0)?;

        for idx in 0..n_blocks {
            let mapped = extent::find_blocks(&root, &mut |b| self.read_block(b), idx, 1)?;
            let Some(Some(disk_block)) = mapped.into_iter().next() else {
                continue;
            };
            let data = self.read_block(disk_block)?;
            let mut entries = dir::decode_block(&data)?;
            let before = entries.len();
            entries.retain(|e| e.name != name.as_bytes());
            if entries.len() != before {
                self.write_dir_block(disk_block, dir_ino, dir_rec.base.generation, &entries)?;
                return Ok(());
            }
        }
        Err(Error::NotFound(PathBuf::from(name)))
    }

    fn extend_single_block(&mut self, ino: InodeNumber, rec: &mut InodeRecord) -> Result<u64> {
        let block_size = self.superblock.block_size();
        let file_block_idx = (rec.size().div_ceil(block_size)) as u32;
        let group_hint = self.inode_group(ino);
        let (disk_block, _) = self
            .allocate_blocks(1, Some(group_hint))?
            .into_iter()
            .next()
            .ok_or(Error::OutOfBlocks { requested: 1 })?;
        let new_extent = Extent::new(file_block_idx, 1, disk_block, true);
        self.extend_inode_blocks(ino, rec, vec![new_extent])?;
        Ok(disk_block)
    }

    pub(crate) fn extend_inode_blocks(
        &mut self,
        ino: InodeNumber,
        rec: &mut InodeRecord,
        new_extents: Vec<Extent>,
    ) -> Result<()> {
        let root = if rec.uses_extent_tree() {
            Root::parse(&rec.base.block.0)?
        } else {
            Root::Empty
        };
        let existing = extent::flatten_tree(&root, &mut |b| self.read_block(b))?;
        let block_size = self.superblock.block_size() as u32;
        let seed = self.checksum_seed;
        let generation = rec.base.generation;

        let result = {
            let mut alloc = || -> Result<u64> {
                let (block, _) = self
                    .allocate_blocks(1, None)?
                    .into_iter()
                    .next()
                    .ok_or(Error::OutOfBlocks { requested: 1 })?;
                Ok(block)
            };
            extent::extend(existing, new_extents, block_size, seed, ino, generation, &mut alloc)?
        };

        for (block_no, bytes) in &result.writes {
            self.write_block(*block_no, bytes)?;
        }
        rec.base.block = InodeBlock(result.root.serialize());
        rec.base.flags = rec.base.flags | InodeFlags::EXTENTS;
        Ok(())
    }

    fn inode_physical_blocks(&self, rec: &InodeRecord) -> Result<Vec<(u64, u64)>> {
        if !rec.uses_extent_tree() {
            return Ok(Vec::new());
        }
        let root = Root::parse(&rec.base.block.0)?;
        let (leaves, nodes) = extent::collect_tree_blocks(&root, &mut |b| self.read_block(b))?;
        let mut singles: Vec<u64> = nodes;
        for e in &leaves {
            if e.is_initialized() {
                for i in 0..u64::from(e.length()) {
                    singles.push(e.start_block() + i);
                }
            }
        }
        singles.sort_unstable();
        singles.dedup();
        Ok(compress_runs(&singles))
    }

    pub(crate) fn read_inode_range(&self, rec: &InodeRecord, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let block_size = self.superblock.block_size();
        let root = Root::parse(&rec.base.block.0)?;
        let start_block = offset / block_size;
        let end_block = (offset + buf.len() as u64).div_ceil(block_size).max(start_block + 1);
        let count = end_block - start_block;
        let mapped = extent::find_blocks(&root, &mut |b| self.read_block(b), start_block, count)?;

        for (i, slot) in mapped.iter().enumerate() {
            let file_block_no = start_block + i as u64;
            let block_off_in_file = file_block_no * block_size;
            if block_off_in_file >= offset + buf.len() as u64 {
                break;
            }
            let copy_start = offset.max(block_off_in_file) - block_off_in_file;
            let copy_end = (offset + buf.len() as u64).min(block_off_in_file + block_size) - block_off_in_file;
            if copy_end <= copy_start {
                continue;
            }
            let dest_start = (block_off_in_file + copy_start - offset) as usize;
            let dest_end = dest_start + (copy_end - copy_start) as usize;
            match slot {
                Some(disk_block) => {
                    let data = self.read_block(*disk_block)?;
                    buf[dest_start..dest_end].copy_from_slice(&data[copy_start as usize..copy_end as usize]);
                }
                None => buf[dest_start..dest_end].fill(0),
            }
        }
        Ok(())
    }

    fn new_inode_record(&self, mode: FileMode, now: UnixTimestamp) -> InodeRecord {
        let has_extra = self.superblock.inode_size > 128;
        let mut rec = InodeRecord {
            base: Inode::zeroed(),
            extra: has_extra.then(InodeExtra::zeroed),
        };
        rec.base.mode = mode;
        rec.base.links_count = 1;
        rec.base.generation = uuid::Uuid::new_v4().as_u128() as u32;
        rec.set_access_time(now);
        rec.set_change_time(now);
        rec.set_modification_time(now);
        if let Some(extra) = &mut rec.extra {
            extra.extra_isize = 32;
            extra.crtime = now.raw_seconds() as u32;
        }
        rec
    }

    fn dir_tail_checksum_enabled(&self) -> bool {
        self.superblock.feature_ro_compat.contains(RoCompatFeatures::METADATA_CSUM)
    }

    fn write_dir_block(
        &self,
        block: u64,
        inode_no: InodeNumber,
        generation: u32,
        entries: &[LinearEntry],
    ) -> Result<()> {
        let block_size = self.superblock.block_size() as usize;
        let tail_on = self.dir_tail_checksum_enabled();
        let mut encoded = dir::encode_block(entries, block_size, tail_on.then_some(0));
        if tail_on {
            let checksum = dir::block_checksum(self.checksum_seed, inode_no, generation, &encoded);
            let off = block_size - 4;
            encoded[off..].copy_from_slice(&checksum.to_le_bytes());
        }
        self.write_block(block, &encoded)
    }

    fn read_inode_record(&self, ino: InodeNumber) -> Result<InodeRecord> {
        let (block, offset) = self.inode_location(ino)?;
        let data = self.read_block(block)?;
        let inode_size = self.superblock.inode_size;
        let rec = InodeRecord::parse(&data[offset..offset + inode_size as usize], inode_size)?;
        if self.superblock.feature_ro_compat.contains(RoCompatFeatures::METADATA_CSUM) {
            rec.verify_checksum(self.checksum_seed, ino, inode_size)?;
        }
        Ok(rec)
    }

    fn write_inode_record(&self, ino: InodeNumber, rec: &mut InodeRecord) -> Result<()> {
        let inode_size = self.superblock.inode_size;
        if self.superblock.feature_ro_compat.contains(RoCompatFeatures::METADATA_CSUM) {
            rec.update_checksum(self.checksum_seed, ino, inode_size);
        }
        let (block, offset) = self.inode_location(ino)?;
        let mut data = self.read_block(block)?;
        let bytes = rec.serialize(inode_size);
        data[offset..offset + bytes.len()].copy_from_slice(&bytes);
        self.write_block(block, &data)
    }

    fn inode_location(&self, ino: InodeNumber) -> Result<(u64, usize)> {
        if ino == 0 {
            return Err(Error::Malformed("inode 0 is not a valid identifier"));
        }
        let group = (ino - 1) / self.superblock.inodes_per_group;
        let index_in_group = u64::from((ino - 1) % self.superblock.inodes_per_group);
        let gd = self
            .group_descriptors
            .get(group as usize)
            .ok_or(Error::Malformed("inode number out of range"))?;
        let inode_size = u64::from(self.superblock.inode_size);
        let byte_offset = index_in_group * inode_size;
        let block_size = self.superblock.block_size();
        let block = gd.inode_table_block() + byte_offset / block_size;
        Ok((block, (byte_offset % block_size) as usize))
    }

    fn inode_group(&self, ino: InodeNumber) -> u32 {
        (ino - 1) / self.superblock.inodes_per_group
    }

    pub(crate) fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let block_size = self.superblock.block_size();
        let mut buf = vec![0u8; block_size as usize];
        self.backend.read_at(&mut buf, block * block_size)?;
        Ok(buf)
    }

    pub(crate) fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        let block_size = self.superblock.block_size() as usize;
        debug_assert_eq!(data.len(), block_size);
        self.backend.write_at(data, block * block_size as u64)
    }

    fn write_block_range(&self, start_block: u64, data: &[u8]) -> Result<()> {
        self.backend.write_at(data, start_block * self.superblock.block_size())
    }

    pub(crate) fn block_group_of(&self, block: u64) -> u32 {
        ((block - u64::from(self.superblock.first_data_block)) / u64::from(self.superblock.blocks_per_group))
            as u32
    }

    pub(crate) fn group_start_block(&self, group: u32) -> u64 {
        u64::from(self.superblock.first_data_block) + u64::from(group) * u64::from(self.superblock.blocks_per_group)
    }

    pub(crate) fn blocks_in_group(&self, group: u32) -> u64 {
        let start = self.group_start_block(group);
        let end = (start + u64::from(self.superblock.blocks_per_group)).min(self.superblock.block_count());
        end - start
    }

    fn has_backup(&self, group: u32) -> bool {
        self.superblock
            .sparse_super_policy()
            .has_backup(group, self.group_descriptors.len() as u32)
    }

    fn gdt_blocks(&self) -> u64 {
        let gd_size = u64::from(self.superblock.group_descriptor_size());
        (self.group_descriptors.len() as u64 * gd_size).div_ceil(self.superblock.block_size())
    }

    fn group_overhead_blocks(&self, group: u32) -> u64 {
        if self.has_backup(group) {
            1 + self.gdt_blocks() + u64::from(self.superblock.reserved_gdt_blocks)
        } else {
            0
        }
    }

    fn metadata_blocks_in_group(&self, group: u32) -> u64 {
        self.group_overhead_blocks(group) + 2 + self.superblock.inode_table_blocks_per_group()
    }

    fn persist_gdt(&self) -> Result<()> {
        let gd_size = self.superblock.group_descriptor_size();
        let mut buf = Vec::with_capacity(self.group_descriptors.len() * gd_size as usize);
        for (i, gd) in self.group_descriptors.iter().enumerate() {
            let mut gd = *gd;
            if self.gd_checksum_kind != GdChecksumKind::None {
                gd.update_checksum(self.gd_checksum_kind, self.checksum_seed, i as u32);
            }
            buf.extend_from_slice(&gd.serialize(gd_size));
        }
        let block_size = self.superblock.block_size();
        let padded_len = (buf.len() as u64).div_ceil(block_size) as usize * block_size as usize;
        buf.resize(padded_len, 0);

        let gdt_start = self.superblock.gdt_start_block();
        self.write_block_range(gdt_start, &buf)?;
        for group in 0..self.group_descriptors.len() as u32 {
            if group != 0 && self.has_backup(group) {
                let backup_start = self.group_start_block(group) + gdt_start;
                self.write_block_range(backup_start, &buf)?;
            }
        }
        Ok(())
    }

    fn persist_superblock(&self) -> Result<()> {
        let bytes = self.superblock.serialize();
        self.backend.write_at(&bytes, SUPERBLOCK_OFFSET)?;
        for group in 1..self.group_descriptors.len() as u32 {
            if self.has_backup(group) {
                let offset = self.group_start_block(group) * self.superblock.block_size() + SUPERBLOCK_OFFSET;
                self.backend.write_at(&bytes, offset)?;
            }
        }
        Ok(())
    }
}
