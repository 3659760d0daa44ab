//! Directory format (C8, §4.6): linear entries plus the optional htree hashed index.
//!
//! A directory's data blocks hold a sequence of [`LinearEntry`] records; [`decode_block`] walks
//! them via `rec_len` hops exactly as the on-disk format requires (a corrupt `rec_len` of 0 would
//! loop forever, so it is rejected). When the inode's `HASHED_DIRECTORY_INDEXES` flag is set, the
//! root block additionally carries a [`DxRoot`] header and entry array (§4.6) that this module can
//! decode and search, but insertion always falls back to a linear scan/append — this library never
//! writes new htree index entries, only existing ones it can still find correctly.

use crate::error::{Error, Result};
use crate::ext4::hash::{self, HashVersion};
use crate::ext4::inode::{FileType, InodeNumber};

/// `file_type` byte stored in a directory entry (populated when the `filetype` feature is on).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirFileType(pub u8);

impl DirFileType {
    pub const UNKNOWN: Self = Self(0);
    pub const REGULAR: Self = Self(1);
    pub const DIRECTORY: Self = Self(2);
    pub const CHAR_DEVICE: Self = Self(3);
    pub const BLOCK_DEVICE: Self = Self(4);
    pub const FIFO: Self = Self(5);
    pub const SOCKET: Self = Self(6);
    pub const SYMLINK: Self = Self(7);
    /// Marks the synthetic tail entry ext2fs uses to carry a block-level checksum.
    pub const CHECKSUM: Self = Self(0xDE);

    #[must_use]
    pub fn from_file_type(ft: FileType) -> Self {
        match ft {
            FileType::Regular => Self::REGULAR,
            FileType::Directory => Self::DIRECTORY,
            FileType::CharacterDevice => Self::CHAR_DEVICE,
            FileType::BlockDevice => Self::BLOCK_DEVICE,
            FileType::Fifo => Self::FIFO,
            FileType::Socket => Self::SOCKET,
            FileType::SymbolicLink => Self::SYMLINK,
        }
    }
}

/// A single linear directory entry, decoded from its on-disk bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearEntry {
    pub inode: InodeNumber,
    /// Distance in bytes to the next entry (or to the block boundary for the last entry).
    pub rec_len: u16,
    pub file_type: DirFileType,
    pub name: Vec<u8>,
}

/// Smallest legal `rec_len`: 4-byte inode + 2-byte rec_len + 1-byte name_len + 1-byte file_type.
const ENTRY_HEADER_LEN: usize = 8;

impl LinearEntry {
    /// Bytes this entry would occupy if packed tightly (no trailing slack), rounded up to a
    /// 4-byte boundary as the format requires.
    #[must_use]
    pub fn packed_len(name_len: usize) -> u16 {
        (((ENTRY_HEADER_LEN + name_len) + 3) & !3) as u16
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(Error::Malformed("truncated directory entry"));
        }
        let inode = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let name_len = bytes[6] as usize;
        let file_type = DirFileType(bytes[7]);
        if rec_len as usize == 0 || ENTRY_HEADER_LEN + name_len > bytes.len() {
            return Err(Error::Malformed("directory entry name overruns record"));
        }
        let name = bytes[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + name_len].to_vec();
        Ok(Self {
            inode,
            rec_len,
            file_type,
            name,
        })
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.inode.to_le_bytes());
        out[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
        out[6] = self.name.len() as u8;
        out[7] = self.file_type.0;
        out[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + self.name.len()].copy_from_slice(&self.name);
    }
}

/// The synthetic tail entry a block carries when metadata checksums are enabled: `inode = 0`,
/// `rec_len = 12`, `name_len = 0`, `file_type = 0xDE`, and a trailing 4-byte checksum.
pub const DIR_ENTRY_TAIL_LEN: usize = 12;

/// Computes the checksum a `dir_entry_tail` stores: `crc32c(seed, inode_no || generation)`
/// extended over the block with the tail's own checksum field zeroed.
#[must_use]
pub fn block_checksum(seed: u32, inode_no: u32, generation: u32, block: &[u8]) -> u32 {
    let s1 = crate::crc32c::crc32c_extend(seed, &inode_no.to_le_bytes());
    let s2 = crate::crc32c::crc32c_extend(s1, &generation.to_le_bytes());
    let tail_checksum_offset = block.len() - 4;
    let mut without_checksum = block.to_vec();
    without_checksum[tail_checksum_offset..].fill(0);
    crate::crc32c::crc32c_extend(s2, &without_checksum)
}

/// Decodes every entry in one directory block, stopping at the block boundary. An entry with
/// `inode == 0` is a deleted slot (or, if it also matches the tail shape, the checksum tail) and
/// is skipped rather than surfaced to callers.
pub fn decode_block(block: &[u8]) -> Result<Vec<LinearEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + ENTRY_HEADER_LEN <= block.len() {
        let entry = LinearEntry::decode(&block[offset..])?;
        let rec_len = entry.rec_len as usize;
        if offset + rec_len > block.len() {
            return Err(Error::Malformed("directory entry rec_len overruns block"));
        }
        let is_tail = entry.inode == 0
            && rec_len == DIR_ENTRY_TAIL_LEN
            && entry.name.is_empty()
            && entry.file_type == DirFileType::CHECKSUM;
        if entry.inode != 0 && !is_tail {
            entries.push(entry);
        }
        offset += rec_len;
    }
    Ok(entries)
}

/// Re-encodes a full directory block from `entries`, appending free (or tail) padding to fill
/// `block_size`. If `tail_checksum` is `Some`, the last `DIR_ENTRY_TAIL_LEN` bytes carry the
/// synthetic checksum entry instead of being folded into the final entry's `rec_len`.
pub fn encode_block(entries: &[LinearEntry], block_size: usize, tail_checksum: Option<u32>) -> Vec<u8> {
    let mut out = vec![0u8; block_size];
    let usable = block_size - tail_checksum.map_or(0, |_| DIR_ENTRY_TAIL_LEN);
    let mut offset = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let is_last = i + 1 == entries.len();
        let packed = LinearEntry::packed_len(entry.name.len()) as usize;
        let rec_len = if is_last { usable - offset } else { packed };
        let mut record = entry.clone();
        record.rec_len = rec_len as u16;
        record.encode(&mut out[offset..offset + packed.max(ENTRY_HEADER_LEN)]);
        offset += rec_len;
    }
    if let Some(checksum) = tail_checksum {
        let tail_offset = block_size - DIR_ENTRY_TAIL_LEN;
        out[tail_offset..tail_offset + 4].copy_from_slice(&0u32.to_le_bytes());
        out[tail_offset + 4..tail_offset + 6].copy_from_slice(&(DIR_ENTRY_TAIL_LEN as u16).to_le_bytes());
        out[tail_offset + 6] = 0;
        out[tail_offset + 7] = DirFileType::CHECKSUM.0;
        out[tail_offset + 8..tail_offset + 12].copy_from_slice(&checksum.to_le_bytes());
    }
    out
}

/// Inserts `entry` into a decoded block's entry list, splitting the first record with enough
/// slack. Returns `None` if no record has room (the caller must allocate another block).
#[must_use]
pub fn insert_linear(
    entries: &mut Vec<LinearEntry>,
    new_entry: LinearEntry,
    block_size: usize,
    reserves_tail: bool,
) -> bool {
    let usable = block_size - if reserves_tail { DIR_ENTRY_TAIL_LEN } else { 0 };
    let needed = LinearEntry::packed_len(new_entry.name.len()) as usize;

    let mut consumed: Vec<usize> = Vec::with_capacity(entries.len());
    let mut offset = 0usize;
    for (i, e) in entries.iter().enumerate() {
        let is_last = i + 1 == entries.len();
        let packed = LinearEntry::packed_len(e.name.len()) as usize;
        let slack = if is_last { usable - offset } else { packed } - packed;
        consumed.push(offset);
        if slack >= needed {
            entries.insert(i + 1, new_entry);
            return true;
        }
        offset += packed;
    }
    if usable - offset >= needed {
        entries.push(new_entry);
        return true;
    }
    false
}

/// The 16-byte `dx_root` index header, following the root block's "." and ".." entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DxRootInfo {
    pub hash_version: u8,
    pub info_length: u8,
    pub indirect_levels: u8,
    pub unused_flags: u8,
}

impl DxRootInfo {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Malformed("truncated dx_root info"));
        }
        Ok(Self {
            hash_version: bytes[4],
            info_length: bytes[5],
            indirect_levels: bytes[6],
            unused_flags: bytes[7],
        })
    }
}

/// One `(hash, block)` pointer in a `dx_root`/`dx_node` entry array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DxEntry {
    pub hash: u32,
    pub block: u32,
}

/// A parsed htree root block: the fixed header plus its sorted entry array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DxRoot {
    pub info: DxRootInfo,
    pub entries: Vec<DxEntry>,
}

impl DxRoot {
    /// Parses the htree root out of a directory's first data block. `dot_dotdot_len` is the
    /// combined `rec_len` of the "." and ".." entries that precede the `dx_root` header.
    pub fn parse(block: &[u8], dot_dotdot_len: usize) -> Result<Self> {
        if block.len() < dot_dotdot_len + 16 {
            return Err(Error::Malformed("truncated dx_root block"));
        }
        let info_bytes = &block[dot_dotdot_len..];
        let info = DxRootInfo::decode(info_bytes)?;
        // The first `dx_entry`-sized slot after `dx_root_info` is reinterpreted as a
        // `dx_countlimit { limit, count }` header rather than a real (hash, block) pointer.
        let count_limit_offset = dot_dotdot_len + 8;
        let count =
            u16::from_le_bytes(block[count_limit_offset + 2..count_limit_offset + 4].try_into().unwrap());
        let entries_offset = count_limit_offset + 8;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let base = entries_offset + i * 8;
            if base + 8 > block.len() {
                return Err(Error::Malformed("dx_root entry array overruns block"));
            }
            entries.push(DxEntry {
                hash: u32::from_le_bytes(block[base..base + 4].try_into().unwrap()),
                block: u32::from_le_bytes(block[base + 4..base + 8].try_into().unwrap()),
            });
        }
        Ok(Self { info, entries })
    }

    /// Binary-searches for the largest entry whose hash is `<= target`, per §4.6's lookup rule.
    /// The first entry (sentinel, hash 0) always matches if nothing else does.
    #[must_use]
    pub fn find_block_for_hash(&self, target: u32) -> Option<u32> {
        let mut result = None;
        for entry in &self.entries {
            if entry.hash <= target {
                result = Some(entry.block);
            } else {
                break;
            }
        }
        result.or_else(|| self.entries.first().map(|e| e.block))
    }

    #[must_use]
    pub fn hash_version(&self) -> Option<HashVersion> {
        HashVersion::from_code(self.info.hash_version)
    }

    /// Computes the lookup hash for `name` and resolves it to the leaf block that would contain
    /// it, if this root's hash version is supported.
    pub fn locate(&self, seed: [u32; 4], name: &[u8]) -> Result<Option<u32>> {
        let version = self
            .hash_version()
            .ok_or(Error::Malformed("unknown dx_root hash_version"))?;
        let target = hash::hash(version, seed, name)? & !1;
        Ok(self.find_block_for_hash(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(inode: u32, name: &str, file_type: DirFileType) -> LinearEntry {
        LinearEntry {
            inode,
            rec_len: LinearEntry::packed_len(name.len()),
            file_type,
            name: name.as_bytes().to_vec(),
        }
    }

    #[test]
    fn round_trips_through_block_bytes() {
        let entries = vec![
            entry(2, ".", DirFileType::DIRECTORY),
            entry(2, "..", DirFileType::DIRECTORY),
            entry(12, "hello.txt", DirFileType::REGULAR),
        ];
        let block = encode_block(&entries, 4096, None);
        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].name, b"hello.txt");
        assert_eq!(decoded[2].inode, 12);
    }

    #[test]
    fn tail_checksum_round_trips_and_is_excluded_from_entries() {
        let entries = vec![entry(2, ".", DirFileType::DIRECTORY), entry(2, "..", DirFileType::DIRECTORY)];
        let block = encode_block(&entries, 256, Some(0xCAFEBABE));
        let decoded = decode_block(&block).unwrap();
        assert_eq!(decoded.len(), 2);
        let tail_offset = 256 - DIR_ENTRY_TAIL_LEN;
        assert_eq!(&block[tail_offset + 8..tail_offset + 12], &0xCAFEBABEu32.to_le_bytes());
    }

    #[test]
    fn insert_splits_last_entry_slack() {
        let mut entries = vec![entry(2, ".", DirFileType::DIRECTORY)];
        // force rec_len to cover the whole 64-byte block as the last (and only) entry
        entries[0].rec_len = 64;
        let inserted = insert_linear(&mut entries, entry(5, "x", DirFileType::REGULAR), 64, false);
        assert!(inserted);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn insert_fails_when_block_is_full() {
        let mut entries = vec![entry(2, "a", DirFileType::REGULAR)];
        entries[0].rec_len = 16;
        let inserted = insert_linear(&mut entries, entry(9, "this-name-does-not-fit-at-all", DirFileType::REGULAR), 16, false);
        assert!(!inserted);
    }

    #[test]
    fn dx_root_finds_largest_entry_not_exceeding_target() {
        let root = DxRoot {
            info: DxRootInfo {
                hash_version: 0,
                info_length: 8,
                indirect_levels: 0,
                unused_flags: 0,
            },
            entries: vec![
                DxEntry { hash: 0, block: 1 },
                DxEntry { hash: 100, block: 2 },
                DxEntry { hash: 200, block: 3 },
            ],
        };
        assert_eq!(root.find_block_for_hash(50), Some(1));
        assert_eq!(root.find_block_for_hash(150), Some(2));
        assert_eq!(root.find_block_for_hash(250), Some(3));
    }
}
