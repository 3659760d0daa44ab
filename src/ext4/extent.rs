//! Extent tree (C7): maps a file's logical blocks to physical blocks (§4.5).
//!
//! The root always lives in the inode's 60-byte `i_block` area: either directly as up to 4
//! [`Extent`] leaves, or as up to 4 [`ExtentIdx`] pointers into on-disk nodes. This module owns no
//! I/O itself — callers supply a `read_block`/`alloc_block` closure — so it stays testable without
//! a backend and reusable from both the read path (`find_blocks`) and the write path (`extend`).

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

const MAGIC: u16 = 0xF30A;
/// Root capacity: the 60-byte inode area holds a 12-byte header plus 4 entries of 12 bytes.
const ROOT_CAPACITY: usize = 4;
/// Extent-tree depth is capped at 5 per the on-disk format (`eh_depth` is only ever this small in
/// practice); beyond this, `extend` reports [`Error::ExtentTreeDepthExhausted`].
const MAX_DEPTH: u16 = 5;
/// A value above this in `len` marks the extent uninitialized (actual length is `len - MARKER`).
const UNINIT_MARKER: u16 = 32768;

/// 12-byte node header shared by every extent-tree block, including the virtual one living in the
/// inode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max: u16,
    pub depth: u16,
    pub generation: u32,
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() == 12);

impl ExtentHeader {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    fn new(entries: u16, max: u16, depth: u16) -> Self {
        Self {
            magic: MAGIC,
            entries,
            max,
            depth,
            generation: 0,
        }
    }
}

/// A leaf entry: `[block, block + length)` of file-relative blocks map to physical blocks starting
/// at `start_block()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Extent {
    pub block: u32,
    pub len: u16,
    pub start_hi: u16,
    pub start_lo: u32,
}

const _: () = assert!(core::mem::size_of::<Extent>() == 12);

impl Extent {
    #[must_use]
    pub fn new(block: u32, length: u16, start_block: u64, initialized: bool) -> Self {
        let len = if initialized {
            length
        } else {
            length + UNINIT_MARKER
        };
        Self {
            block,
            len,
            start_hi: (start_block >> 32) as u16,
            start_lo: start_block as u32,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.len <= UNINIT_MARKER
    }

    /// Number of file blocks this extent covers, regardless of initialization state.
    #[must_use]
    pub fn length(&self) -> u16 {
        if self.is_initialized() {
            self.len
        } else {
            self.len - UNINIT_MARKER
        }
    }

    #[must_use]
    pub fn start_block(&self) -> u64 {
        u64::from(self.start_lo) | (u64::from(self.start_hi) << 32)
    }
}

/// An internal-node entry: file blocks from `block` onward (until the next sibling's `block`) are
/// covered by the subtree rooted at `leaf()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ExtentIdx {
    pub block: u32,
    pub leaf_lo: u32,
    pub leaf_hi: u16,
    pub unused: u16,
}

const _: () = assert!(core::mem::size_of::<ExtentIdx>() == 12);

impl ExtentIdx {
    fn new(block: u32, leaf: u64) -> Self {
        Self {
            block,
            leaf_lo: leaf as u32,
            leaf_hi: (leaf >> 32) as u16,
            unused: 0,
        }
    }

    #[must_use]
    pub fn leaf(&self) -> u64 {
        u64::from(self.leaf_lo) | (u64::from(self.leaf_hi) << 32)
    }
}

/// The in-inode root of a file's extent tree — §4.5's state machine made explicit as a type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Root {
    /// No blocks allocated yet.
    #[default]
    Empty,
    /// `InodeLeaf`: up to 4 extents stored directly, depth 0.
    Leaf(Vec<Extent>),
    /// `InodeRoot+*`: up to 4 pointers to on-disk nodes, `depth` levels below the root.
    Index { depth: u16, entries: Vec<ExtentIdx> },
}

impl Root {
    /// Decodes a root from the raw 60-byte `i_block` area.
    pub fn parse(bytes: &[u8; 60]) -> Result<Self> {
        let header = *bytemuck::from_bytes::<ExtentHeader>(&bytes[..12]);
        if header.magic != MAGIC {
            return Err(Error::Malformed("bad extent header magic"));
        }
        if header.is_leaf() {
            let entries = parse_entries::<Extent>(&bytes[12..], header.entries as usize)?;
            Ok(Root::Leaf(entries))
        } else {
            let entries = parse_entries::<ExtentIdx>(&bytes[12..], header.entries as usize)?;
            Ok(Root::Index {
                depth: header.depth,
                entries,
            })
        }
    }

    /// Encodes this root back to the 60-byte `i_block` area.
    #[must_use]
    pub fn serialize(&self) -> [u8; 60] {
        let mut out = [0u8; 60];
        match self {
            Root::Empty => {
                out[..12].copy_from_slice(bytemuck::bytes_of(&ExtentHeader::new(
                    0,
                    ROOT_CAPACITY as u16,
                    0,
                )));
            }
            Root::Leaf(entries) => {
                out[..12].copy_from_slice(bytemuck::bytes_of(&ExtentHeader::new(
                    entries.len() as u16,
                    ROOT_CAPACITY as u16,
                    0,
                )));
                write_entries(&mut out[12..], entries);
            }
            Root::Index { depth, entries } => {
                out[..12].copy_from_slice(bytemuck::bytes_of(&ExtentHeader::new(
                    entries.len() as u16,
                    ROOT_CAPACITY as u16,
                    *depth,
                )));
                write_entries(&mut out[12..], entries);
            }
        }
        out
    }
}

fn parse_entries<T: Pod + Zeroable>(bytes: &[u8], count: usize) -> Result<Vec<T>> {
    let size = core::mem::size_of::<T>();
    if bytes.len() < count * size {
        return Err(Error::Malformed("truncated extent entry list"));
    }
    Ok((0..count)
        .map(|i| *bytemuck::from_bytes(&bytes[i * size..(i + 1) * size]))
        .collect())
}

fn write_entries<T: Pod>(out: &mut [u8], entries: &[T]) {
    let size = core::mem::size_of::<T>();
    for (i, entry) in entries.iter().enumerate() {
        out[i * size..(i + 1) * size].copy_from_slice(bytemuck::bytes_of(entry));
    }
}

/// Returns how many 12-byte entries fit in one on-disk node, reserving the trailing 4 bytes for
/// the node's own checksum.
#[must_use]
pub fn node_capacity(block_size: u32) -> usize {
    ((block_size as usize).saturating_sub(12 + 4)) / 12
}

enum NodeBody {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIdx>),
}

fn parse_node(bytes: &[u8]) -> Result<(ExtentHeader, NodeBody)> {
    if bytes.len() < 12 {
        return Err(Error::Malformed("truncated extent node"));
    }
    let header = *bytemuck::from_bytes::<ExtentHeader>(&bytes[..12]);
    if header.magic != MAGIC {
        return Err(Error::Malformed("bad extent node magic"));
    }
    let body = if header.is_leaf() {
        NodeBody::Leaf(parse_entries(&bytes[12..], header.entries as usize)?)
    } else {
        NodeBody::Index(parse_entries(&bytes[12..], header.entries as usize)?)
    };
    Ok((header, body))
}

fn serialize_node(header: ExtentHeader, body: &NodeBody, block_size: u32, tail_checksum: u32) -> Vec<u8> {
    let mut out = vec![0u8; block_size as usize];
    out[..12].copy_from_slice(bytemuck::bytes_of(&header));
    match body {
        NodeBody::Leaf(entries) => write_entries(&mut out[12..], entries),
        NodeBody::Index(entries) => write_entries(&mut out[12..], entries),
    }
    let tail = block_size as usize - 4;
    out[tail..].copy_from_slice(&tail_checksum.to_le_bytes());
    out
}

/// Checksum over `fs_uuid || inode_no || inode_gen || node_bytes[..len-4]`, stored in the last 4
/// bytes of every on-disk (non-root) extent node.
#[must_use]
pub fn node_checksum(seed: u32, inode_no: u32, inode_gen: u32, node: &[u8]) -> u32 {
    let s1 = crate::crc32c::crc32c_extend(seed, &inode_no.to_le_bytes());
    let s2 = crate::crc32c::crc32c_extend(s1, &inode_gen.to_le_bytes());
    crate::crc32c::crc32c_extend(s2, &node[..node.len() - 4])
}

/// Verifies a node's trailing checksum against the freshly computed value.
pub fn verify_node_checksum(seed: u32, inode_no: u32, inode_gen: u32, node: &[u8]) -> Result<()> {
    let stored = u32::from_le_bytes(node[node.len() - 4..].try_into().unwrap());
    let computed = node_checksum(seed, inode_no, inode_gen, node);
    if stored != computed {
        return Err(Error::BadExtentChecksum { inode: inode_no });
    }
    Ok(())
}

/// Finds the physical blocks backing `[file_start, file_start + file_count)`. `None` entries are
/// holes (sparse regions or uninitialized extents), which read as zero.
pub fn find_blocks(
    root: &Root,
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    file_start: u64,
    file_count: u64,
) -> Result<Vec<Option<u64>>> {
    let mut out = vec![None; file_count as usize];
    match root {
        Root::Empty => {}
        Root::Leaf(extents) => overlay_extents(extents, file_start, file_count, &mut out),
        Root::Index { entries, .. } => {
            collect_via_index(entries, read_block, file_start, file_count, &mut out)?;
        }
    }
    Ok(out)
}

fn overlay_extents(extents: &[Extent], file_start: u64, file_count: u64, out: &mut [Option<u64>]) {
    let query_end = file_start + file_count;
    for ext in extents {
        let ext_start = u64::from(ext.block);
        let ext_end = ext_start + u64::from(ext.length());
        if ext_end <= file_start || ext_start >= query_end {
            continue;
        }
        let overlap_start = ext_start.max(file_start);
        let overlap_end = ext_end.min(query_end);
        for fb in overlap_start..overlap_end {
            let slot = (fb - file_start) as usize;
            out[slot] = ext
                .is_initialized()
                .then(|| ext.start_block() + (fb - ext_start));
        }
    }
}

fn collect_via_index(
    entries: &[ExtentIdx],
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    file_start: u64,
    file_count: u64,
    out: &mut [Option<u64>],
) -> Result<()> {
    let query_end = file_start + file_count;
    for (i, entry) in entries.iter().enumerate() {
        let range_start = u64::from(entry.block);
        let range_end = entries
            .get(i + 1)
            .map_or(u64::MAX, |next| u64::from(next.block));
        if range_end <= file_start || range_start >= query_end {
            continue;
        }
        let bytes = read_block(entry.leaf())?;
        let (_, body) = parse_node(&bytes)?;
        match body {
            NodeBody::Leaf(leaf_extents) => {
                overlay_extents(&leaf_extents, file_start, file_count, out);
            }
            NodeBody::Index(child_entries) => {
                collect_via_index(&child_entries, read_block, file_start, file_count, out)?;
            }
        }
    }
    Ok(())
}

/// Reads every leaf extent reachable from `root`, in ascending `fileBlock` order, by walking the
/// whole tree. Used before [`extend`] to rebuild the tree from its current contents plus whatever
/// is being added.
pub fn flatten_tree(
    root: &Root,
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
) -> Result<Vec<Extent>> {
    match root {
        Root::Empty => Ok(Vec::new()),
        Root::Leaf(extents) => Ok(extents.clone()),
        Root::Index { entries, .. } => {
            let mut out = Vec::new();
            collect_all_leaves(entries, read_block, &mut out)?;
            Ok(out)
        }
    }
}

fn collect_all_leaves(
    entries: &[ExtentIdx],
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    out: &mut Vec<Extent>,
) -> Result<()> {
    for entry in entries {
        let bytes = read_block(entry.leaf())?;
        let (_, body) = parse_node(&bytes)?;
        match body {
            NodeBody::Leaf(extents) => out.extend(extents),
            NodeBody::Index(children) => collect_all_leaves(&children, read_block, out)?,
        }
    }
    Ok(())
}

/// Like [`flatten_tree`], but also returns the block number of every on-disk node visited (leaf
/// and internal) so a caller freeing or shrinking an inode can release the tree's own metadata
/// blocks, not just the data extents it points to. The virtual root living in the inode itself is
/// never included since it occupies no block of its own.
pub fn collect_tree_blocks(
    root: &Root,
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
) -> Result<(Vec<Extent>, Vec<u64>)> {
    match root {
        Root::Empty => Ok((Vec::new(), Vec::new())),
        Root::Leaf(extents) => Ok((extents.clone(), Vec::new())),
        Root::Index { entries, .. } => {
            let mut leaves = Vec::new();
            let mut nodes = Vec::new();
            collect_tree_blocks_rec(entries, read_block, &mut leaves, &mut nodes)?;
            Ok((leaves, nodes))
        }
    }
}

fn collect_tree_blocks_rec(
    entries: &[ExtentIdx],
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    leaves: &mut Vec<Extent>,
    nodes: &mut Vec<u64>,
) -> Result<()> {
    for entry in entries {
        nodes.push(entry.leaf());
        let bytes = read_block(entry.leaf())?;
        let (_, body) = parse_node(&bytes)?;
        match body {
            NodeBody::Leaf(extents) => leaves.extend(extents),
            NodeBody::Index(children) => collect_tree_blocks_rec(&children, read_block, leaves, nodes)?,
        }
    }
    Ok(())
}

/// The outcome of [`extend`]: a new in-inode root plus any on-disk nodes that must be written
/// (in allocation order, so writing them in this order before the inode satisfies the ordering
/// guarantee in §5: metadata children before the parent that references them).
pub struct ExtendResult {
    pub root: Root,
    pub writes: Vec<(u64, Vec<u8>)>,
}

/// Rebuilds the extent tree to cover `existing` (already flattened, ascending by `block`) plus
/// `added`. Rather than incrementally splitting the on-disk structure in place, this sorts and
/// re-chunks the full extent list on every call — simpler to get right than in-place B-tree
/// rebalancing, and it produces the same end state since the tree is fully rewritten bottom-up.
pub fn extend(
    mut existing: Vec<Extent>,
    added: Vec<Extent>,
    block_size: u32,
    seed: u32,
    inode_no: u32,
    inode_gen: u32,
    alloc_block: &mut dyn FnMut() -> Result<u64>,
) -> Result<ExtendResult> {
    existing.extend(added);
    existing.sort_unstable_by_key(|e| e.block);

    if existing.is_empty() {
        return Ok(ExtendResult {
            root: Root::Empty,
            writes: Vec::new(),
        });
    }
    if existing.len() <= ROOT_CAPACITY {
        return Ok(ExtendResult {
            root: Root::Leaf(existing),
            writes: Vec::new(),
        });
    }

    let capacity = node_capacity(block_size).max(1);
    let mut writes = Vec::new();

    let mut level: Vec<ExtentIdx> = chunk(&existing, capacity)
        .map(|chunk_entries| {
            let first_block = chunk_entries[0].block;
            let header = ExtentHeader::new(chunk_entries.len() as u16, capacity as u16, 0);
            let block_no = alloc_block()?;
            let checksum = node_checksum(
                seed,
                inode_no,
                inode_gen,
                &serialize_node(header, &NodeBody::Leaf(chunk_entries.to_vec()), block_size, 0),
            );
            let bytes = serialize_node(header, &NodeBody::Leaf(chunk_entries.to_vec()), block_size, checksum);
            writes.push((block_no, bytes));
            Ok(ExtentIdx::new(first_block, block_no))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut depth = 1u16;
    while level.len() > ROOT_CAPACITY {
        if depth >= MAX_DEPTH {
            return Err(Error::ExtentTreeDepthExhausted);
        }
        level = chunk(&level, capacity)
            .map(|chunk_entries| {
                let first_block = chunk_entries[0].block;
                let header = ExtentHeader::new(chunk_entries.len() as u16, capacity as u16, depth);
                let block_no = alloc_block()?;
                let body = NodeBody::Index(chunk_entries.to_vec());
                let checksum =
                    node_checksum(seed, inode_no, inode_gen, &serialize_node(header, &body, block_size, 0));
                let bytes = serialize_node(header, &body, block_size, checksum);
                writes.push((block_no, bytes));
                Ok(ExtentIdx::new(first_block, block_no))
            })
            .collect::<Result<Vec<_>>>()?;
        depth += 1;
    }

    Ok(ExtendResult {
        root: Root::Index { depth, entries: level },
        writes,
    })
}

fn chunk<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn leaf(block: u32, len: u16, start: u64) -> Extent {
        Extent::new(block, len, start, true)
    }

    #[test]
    fn root_round_trips_through_bytes_leaf() {
        let root = Root::Leaf(vec![leaf(0, 10, 100), leaf(10, 5, 200)]);
        let bytes = root.serialize();
        let back = Root::parse(&bytes).unwrap();
        match back {
            Root::Leaf(entries) => assert_eq!(entries.len(), 2),
            _ => panic!("expected leaf root"),
        }
    }

    #[test]
    fn find_blocks_resolves_contiguous_run() {
        let root = Root::Leaf(vec![leaf(0, 10, 1000)]);
        let mut reads = |_: u64| -> Result<Vec<u8>> { unreachable!() };
        let result = find_blocks(&root, &mut reads, 2, 3).unwrap();
        assert_eq!(result, vec![Some(1002), Some(1003), Some(1004)]);
    }

    #[test]
    fn find_blocks_reports_holes_as_none() {
        let root = Root::Leaf(vec![leaf(5, 5, 1000)]);
        let mut reads = |_: u64| -> Result<Vec<u8>> { unreachable!() };
        let result = find_blocks(&root, &mut reads, 0, 3).unwrap();
        assert_eq!(result, vec![None, None, None]);
    }

    #[test]
    fn uninitialized_extent_reads_as_holes() {
        let root = Root::Leaf(vec![Extent::new(0, 4, 1000, false)]);
        let mut reads = |_: u64| -> Result<Vec<u8>> { unreachable!() };
        let result = find_blocks(&root, &mut reads, 0, 4).unwrap();
        assert_eq!(result, vec![None, None, None, None]);
    }

    #[test]
    fn extend_keeps_leaf_root_under_capacity() {
        let mut blocks = 500u64;
        let mut alloc = || -> Result<u64> {
            blocks += 1;
            Ok(blocks)
        };
        let added = vec![leaf(0, 1, 10), leaf(1, 1, 11)];
        let result = extend(vec![], added, 4096, 0, 2, 1, &mut alloc).unwrap();
        assert!(matches!(result.root, Root::Leaf(ref v) if v.len() == 2));
        assert!(result.writes.is_empty());
    }

    #[test]
    fn extend_promotes_to_single_child_leaf() {
        let mut blocks = 0u64;
        let mut alloc = || -> Result<u64> {
            blocks += 1;
            Ok(blocks)
        };
        let added: Vec<Extent> = (0..6).map(|i| leaf(i, 1, 1000 + u64::from(i))).collect();
        let result = extend(vec![], added, 4096, 0, 2, 1, &mut alloc).unwrap();
        match result.root {
            Root::Index { depth, entries } => {
                assert_eq!(depth, 1);
                assert_eq!(entries.len(), 1);
            }
            _ => panic!("expected depth-1 index root"),
        }
        assert_eq!(result.writes.len(), 1);
    }

    #[test]
    fn extend_splits_into_multiple_leaves_when_over_one_node() {
        let mut blocks = 0u64;
        let mut alloc = || -> Result<u64> {
            blocks += 1;
            Ok(blocks)
        };
        let capacity = node_capacity(256);
        let added: Vec<Extent> = (0..(capacity as u32 * 3))
            .map(|i| leaf(i, 1, 1000 + u64::from(i)))
            .collect();
        let result = extend(vec![], added, 256, 0, 2, 1, &mut alloc).unwrap();
        match result.root {
            Root::Index { depth, entries } => {
                assert_eq!(depth, 1);
                assert_eq!(entries.len(), 3);
            }
            _ => panic!("expected depth-1 multi-child index root"),
        }
        assert_eq!(result.writes.len(), 3);
    }

    #[test]
    fn find_blocks_walks_index_nodes() {
        let mut blocks = 0u64;
        let mut alloc = || -> Result<u64> {
            blocks += 1;
            Ok(blocks)
        };
        let capacity = node_capacity(256);
        let added: Vec<Extent> = (0..(capacity as u32 * 3))
            .map(|i| leaf(i, 1, 1000 + u64::from(i)))
            .collect();
        let result = extend(vec![], added, 256, 0, 2, 1, &mut alloc).unwrap();
        let disk: HashMap<u64, Vec<u8>> = result.writes.into_iter().collect();
        let mut read = |block: u64| -> Result<Vec<u8>> {
            disk.get(&block).cloned().ok_or(Error::NotImplemented("missing block"))
        };
        let found = find_blocks(&result.root, &mut read, 0, capacity as u64 * 3).unwrap();
        for (i, slot) in found.iter().enumerate() {
            assert_eq!(*slot, Some(1000 + i as u64));
        }
    }

    proptest::proptest! {
        /// After any sequence of `extend` calls, each adding a fresh batch of non-overlapping
        /// file blocks, the flattened leaf sequence stays sorted by `block` and no two leaves
        /// cover overlapping file-block ranges (P3).
        #[test]
        fn extend_keeps_leaves_sorted_and_nonoverlapping(
            batch_sizes in proptest::collection::vec(1usize..6, 1..8),
        ) {
            let mut next_block = 0u64;
            let mut alloc = || -> Result<u64> {
                next_block += 1;
                Ok(next_block)
            };
            let mut existing: Vec<Extent> = Vec::new();
            let mut next_file_block: u32 = 0;
            let mut disk_cursor: u64 = 10_000;

            for size in batch_sizes {
                let added: Vec<Extent> = (0..size as u32)
                    .map(|i| leaf(next_file_block + i, 1, disk_cursor + u64::from(i)))
                    .collect();
                // Leave a one-block gap so each new batch never touches the previous one's range.
                next_file_block += size as u32 + 1;
                disk_cursor += size as u64 + 1;

                let result = extend(existing.clone(), added, 4096, 0, 2, 1, &mut alloc).unwrap();
                let disk: HashMap<u64, Vec<u8>> = result.writes.iter().cloned().collect();
                let mut read = |b: u64| -> Result<Vec<u8>> {
                    disk.get(&b).cloned().ok_or(Error::NotImplemented("missing block"))
                };
                let flat = flatten_tree(&result.root, &mut read).unwrap();

                for w in flat.windows(2) {
                    proptest::prop_assert!(w[0].block + u32::from(w[0].length()) <= w[1].block);
                }
                existing = flat;
            }
        }
    }
}
