//! Shared test support: a deliberately tiny index segment whose leaves
//! hold only four entries, so page splits and root growth happen with
//! small data sets, plus structural helpers for inspecting trees.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use eyre::Result;

use tristore::btree::{node, BTree, TreeIndex};
use tristore::buffer::{
    BufferManager, BufferReference, BufferReferenceExclusive, BufferReferenceModified,
};
use tristore::storage::Partition;

pub const TINY_LEAF_CAPACITY: usize = 4;
const TINY_ENTRY_SIZE: usize = 8;

/// A `(key, payload)` entry; ordering and equality consider the key only.
#[derive(Clone, Copy, Debug)]
pub struct TinyEntry {
    pub key: u32,
    pub payload: u32,
}

impl TinyEntry {
    pub fn new(key: u32, payload: u32) -> Self {
        Self { key, payload }
    }
}

impl PartialEq for TinyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for TinyEntry {}

impl PartialOrd for TinyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TinyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Test index with four-entry leaves. Page 0 is reserved so a zero leaf
/// link always means end-of-chain.
pub struct TinyIndex {
    partition: Arc<Partition>,
    buffer: BufferManager,
    root_page: u32,
    first_leaf: u32,
    leaf_count: u32,
    free: Vec<u32>,
    next: u32,
    end: u32,
}

impl TinyIndex {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let partition = Arc::new(Partition::create(path)?);
        let (_, count) = partition.grow(1)?;
        Ok(Self {
            partition,
            buffer: BufferManager::new(),
            root_page: 0,
            first_leaf: 0,
            leaf_count: 0,
            free: Vec::new(),
            next: 1,
            end: count,
        })
    }

    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// All entries in key order, by walking the leaf chain.
    pub fn scan(&self) -> Result<Vec<TinyEntry>> {
        let mut entries = Vec::new();
        if self.leaf_count == 0 {
            return Ok(entries);
        }
        let mut page_no = self.first_leaf;
        loop {
            let page = self.buffer.read_shared(&self.partition, page_no)?;
            let data = page.data();
            assert!(!node::is_inner(data), "leaf chain hit an inner page");
            Self::unpack_leaf_entries(&data[node::LEAF_HEADER_SIZE..], &mut entries);
            let next = node::leaf_next(data);
            drop(page);
            if next == 0 {
                return Ok(entries);
            }
            page_no = next;
        }
    }
}

impl TreeIndex for TinyIndex {
    const INNER_KEY_SIZE: usize = 4;

    type InnerKey = u32;
    type LeafEntry = TinyEntry;

    fn read_inner_key(data: &[u8]) -> u32 {
        node::read_u32(data, 0)
    }

    fn write_inner_key(data: &mut [u8], key: u32) {
        node::write_u32(data, 0, key);
    }

    fn derive_inner_key(entry: &TinyEntry) -> u32 {
        entry.key
    }

    fn first_entry_key(payload: &[u8]) -> u32 {
        node::read_u32(payload, 4)
    }

    fn pack_leaf_entries(payload: &mut [u8], entries: &[TinyEntry]) -> usize {
        let stored = entries.len().min(TINY_LEAF_CAPACITY);
        node::write_u32(payload, 0, stored as u32);
        let mut ofs = 4;
        for entry in &entries[..stored] {
            node::write_u32(payload, ofs, entry.key);
            node::write_u32(payload, ofs + 4, entry.payload);
            ofs += TINY_ENTRY_SIZE;
        }
        payload[ofs..].fill(0);
        stored
    }

    fn unpack_leaf_entries(payload: &[u8], entries: &mut Vec<TinyEntry>) {
        let stored = node::read_u32(payload, 0) as usize;
        let mut ofs = 4;
        for _ in 0..stored {
            entries.push(TinyEntry::new(
                node::read_u32(payload, ofs),
                node::read_u32(payload, ofs + 4),
            ));
            ofs += TINY_ENTRY_SIZE;
        }
    }

    fn merge_conflict_with(new_entry: &TinyEntry, old_entry: &mut TinyEntry) -> bool {
        if new_entry.key != old_entry.key {
            return false;
        }
        old_entry.payload = new_entry.payload;
        true
    }

    fn root_page(&self) -> u32 {
        self.root_page
    }

    fn set_root_page(&mut self, page_no: u32) -> Result<()> {
        self.root_page = page_no;
        Ok(())
    }

    fn update_leaf_info(&mut self, first_leaf: u32, leaf_count: u32) {
        self.first_leaf = first_leaf;
        self.leaf_count = leaf_count;
    }

    fn read_shared(&self, page_no: u32) -> Result<BufferReference> {
        self.buffer.read_shared(&self.partition, page_no)
    }

    fn read_exclusive(&self, page_no: u32) -> Result<BufferReferenceExclusive> {
        self.buffer.read_exclusive(&self.partition, page_no)
    }

    fn alloc_page(&mut self) -> Result<BufferReferenceModified> {
        let page_no = match self.free.pop() {
            Some(page_no) => page_no,
            None => {
                if self.next == self.end {
                    let (start, count) = self.partition.grow(1)?;
                    self.next = start;
                    self.end = start + count;
                }
                let page_no = self.next;
                self.next += 1;
                page_no
            }
        };
        self.buffer.build_page(&self.partition, page_no)
    }

    fn free_page(&mut self, page_no: u32) {
        self.free.push(page_no);
    }
}

/// Depth of the tree, root to leaf inclusive, along the leftmost path.
pub fn tree_depth<T: TreeIndex>(tree: &BTree<T>) -> Result<usize> {
    let mut page = tree.index().read_shared(tree.index().root_page())?;
    let mut depth = 1;
    while node::is_inner(page.data()) {
        let child = node::inner_child(page.data(), 0, T::INNER_KEY_SIZE);
        let next = tree.index().read_shared(child)?;
        drop(page);
        page = next;
        depth += 1;
    }
    Ok(depth)
}

/// Point lookup against a tiny tree.
pub fn tiny_lookup(tree: &BTree<TinyIndex>, key: u32) -> Result<Option<u32>> {
    let Some(leaf) = tree.find_leaf(key)? else {
        return Ok(None);
    };
    let mut entries = Vec::new();
    TinyIndex::unpack_leaf_entries(&leaf.data()[node::LEAF_HEADER_SIZE..], &mut entries);
    Ok(entries
        .iter()
        .find(|entry| entry.key == key)
        .map(|entry| entry.payload))
}
