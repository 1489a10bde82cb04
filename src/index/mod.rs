//! # Aggregated Facts Index
//!
//! A concrete index segment: the clustered B+-tree binding
//! `(value1, value2) -> count`, the aggregated form of the triple
//! relation (two of subject/predicate/object, with the multiplicity of
//! the collapsed third component).
//!
//! The leaf payload is an entry count followed by fixed-width 12-byte
//! entries:
//!
//! ```text
//! +12  entry count  u32
//! +16  entries: value1 u32 | value2 u32 | count u32, sorted by
//!      (value1, value2)
//! ```
//!
//! Page 0 of the partition is the segment header (root page, leaf chain
//! info, allocation cursor); tree pages are allocated from page 1 on.
//! That also keeps the page number 0 free to mean "no next leaf" in the
//! chain.
//!
//! Merging an entry whose `(value1, value2)` already exists replaces the
//! stored count; the source observes this through `mark_as_conflict`.

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::btree::{node, BTree, EntrySource, TreeIndex};
use crate::buffer::{BufferManager, BufferReference, BufferReferenceExclusive, BufferReferenceModified};
use crate::storage::{Partition, PAGE_SIZE};

const MAGIC: u32 = 0x5453_4146;
const ENTRY_SIZE: usize = 12;
/// Entries per leaf: payload minus the count word.
pub const LEAF_CAPACITY: usize = (PAGE_SIZE - node::LEAF_HEADER_SIZE - 4) / ENTRY_SIZE;

/// Inner key: the `(value1, value2)` pair.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug, Hash)]
pub struct AggregatedKey(pub u32, pub u32);

/// One aggregated fact. Ordering and equality consider the key only;
/// the count is payload.
#[derive(Clone, Copy, Debug)]
pub struct AggregatedEntry {
    pub value1: u32,
    pub value2: u32,
    pub count: u32,
}

impl AggregatedEntry {
    pub fn new(value1: u32, value2: u32, count: u32) -> Self {
        Self {
            value1,
            value2,
            count,
        }
    }

    pub fn key(&self) -> AggregatedKey {
        AggregatedKey(self.value1, self.value2)
    }
}

impl PartialEq for AggregatedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for AggregatedEntry {}

impl PartialOrd for AggregatedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AggregatedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Hands out pages from grown partition ranges, recycling freed ones.
struct PageAllocator {
    free: Vec<u32>,
    next: u32,
    end: u32,
}

impl PageAllocator {
    fn alloc(&mut self, partition: &Partition) -> Result<u32> {
        if let Some(page_no) = self.free.pop() {
            return Ok(page_no);
        }
        if self.next == self.end {
            let (start, count) = partition.grow(1)?;
            self.next = start;
            self.end = start + count;
        }
        let page_no = self.next;
        self.next += 1;
        Ok(page_no)
    }

    fn free(&mut self, page_no: u32) {
        self.free.push(page_no);
    }
}

/// The aggregated-facts segment.
pub struct AggregatedFactsIndex {
    partition: Arc<Partition>,
    buffer: BufferManager,
    root_page: u32,
    first_leaf: u32,
    leaf_count: u32,
    allocator: PageAllocator,
}

impl AggregatedFactsIndex {
    /// Create a fresh segment. Page 0 becomes the header; the tree is
    /// built by a later bulk load.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let partition = Arc::new(Partition::create(path)?);
        let (start, count) = partition.grow(1)?;
        debug_assert_eq!(start, 0);
        let index = Self {
            partition,
            buffer: BufferManager::new(),
            root_page: 0,
            first_leaf: 0,
            leaf_count: 0,
            allocator: PageAllocator {
                free: Vec::new(),
                next: 1,
                end: count,
            },
        };
        index.flush()?;
        Ok(index)
    }

    /// Open an existing segment.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let partition = Arc::new(Partition::open(path, read_only)?);
        ensure!(partition.size() > 0, "segment has no header page");
        let header = partition.read_page(0)?;
        let data = header.data();
        ensure!(
            node::read_u32(data, 0) == MAGIC,
            "not an aggregated-facts segment"
        );
        let root_page = node::read_u32(data, 4);
        let first_leaf = node::read_u32(data, 8);
        let leaf_count = node::read_u32(data, 12);
        let next = node::read_u32(data, 16);
        partition.finish_page(header);

        let end = partition.size();
        Ok(Self {
            partition,
            buffer: BufferManager::new(),
            root_page,
            first_leaf,
            leaf_count,
            allocator: PageAllocator {
                free: Vec::new(),
                next,
                end,
            },
        })
    }

    /// Write the header page and flush the partition.
    pub fn flush(&self) -> Result<()> {
        let mut header = self.buffer.build_page(&self.partition, 0)?;
        {
            let data = header.data_mut();
            node::write_u32(data, 0, MAGIC);
            node::write_u32(data, 4, self.root_page);
            node::write_u32(data, 8, self.first_leaf);
            node::write_u32(data, 12, self.leaf_count);
            node::write_u32(data, 16, self.allocator.next);
        }
        header.unfix()?;
        self.partition.flush()
    }

    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    pub fn first_leaf(&self) -> u32 {
        self.first_leaf
    }

    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// All entries, in key order, by walking the leaf chain.
    pub fn scan(&self) -> Result<Vec<AggregatedEntry>> {
        let mut entries = Vec::new();
        if self.leaf_count == 0 {
            return Ok(entries);
        }
        let mut page_no = self.first_leaf;
        loop {
            let page = self.buffer.read_shared(&self.partition, page_no)?;
            let data = page.data();
            ensure!(!node::is_inner(data), "leaf chain hit an inner page");
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

impl TreeIndex for AggregatedFactsIndex {
    const INNER_KEY_SIZE: usize = 8;

    type InnerKey = AggregatedKey;
    type LeafEntry = AggregatedEntry;

    fn read_inner_key(data: &[u8]) -> AggregatedKey {
        AggregatedKey(node::read_u32(data, 0), node::read_u32(data, 4))
    }

    fn write_inner_key(data: &mut [u8], key: AggregatedKey) {
        node::write_u32(data, 0, key.0);
        node::write_u32(data, 4, key.1);
    }

    fn derive_inner_key(entry: &AggregatedEntry) -> AggregatedKey {
        entry.key()
    }

    fn first_entry_key(payload: &[u8]) -> AggregatedKey {
        // Entries start after the count word.
        AggregatedKey(node::read_u32(payload, 4), node::read_u32(payload, 8))
    }

    fn pack_leaf_entries(payload: &mut [u8], entries: &[AggregatedEntry]) -> usize {
        let stored = entries.len().min(LEAF_CAPACITY);
        node::write_u32(payload, 0, stored as u32);
        let mut ofs = 4;
        for entry in &entries[..stored] {
            node::write_u32(payload, ofs, entry.value1);
            node::write_u32(payload, ofs + 4, entry.value2);
            node::write_u32(payload, ofs + 8, entry.count);
            ofs += ENTRY_SIZE;
        }
        payload[ofs..].fill(0);
        stored
    }

    fn unpack_leaf_entries(payload: &[u8], entries: &mut Vec<AggregatedEntry>) {
        let stored = node::read_u32(payload, 0) as usize;
        entries.reserve(stored);
        let mut ofs = 4;
        for _ in 0..stored {
            entries.push(AggregatedEntry::new(
                node::read_u32(payload, ofs),
                node::read_u32(payload, ofs + 4),
                node::read_u32(payload, ofs + 8),
            ));
            ofs += ENTRY_SIZE;
        }
    }

    fn merge_conflict_with(new_entry: &AggregatedEntry, old_entry: &mut AggregatedEntry) -> bool {
        if new_entry.key() != old_entry.key() {
            return false;
        }
        old_entry.count = new_entry.count;
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
        let page_no = self.allocator.alloc(&self.partition)?;
        self.buffer.build_page(&self.partition, page_no)
    }

    fn free_page(&mut self, page_no: u32) {
        self.allocator.free(page_no);
    }
}

impl BTree<AggregatedFactsIndex> {
    /// Point lookup of one aggregated count.
    pub fn lookup_count(&self, value1: u32, value2: u32) -> Result<Option<u32>> {
        let key = AggregatedKey(value1, value2);
        let Some(leaf) = self.find_leaf(key)? else {
            return Ok(None);
        };
        let mut entries = Vec::new();
        AggregatedFactsIndex::unpack_leaf_entries(
            &leaf.data()[node::LEAF_HEADER_SIZE..],
            &mut entries,
        );
        match entries.binary_search_by(|entry| entry.key().cmp(&key)) {
            Ok(pos) => Ok(Some(entries[pos].count)),
            Err(_) => Ok(None),
        }
    }
}

/// An entry source over an in-memory, pre-sorted vector. Counts the
/// entries absorbed as merge conflicts.
pub struct VecSource<E> {
    entries: std::vec::IntoIter<E>,
    conflicts: usize,
}

impl<E> VecSource<E> {
    pub fn new(entries: Vec<E>) -> Self {
        Self {
            entries: entries.into_iter(),
            conflicts: 0,
        }
    }

    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}

impl<E> EntrySource for VecSource<E> {
    type Entry = E;

    fn next_entry(&mut self) -> Result<Option<E>> {
        Ok(self.entries.next())
    }

    fn mark_as_conflict(&mut self) {
        self.conflicts += 1;
    }
}
