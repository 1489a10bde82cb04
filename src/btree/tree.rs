//! Tree handle, capability trait, lookup and bulk load.

use std::fmt;

use eyre::{ensure, Result};
use tracing::debug;

use crate::buffer::{BufferReference, BufferReferenceExclusive, BufferReferenceModified};
use crate::storage::PAGE_SIZE;

use super::node;
use super::{MAX_DEPTH, MAX_LEAF_ENTRIES};

/// Capabilities a concrete index segment provides to the engine.
///
/// Key encoding is fixed-width (`INNER_KEY_SIZE`, a multiple of 4); leaf
/// payload encoding is free-form. `pack_leaf_entries` writes a maximal
/// prefix of `entries` into the payload buffer and returns how many it
/// stored; it must fully overwrite the buffer (zeroing unused space) so
/// repeated packs of the same entries produce identical page images.
pub trait TreeIndex {
    /// Encoded inner key size in bytes. Must be a multiple of 4.
    const INNER_KEY_SIZE: usize;

    type InnerKey: Ord + Copy + Default + fmt::Debug;
    /// Ordered by derived inner key.
    type LeafEntry: Ord + Clone;

    fn read_inner_key(data: &[u8]) -> Self::InnerKey;
    fn write_inner_key(data: &mut [u8], key: Self::InnerKey);
    fn derive_inner_key(entry: &Self::LeafEntry) -> Self::InnerKey;
    /// Key of the first entry of a leaf payload.
    fn first_entry_key(payload: &[u8]) -> Self::InnerKey;

    fn pack_leaf_entries(payload: &mut [u8], entries: &[Self::LeafEntry]) -> usize;
    fn unpack_leaf_entries(payload: &[u8], entries: &mut Vec<Self::LeafEntry>);

    /// Give an incoming entry the chance to merge into the preceding
    /// stored entry (equal keys, or a semantically absorbable change).
    /// Returning true consumes the incoming entry.
    fn merge_conflict_with(new_entry: &Self::LeafEntry, old_entry: &mut Self::LeafEntry) -> bool;

    fn root_page(&self) -> u32;
    fn set_root_page(&mut self, page_no: u32) -> Result<()>;
    /// Called after a bulk load with the head of the leaf chain and the
    /// number of leaves written.
    fn update_leaf_info(&mut self, first_leaf: u32, leaf_count: u32);

    fn read_shared(&self, page_no: u32) -> Result<BufferReference>;
    fn read_exclusive(&self, page_no: u32) -> Result<BufferReferenceExclusive>;
    /// Allocate a fresh page, fixed for writing.
    fn alloc_page(&mut self) -> Result<BufferReferenceModified>;
    /// Return a page to the allocator.
    fn free_page(&mut self, page_no: u32);
}

/// A sorted stream of leaf entries feeding a bulk load or merge.
pub trait EntrySource {
    type Entry;

    fn next_entry(&mut self) -> Result<Option<Self::Entry>>;
    /// The most recently delivered entry was absorbed by an existing one
    /// instead of being stored itself.
    fn mark_as_conflict(&mut self);
}

/// A clustered B+-tree over a concrete index segment.
pub struct BTree<T: TreeIndex> {
    index: T,
}

impl<T: TreeIndex> BTree<T> {
    pub fn new(index: T) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &T {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut T {
        &mut self.index
    }

    pub fn into_index(self) -> T {
        self.index
    }

    pub(super) fn index_internal(&mut self) -> &mut T {
        &mut self.index
    }

    /// Descend to the leaf whose key range covers `key`, holding one
    /// shared reference at a time. Returns `None` when `key` is greater
    /// than every max key in the tree.
    pub fn find_leaf(&self, key: T::InnerKey) -> Result<Option<BufferReference>> {
        let mut page = self.index.read_shared(self.index.root_page())?;
        for _ in 0..MAX_DEPTH {
            if !node::is_inner(page.data()) {
                return Ok(Some(page));
            }
            let child = {
                let data = page.data();
                let count = node::inner_count(data);
                // Binary search over upper bounds: descend into the
                // leftmost entry whose max key is >= the target.
                let mut left = 0usize;
                let mut right = count;
                let mut child = None;
                while left != right {
                    let middle = (left + right) / 2;
                    let middle_key = T::read_inner_key(
                        &data[node::inner_entry_offset(middle, T::INNER_KEY_SIZE)..],
                    );
                    if middle_key < key {
                        left = middle + 1;
                    } else if middle == 0
                        || T::read_inner_key(
                            &data[node::inner_entry_offset(middle - 1, T::INNER_KEY_SIZE)..],
                        ) < key
                    {
                        child = Some(node::inner_child(data, middle, T::INNER_KEY_SIZE));
                        break;
                    } else {
                        right = middle;
                    }
                }
                match child {
                    Some(child) => child,
                    // Ran off the last entry: the key is beyond the tree.
                    None => return Ok(None),
                }
            };
            page = self.index.read_shared(child)?;
        }
        unreachable!("tree deeper than the supported maximum");
    }

    /// Build the tree bottom-up from a sorted entry stream. Replaces
    /// whatever the index's root pointed to before.
    pub fn perform_bulkload<S>(&mut self, source: &mut S) -> Result<()>
    where
        S: EntrySource<Entry = T::LeafEntry>,
    {
        let mut boundaries = Vec::new();
        Self::pack_leaves(&mut self.index, source, &mut boundaries)?;

        // Always build at least one inner level, so the root is an inner
        // page even over a single leaf.
        let mut levels = 1usize;
        let mut upper = Vec::new();
        Self::pack_inner(&mut self.index, &boundaries, &mut upper)?;
        boundaries = upper;
        while boundaries.len() > 1 {
            levels += 1;
            assert!(levels < MAX_DEPTH, "tree deeper than the supported maximum");
            let mut upper = Vec::new();
            Self::pack_inner(&mut self.index, &boundaries, &mut upper)?;
            boundaries = upper;
        }

        let root = boundaries.last().expect("at least one root page").1;
        self.index.set_root_page(root)?;
        debug!(root, levels, "bulk load complete");
        Ok(())
    }

    /// Pack the sorted stream into chained leaves, recording each leaf's
    /// `(max key, page)` boundary.
    fn pack_leaves<S>(
        index: &mut T,
        source: &mut S,
        boundaries: &mut Vec<(T::InnerKey, u32)>,
    ) -> Result<()>
    where
        S: EntrySource<Entry = T::LeafEntry>,
    {
        let mut chainer = PageChainer::new(node::LEAF_NEXT_OFFSET);
        let mut buffer = Box::new([0u8; PAGE_SIZE]);
        let mut entries: Vec<T::LeafEntry> = Vec::new();
        let mut done = false;

        loop {
            while !done && entries.len() < MAX_LEAF_ENTRIES {
                match source.next_entry()? {
                    Some(entry) => entries.push(entry),
                    None => done = true,
                }
            }
            if entries.is_empty() {
                break;
            }

            buffer[..node::LEAF_HEADER_SIZE].fill(0);
            let stored = T::pack_leaf_entries(&mut buffer[node::LEAF_HEADER_SIZE..], &entries);
            ensure!(stored > 0, "leaf entry does not fit a page");
            chainer.store(index, &buffer)?;
            boundaries.push((T::derive_inner_key(&entries[stored - 1]), chainer.page_no()));
            entries.drain(..stored);
        }

        // An empty input still yields one (empty) leaf, so the result is
        // a real tree that later merges can grow.
        if boundaries.is_empty() {
            buffer.fill(0);
            T::pack_leaf_entries(&mut buffer[node::LEAF_HEADER_SIZE..], &[]);
            chainer.store(index, &buffer)?;
            boundaries.push((T::InnerKey::default(), chainer.page_no()));
        }

        let first_leaf = chainer.first_page();
        let leaf_count = chainer.pages();
        chainer.finish()?;
        index.update_leaf_info(first_leaf, leaf_count);
        debug!(leaves = leaf_count, "packed leaf level");
        Ok(())
    }

    /// Pack one inner level over `data`, emitting the next level's
    /// boundaries.
    fn pack_inner(
        index: &mut T,
        data: &[(T::InnerKey, u32)],
        boundaries: &mut Vec<(T::InnerKey, u32)>,
    ) -> Result<()> {
        let entry_size = T::INNER_KEY_SIZE + 4;
        let mut chainer = PageChainer::new(node::INNER_NEXT_OFFSET);
        let mut buffer = Box::new([0u8; PAGE_SIZE]);
        let mut buffer_pos = node::INNER_HEADER_SIZE;
        let mut buffer_count = 0u32;

        for (index_pos, (key, child)) in data.iter().enumerate() {
            if buffer_pos + entry_size > PAGE_SIZE {
                node::init_inner(&mut buffer[..], 0, buffer_count);
                buffer[buffer_pos..].fill(0);
                chainer.store(index, &buffer)?;
                boundaries.push((data[index_pos - 1].0, chainer.page_no()));
                buffer_pos = node::INNER_HEADER_SIZE;
                buffer_count = 0;
            }
            T::write_inner_key(&mut buffer[buffer_pos..buffer_pos + T::INNER_KEY_SIZE], *key);
            node::write_u32(&mut buffer[..], buffer_pos + T::INNER_KEY_SIZE, *child);
            buffer_pos += entry_size;
            buffer_count += 1;
        }

        node::init_inner(&mut buffer[..], 0, buffer_count);
        buffer[buffer_pos..].fill(0);
        chainer.store(index, &buffer)?;
        boundaries.push((
            data.last().expect("inner level over zero pages").0,
            chainer.page_no(),
        ));
        chainer.finish()
    }
}

/// Chains freshly allocated pages through a link field at a fixed
/// offset. Each stored page gets its successor's number patched in when
/// the successor is allocated; the last page keeps a zero link.
pub(super) struct PageChainer {
    link_offset: usize,
    current: Option<BufferReferenceModified>,
    first_page: u32,
    pages: u32,
}

impl PageChainer {
    pub(super) fn new(link_offset: usize) -> Self {
        Self {
            link_offset,
            current: None,
            first_page: 0,
            pages: 0,
        }
    }

    /// Store a full page image on a freshly allocated page. The lsn is
    /// zeroed and the link field reset; the previous page is linked to
    /// this one and unfixed.
    pub(super) fn store<T: TreeIndex>(
        &mut self,
        index: &mut T,
        page: &[u8; PAGE_SIZE],
    ) -> Result<()> {
        self.next_page(index)?;
        let current = self.current.as_mut().expect("just allocated");
        let data = current.data_mut();
        data.copy_from_slice(page);
        data[..8].fill(0);
        node::write_u32(data, self.link_offset, 0);
        Ok(())
    }

    fn next_page<T: TreeIndex>(&mut self, index: &mut T) -> Result<()> {
        let fresh = index.alloc_page()?;
        let fresh_no = fresh.page_no();
        if let Some(mut last) = std::mem::replace(&mut self.current, Some(fresh)) {
            node::write_u32(last.data_mut(), self.link_offset, fresh_no);
            last.unfix()?;
        } else {
            self.first_page = fresh_no;
        }
        self.pages += 1;
        Ok(())
    }

    pub(super) fn page_no(&self) -> u32 {
        self.current.as_ref().expect("no page stored yet").page_no()
    }

    pub(super) fn first_page(&self) -> u32 {
        self.first_page
    }

    pub(super) fn pages(&self) -> u32 {
        self.pages
    }

    pub(super) fn finish(mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            current.unfix()?;
        }
        Ok(())
    }
}
