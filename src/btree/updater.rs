//! Incremental merge updates.
//!
//! [`Updater`] keeps the exclusive root-to-leaf path of the page
//! currently being rewritten: `pages[0]` is the root, `pages[depth-1]`
//! the leaf, and `positions[d]` the entry slot taken within
//! `pages[d-1]`. Fixed arrays, no recursion; the depth cap makes the
//! path a compile-time-sized structure.
//!
//! `perform_update` merges a sorted entry stream into the tree one leaf
//! at a time: look up the affected leaf, three-way merge its entries
//! with the stream (bounded by the next leaf's first key), and store the
//! result through `store_page`, which rewrites the leaf in place for the
//! first page and splits off freshly allocated leaves for overflow,
//! maintaining parent separators up the path. Every page change is a
//! log action from [`super::actions`].

use eyre::Result;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::buffer::BufferReferenceExclusive;
use crate::log::LogAction;
use crate::storage::PAGE_SIZE;

use super::actions::{InsertInner, UpdateInner, UpdateInnerPage, UpdateLeaf};
use super::node;
use super::tree::{BTree, EntrySource, TreeIndex};
use super::{MAX_DEPTH, MAX_LEAF_ENTRIES};

/// Inline scratch for one inner entry (key + child pointer).
type EntryBuf = SmallVec<[u8; 32]>;

pub(super) struct Updater {
    pages: [Option<BufferReferenceExclusive>; MAX_DEPTH],
    positions: [usize; MAX_DEPTH],
    depth: usize,
    /// Does the next `store_page` replace the looked-up leaf in place?
    first_page: bool,
}

impl Updater {
    pub(super) fn new() -> Self {
        Self {
            pages: std::array::from_fn(|_| None),
            positions: [0; MAX_DEPTH],
            depth: 0,
            first_page: false,
        }
    }

    /// Exclusive descent to the leaf covering `key`, recording the path.
    /// A key beyond every max key lands on the rightmost leaf.
    pub(super) fn lookup<T: TreeIndex>(&mut self, index: &T, key: T::InnerKey) -> Result<()> {
        for slot in self.pages.iter_mut() {
            *slot = None;
        }

        self.pages[0] = Some(index.read_exclusive(index.root_page())?);
        self.positions[0] = 0;
        self.depth = 1;
        loop {
            let current = self.pages[self.depth - 1].as_ref().expect("path page");
            if !node::is_inner(current.data()) {
                self.first_page = true;
                return Ok(());
            }

            let position = {
                let data = current.data();
                let total = node::inner_count(data);
                let mut left = 0usize;
                let mut right = total;
                while left != right {
                    let middle = (left + right) / 2;
                    let middle_key = T::read_inner_key(
                        &data[node::inner_entry_offset(middle, T::INNER_KEY_SIZE)..],
                    );
                    if middle_key < key {
                        left = middle + 1;
                    } else if middle == 0 {
                        left = middle;
                        break;
                    } else if T::read_inner_key(
                        &data[node::inner_entry_offset(middle - 1, T::INNER_KEY_SIZE)..],
                    ) < key
                    {
                        left = middle;
                        break;
                    } else {
                        right = middle;
                    }
                }
                // Unsuccessful search: pick the rightmost entry.
                if left == total {
                    left = total - 1;
                }
                left
            };

            let child = node::inner_child(current.data(), position, T::INNER_KEY_SIZE);
            assert!(self.depth < MAX_DEPTH, "tree deeper than the supported maximum");
            self.pages[self.depth] = Some(index.read_exclusive(child)?);
            self.positions[self.depth] = position;
            self.depth += 1;
        }
    }

    /// Rewrite the parent separator for the child at `positions[level+1]`
    /// to carry `max_key`, cascading upward while the rewritten entry is
    /// the last one of its page.
    fn update_key<T: TreeIndex>(&mut self, mut level: usize, max_key: T::InnerKey) -> Result<()> {
        let entry_size = T::INNER_KEY_SIZE + 4;
        let mut new_entry: EntryBuf = smallvec![0u8; entry_size];
        T::write_inner_key(&mut new_entry[..T::INNER_KEY_SIZE], max_key);

        let parent = self.pages[level].take().expect("path page").modify()?;
        let slot = self.positions[level + 1];
        let old_entry = {
            let data = parent.data();
            let child = node::inner_child(data, slot, T::INNER_KEY_SIZE);
            node::write_u32(&mut new_entry, T::INNER_KEY_SIZE, child);
            data[node::inner_entry_offset(slot, T::INNER_KEY_SIZE)..][..entry_size].to_vec()
        };
        let action = UpdateInner::new(slot as u32, old_entry, new_entry.to_vec());
        self.pages[level] = Some(action.apply_but_keep(parent)?);

        while level > 0 {
            // Not the maximum of the page above? Then nothing propagates.
            let parent_count =
                node::inner_count(self.pages[level - 1].as_ref().expect("path page").data());
            if self.positions[level] + 1 < parent_count {
                break;
            }

            let parent = self.pages[level - 1].take().expect("path page").modify()?;
            let slot = self.positions[level];
            let old_entry = {
                let data = parent.data();
                let child = node::inner_child(data, slot, T::INNER_KEY_SIZE);
                node::write_u32(&mut new_entry, T::INNER_KEY_SIZE, child);
                data[node::inner_entry_offset(slot, T::INNER_KEY_SIZE)..][..entry_size].to_vec()
            };
            let action = UpdateInner::new(slot as u32, old_entry, new_entry.to_vec());
            self.pages[level - 1] = Some(action.apply_but_keep(parent)?);
            level -= 1;
        }
        Ok(())
    }

    /// Store a merged leaf image. The first page after a lookup replaces
    /// the current leaf in place; later pages are spliced into the leaf
    /// chain as fresh allocations, inserting separators (and splitting
    /// inner pages) up the path.
    pub(super) fn store_page<T: TreeIndex>(
        &mut self,
        index: &mut T,
        data: &mut [u8; PAGE_SIZE],
        max_key: T::InnerKey,
    ) -> Result<()> {
        let entry_size = T::INNER_KEY_SIZE + 4;
        let max_inner_count = node::max_inner_count(T::INNER_KEY_SIZE);
        debug_assert!(self.depth >= 2, "leaf stored without an inner level");

        if self.first_page {
            let leaf = self.pages[self.depth - 1].take().expect("leaf page").modify()?;
            let old_content = {
                let leaf_data = leaf.data();
                // Keep the chain intact.
                data[8..12].copy_from_slice(&leaf_data[8..12]);
                leaf_data[8..].to_vec()
            };
            let action = UpdateLeaf::new(old_content, data[8..].to_vec());
            self.pages[self.depth - 1] = Some(action.apply_but_keep(leaf)?);

            self.update_key::<T>(self.depth - 2, max_key)?;
            self.first_page = false;
            return Ok(());
        }

        // Splice a fresh leaf behind the current one.
        let new_leaf = index.alloc_page()?;
        let new_leaf_no = new_leaf.page_no();
        let old_leaf = self.pages[self.depth - 1].take().expect("leaf page");
        let old_next: [u8; 4] = old_leaf.data()[8..12].try_into().unwrap();
        data[8..12].copy_from_slice(&old_next);

        let old_leaf = old_leaf.modify()?;
        UpdateLeaf::new(old_next.to_vec(), new_leaf_no.to_be_bytes().to_vec()).apply(old_leaf)?;

        let action = UpdateLeaf::new(new_leaf.data()[8..].to_vec(), data[8..].to_vec());
        self.pages[self.depth - 1] = Some(action.apply_but_keep(new_leaf)?);

        // Insert the separator into the parent, splitting as needed. The
        // pending separator `(insert_key, insert_page)` is carried
        // explicitly across levels: after a split the level above must
        // learn about the new right sibling, regardless of which half the
        // descent path keeps fixed.
        let mut insert_key = max_key;
        let mut insert_page = new_leaf_no;
        let mut insert_right = true;
        let mut level = self.depth - 2;
        loop {
            let count = node::inner_count(self.pages[level].as_ref().expect("path page").data());

            if count < max_inner_count {
                let inner = self.pages[level].take().expect("path page").modify()?;
                let mut new_entry = vec![0u8; entry_size];
                T::write_inner_key(&mut new_entry[..T::INNER_KEY_SIZE], insert_key);
                node::write_u32(&mut new_entry, T::INNER_KEY_SIZE, insert_page);
                let action =
                    InsertInner::new((self.positions[level + 1] + 1) as u32, new_entry);
                self.pages[level] = Some(action.apply_but_keep(inner)?);

                if self.positions[level + 1] + 1 == count && level > 0 {
                    self.update_key::<T>(level - 1, insert_key)?;
                }
                if insert_right {
                    self.positions[level + 1] += 1;
                }
                break;
            }

            // Split: build both page images, insert into the proper one,
            // then swap the images in through whole-page actions.
            let right = index.alloc_page()?;
            let right_pageno = right.page_no();
            let left_pageno = self.pages[level].as_ref().expect("path page").page_no();

            let left_count = max_inner_count / 2;
            let right_count = max_inner_count - left_count;

            let mut left_image = Box::new([0u8; PAGE_SIZE]);
            let mut right_image = Box::new([0u8; PAGE_SIZE]);
            {
                let page = self.pages[level].as_ref().expect("path page").data();
                debug_assert_eq!(node::inner_count(page), max_inner_count);
                let next_pageno = node::inner_next(page);

                node::init_inner(&mut left_image[..], right_pageno, left_count as u32);
                left_image[node::INNER_HEADER_SIZE..][..entry_size * left_count]
                    .copy_from_slice(&page[node::INNER_HEADER_SIZE..][..entry_size * left_count]);

                node::init_inner(&mut right_image[..], next_pageno, right_count as u32);
                right_image[node::INNER_HEADER_SIZE..][..entry_size * right_count]
                    .copy_from_slice(
                        &page[node::INNER_HEADER_SIZE + entry_size * left_count..]
                            [..entry_size * right_count],
                    );
            }
            let mut left_max = T::read_inner_key(
                &left_image[node::inner_entry_offset(left_count - 1, T::INNER_KEY_SIZE)..],
            );
            let mut right_max = T::read_inner_key(
                &right_image[node::inner_entry_offset(right_count - 1, T::INNER_KEY_SIZE)..],
            );

            let into_left = self.positions[level + 1] < left_count;
            if into_left {
                if insert_key > left_max {
                    left_max = insert_key;
                }
            } else {
                self.positions[level + 1] -= left_count;
                debug_assert!(self.positions[level + 1] < right_count);
                if insert_key > right_max {
                    debug_assert_eq!(self.positions[level + 1] + 1, right_count);
                    right_max = insert_key;
                }
            }

            {
                let target: &mut [u8] = if into_left {
                    &mut left_image[..]
                } else {
                    &mut right_image[..]
                };
                let old_count = node::inner_count(target);
                let slot = self.positions[level + 1] + 1;
                let start = node::inner_entry_offset(slot, T::INNER_KEY_SIZE);
                let end = node::inner_entry_offset(old_count, T::INNER_KEY_SIZE);
                target.copy_within(start..end, start + entry_size);
                T::write_inner_key(&mut target[start..start + T::INNER_KEY_SIZE], insert_key);
                node::write_u32(target, start + T::INNER_KEY_SIZE, insert_page);
                node::write_u32(target, 16, (old_count + 1) as u32);

                if insert_right {
                    self.positions[level + 1] += 1;
                }
            }

            if level > 0 {
                self.update_key::<T>(level - 1, left_max)?;
            }

            {
                let left = self.pages[level].take().expect("path page").modify()?;
                let update_left =
                    UpdateInnerPage::new(left.data()[8..].to_vec(), left_image[8..].to_vec());
                let update_right =
                    UpdateInnerPage::new(right.data()[8..].to_vec(), right_image[8..].to_vec());
                // Keep the half the descent position lives in; the old
                // entry and the freshly inserted one always share it.
                if into_left {
                    self.pages[level] = Some(update_left.apply_but_keep(left)?);
                    update_right.apply(right)?;
                    insert_right = false;
                } else {
                    update_left.apply(left)?;
                    self.pages[level] = Some(update_right.apply_but_keep(right)?);
                    insert_right = true;
                }
            }

            if level == 0 {
                // The root split: grow the tree by one level.
                self.depth += 1;
                assert!(self.depth <= MAX_DEPTH, "tree deeper than the supported maximum");
                for i in (1..self.depth).rev() {
                    self.pages.swap(i, i - 1);
                    self.positions[i] = self.positions[i - 1];
                }

                let new_root = index.alloc_page()?;
                let mut image = Box::new([0u8; PAGE_SIZE]);
                node::init_inner(&mut image[..], 0, 2);
                let first = node::inner_entry_offset(0, T::INNER_KEY_SIZE);
                T::write_inner_key(&mut image[first..first + T::INNER_KEY_SIZE], left_max);
                node::write_u32(&mut image[..], first + T::INNER_KEY_SIZE, left_pageno);
                let second = node::inner_entry_offset(1, T::INNER_KEY_SIZE);
                T::write_inner_key(&mut image[second..second + T::INNER_KEY_SIZE], right_max);
                node::write_u32(&mut image[..], second + T::INNER_KEY_SIZE, right_pageno);

                let action =
                    UpdateInnerPage::new(new_root.data()[8..].to_vec(), image[8..].to_vec());
                self.pages[0] = Some(action.apply_but_keep(new_root)?);
                let root_no = self.pages[0].as_ref().expect("new root").page_no();
                index.set_root_page(root_no)?;
                debug!(root = root_no, depth = self.depth, "grew a new root");

                self.positions[1] = if insert_right { 1 } else { 0 };
                break;
            }

            insert_key = right_max;
            insert_page = right_pageno;
            level -= 1;
        }
        Ok(())
    }

    pub(super) fn has_next_leaf(&self) -> bool {
        node::leaf_next(self.leaf_page()) != 0
    }

    /// First entry key of the leaf after the current one.
    pub(super) fn next_leaf_start<T: TreeIndex>(&self, index: &T) -> Result<T::InnerKey> {
        let next = node::leaf_next(self.leaf_page());
        let page = index.read_shared(next)?;
        Ok(T::first_entry_key(&page.data()[node::LEAF_HEADER_SIZE..]))
    }

    pub(super) fn leaf_page(&self) -> &[u8] {
        self.pages[self.depth - 1].as_ref().expect("leaf page").data()
    }
}

impl<T: TreeIndex> BTree<T> {
    /// Merge a sorted entry stream into the tree.
    ///
    /// Entries with keys already present are offered to
    /// [`TreeIndex::merge_conflict_with`]; absorbed entries are reported
    /// back through [`EntrySource::mark_as_conflict`] instead of being
    /// stored. Runs of equal derived keys are never chopped across a
    /// page boundary.
    pub fn perform_update<S>(&mut self, source: &mut S) -> Result<()>
    where
        S: EntrySource<Entry = T::LeafEntry>,
    {
        let Some(mut current) = source.next_entry()? else {
            return Ok(());
        };
        let mut has_current = true;
        let mut source_done = false;

        let mut updater = Updater::new();
        let mut buffer = Box::new([0u8; PAGE_SIZE]);

        loop {
            if !has_current {
                if source_done {
                    break;
                }
                match source.next_entry()? {
                    Some(entry) => {
                        current = entry;
                        has_current = true;
                    }
                    None => break,
                }
            }

            // Fix the affected leaf and find where its successor starts.
            updater.lookup(self.index(), T::derive_inner_key(&current))?;
            let merge_limit = if updater.has_next_leaf() {
                Some(updater.next_leaf_start::<T>(self.index())?)
            } else {
                None
            };
            let past_limit = |entry: &T::LeafEntry| {
                merge_limit
                    .as_ref()
                    .is_some_and(|limit| !(T::derive_inner_key(entry) < *limit))
            };

            let mut leaf_entries = Vec::new();
            T::unpack_leaf_entries(
                &updater.leaf_page()[node::LEAF_HEADER_SIZE..],
                &mut leaf_entries,
            );
            let mut leaf_pos = 0usize;

            let mut merged: Vec<T::LeafEntry> = Vec::new();
            loop {
                while merged.len() < MAX_LEAF_ENTRIES {
                    if !has_current && !source_done {
                        match source.next_entry()? {
                            Some(entry) => {
                                current = entry;
                                has_current = true;
                            }
                            None => source_done = true,
                        }
                    }
                    // Leaf exhausted?
                    if leaf_pos == leaf_entries.len() {
                        if source_done {
                            break;
                        }
                        if past_limit(&current) {
                            break;
                        }
                        merged.push(current.clone());
                        has_current = false;
                        continue;
                    }
                    // Input exhausted (for this leaf)?
                    if source_done || past_limit(&current) {
                        merged.push(leaf_entries[leaf_pos].clone());
                        leaf_pos += 1;
                        continue;
                    }
                    if current < leaf_entries[leaf_pos] {
                        let absorbed = match merged.last_mut() {
                            Some(last) => T::merge_conflict_with(&current, last),
                            None => false,
                        };
                        if absorbed {
                            source.mark_as_conflict();
                        } else {
                            merged.push(current.clone());
                        }
                        has_current = false;
                    } else if leaf_entries[leaf_pos] < current {
                        merged.push(leaf_entries[leaf_pos].clone());
                        leaf_pos += 1;
                    } else {
                        // Same key: the stored entry wins the slot, the
                        // incoming one merges into it or follows it.
                        merged.push(leaf_entries[leaf_pos].clone());
                        leaf_pos += 1;
                        let last = merged.last_mut().expect("entry just pushed");
                        if T::merge_conflict_with(&current, last) {
                            source.mark_as_conflict();
                        } else {
                            merged.push(current.clone());
                        }
                        has_current = false;
                    }
                }
                if merged.is_empty() {
                    break;
                }

                let mut stored =
                    T::pack_leaf_entries(&mut buffer[node::LEAF_HEADER_SIZE..], &merged);
                assert!(stored > 0, "leaf entry does not fit a page");

                // Never chop a run of equal keys across pages.
                if stored < merged.len()
                    && T::derive_inner_key(&merged[stored - 1])
                        == T::derive_inner_key(&merged[stored])
                {
                    while stored > 0
                        && T::derive_inner_key(&merged[stored - 1])
                            == T::derive_inner_key(&merged[stored])
                    {
                        stored -= 1;
                    }
                    assert!(stored > 0, "run of equal keys exceeds a page");
                    let repacked = T::pack_leaf_entries(
                        &mut buffer[node::LEAF_HEADER_SIZE..],
                        &merged[..stored],
                    );
                    debug_assert_eq!(repacked, stored);
                }

                let page_max = T::derive_inner_key(&merged[stored - 1]);
                updater.store_page(self.index_internal(), &mut buffer, page_max)?;
                merged.drain(..stored);
            }
        }
        debug!("incremental merge complete");
        Ok(())
    }
}
