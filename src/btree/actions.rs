//! B-tree log actions.
//!
//! Four physical actions cover every structural change the tree makes:
//! whole-page rewrites for inner pages and leaves (everything past the
//! lsn), single-entry updates and single-entry inserts on inner pages.
//! `UpdateLeaf` does double duty: with a 4-byte payload it patches just a
//! leaf's next pointer when a new page is spliced into the chain.

use eyre::{ensure, Result};

use crate::log::{self, ActionRegistry, LogAction, SegmentType};

use super::node::{self, INNER_HEADER_SIZE};

const ACTION_UPDATE_INNER_PAGE: u32 = 0;
const ACTION_UPDATE_INNER: u32 = 1;
const ACTION_INSERT_INNER: u32 = 2;
const ACTION_UPDATE_LEAF: u32 = 3;

/// Register all b-tree actions with the registry.
pub fn register_actions(registry: &mut ActionRegistry) {
    registry.register(SegmentType::BTree, ACTION_UPDATE_INNER_PAGE, |input| {
        Ok(Box::new(UpdateInnerPage {
            old_content: log::read_bytes(input)?.to_vec(),
            new_content: log::read_bytes(input)?.to_vec(),
        }))
    });
    registry.register(SegmentType::BTree, ACTION_UPDATE_INNER, |input| {
        Ok(Box::new(UpdateInner {
            slot: log::read_u32(input)?,
            old_entry: log::read_bytes(input)?.to_vec(),
            new_entry: log::read_bytes(input)?.to_vec(),
        }))
    });
    registry.register(SegmentType::BTree, ACTION_INSERT_INNER, |input| {
        Ok(Box::new(InsertInner {
            slot: log::read_u32(input)?,
            new_entry: log::read_bytes(input)?.to_vec(),
        }))
    });
    registry.register(SegmentType::BTree, ACTION_UPDATE_LEAF, |input| {
        Ok(Box::new(UpdateLeaf {
            old_content: log::read_bytes(input)?.to_vec(),
            new_content: log::read_bytes(input)?.to_vec(),
        }))
    });
}

/// Rewrite an inner page from offset 8 on.
#[derive(Debug)]
pub struct UpdateInnerPage {
    old_content: Vec<u8>,
    new_content: Vec<u8>,
}

impl UpdateInnerPage {
    pub fn new(old_content: Vec<u8>, new_content: Vec<u8>) -> Self {
        debug_assert_eq!(old_content.len(), new_content.len());
        Self {
            old_content,
            new_content,
        }
    }
}

impl LogAction for UpdateInnerPage {
    fn segment(&self) -> SegmentType {
        SegmentType::BTree
    }

    fn action(&self) -> u32 {
        ACTION_UPDATE_INNER_PAGE
    }

    fn write_log(&self, out: &mut Vec<u8>) {
        log::write_bytes(out, &self.old_content);
        log::write_bytes(out, &self.new_content);
    }

    fn redo(&self, page: &mut [u8]) {
        page[8..8 + self.new_content.len()].copy_from_slice(&self.new_content);
    }

    fn undo(&self, page: &mut [u8]) {
        page[8..8 + self.old_content.len()].copy_from_slice(&self.old_content);
    }
}

/// Replace one entry of an inner page.
#[derive(Debug)]
pub struct UpdateInner {
    slot: u32,
    old_entry: Vec<u8>,
    new_entry: Vec<u8>,
}

impl UpdateInner {
    pub fn new(slot: u32, old_entry: Vec<u8>, new_entry: Vec<u8>) -> Self {
        debug_assert_eq!(old_entry.len(), new_entry.len());
        Self {
            slot,
            old_entry,
            new_entry,
        }
    }

    fn entry_offset(&self) -> usize {
        INNER_HEADER_SIZE + self.new_entry.len() * self.slot as usize
    }
}

impl LogAction for UpdateInner {
    fn segment(&self) -> SegmentType {
        SegmentType::BTree
    }

    fn action(&self) -> u32 {
        ACTION_UPDATE_INNER
    }

    fn write_log(&self, out: &mut Vec<u8>) {
        log::write_u32(out, self.slot);
        log::write_bytes(out, &self.old_entry);
        log::write_bytes(out, &self.new_entry);
    }

    fn redo(&self, page: &mut [u8]) {
        let ofs = self.entry_offset();
        page[ofs..ofs + self.new_entry.len()].copy_from_slice(&self.new_entry);
    }

    fn undo(&self, page: &mut [u8]) {
        let ofs = self.entry_offset();
        page[ofs..ofs + self.old_entry.len()].copy_from_slice(&self.old_entry);
    }
}

/// Insert one entry into an inner page, shifting the tail right.
#[derive(Debug)]
pub struct InsertInner {
    slot: u32,
    new_entry: Vec<u8>,
}

impl InsertInner {
    pub fn new(slot: u32, new_entry: Vec<u8>) -> Self {
        Self { slot, new_entry }
    }
}

impl LogAction for InsertInner {
    fn segment(&self) -> SegmentType {
        SegmentType::BTree
    }

    fn action(&self) -> u32 {
        ACTION_INSERT_INNER
    }

    fn write_log(&self, out: &mut Vec<u8>) {
        log::write_u32(out, self.slot);
        log::write_bytes(out, &self.new_entry);
    }

    fn redo(&self, page: &mut [u8]) {
        let entry_size = self.new_entry.len();
        let count = node::inner_count(page);
        let slot = self.slot as usize;
        let start = INNER_HEADER_SIZE + entry_size * slot;
        let end = INNER_HEADER_SIZE + entry_size * count;
        page.copy_within(start..end, start + entry_size);
        page[start..start + entry_size].copy_from_slice(&self.new_entry);
        node::write_u32(page, 16, (count + 1) as u32);
    }

    fn undo(&self, page: &mut [u8]) {
        let entry_size = self.new_entry.len();
        let count = node::inner_count(page);
        let slot = self.slot as usize;
        let start = INNER_HEADER_SIZE + entry_size * slot;
        let end = INNER_HEADER_SIZE + entry_size * count;
        page.copy_within(start + entry_size..end, start);
        node::write_u32(page, 16, (count - 1) as u32);
    }
}

/// Rewrite a leaf from offset 8 on, or (with a 4-byte payload) just its
/// next pointer.
#[derive(Debug)]
pub struct UpdateLeaf {
    old_content: Vec<u8>,
    new_content: Vec<u8>,
}

impl UpdateLeaf {
    pub fn new(old_content: Vec<u8>, new_content: Vec<u8>) -> Self {
        debug_assert_eq!(old_content.len(), new_content.len());
        Self {
            old_content,
            new_content,
        }
    }
}

impl LogAction for UpdateLeaf {
    fn segment(&self) -> SegmentType {
        SegmentType::BTree
    }

    fn action(&self) -> u32 {
        ACTION_UPDATE_LEAF
    }

    fn write_log(&self, out: &mut Vec<u8>) {
        log::write_bytes(out, &self.old_content);
        log::write_bytes(out, &self.new_content);
    }

    fn redo(&self, page: &mut [u8]) {
        page[8..8 + self.new_content.len()].copy_from_slice(&self.new_content);
    }

    fn undo(&self, page: &mut [u8]) {
        page[8..8 + self.old_content.len()].copy_from_slice(&self.old_content);
    }
}

/// Decode helper for replay: reads the id pair, then the payload.
pub fn decode_action(input: &mut &[u8]) -> Result<Box<dyn LogAction>> {
    let segment = log::read_u32(input)?;
    ensure!(
        segment == SegmentType::BTree as u32,
        "not a b-tree log record"
    );
    let action = log::read_u32(input)?;
    crate::log::registry().decode(SegmentType::BTree, action, input)
}
