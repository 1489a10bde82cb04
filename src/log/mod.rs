//! # Log Actions
//!
//! Physical redo/undo actions. Every structural page mutation is
//! expressed as an action with three capabilities:
//!
//! - `write_log` serializes the action for a recovery log
//! - `redo` applies the change to a page image
//! - `undo` reverts it
//!
//! Actions are applied immediately through an exclusively fixed page:
//! [`LogAction::apply`] redoes the change and unfixes the page,
//! [`LogAction::apply_but_keep`] redoes it and hands the (still fixed)
//! exclusive reference back. Funneling all mutation through these two
//! entry points keeps redo code the single source of truth for what a
//! change does to a page, so a replayed log byte-matches the original
//! execution.
//!
//! Decoding is table driven: each action registers a decode function
//! under its `(segment type, action id)` pair in a process-wide
//! [`ActionRegistry`], built once on first use.

use std::fmt;
use std::sync::LazyLock;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::buffer::{BufferReferenceExclusive, BufferReferenceModified};

/// On-disk segment type ids. Actions are namespaced by the segment type
/// they operate on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u32)]
pub enum SegmentType {
    Unused = 0,
    SpaceInventory = 1,
    SegmentInventory = 2,
    Facts = 3,
    AggregatedFacts = 4,
    FullyAggregatedFacts = 5,
    Dictionary = 6,
    ExactStatistics = 7,
    BTree = 8,
    PredicateSet = 9,
}

/// A physical redo/undo action on a single page.
pub trait LogAction: fmt::Debug {
    /// Segment type namespacing the action id.
    fn segment(&self) -> SegmentType;
    /// Action id within the segment type.
    fn action(&self) -> u32;
    /// Serialize the action payload.
    fn write_log(&self, out: &mut Vec<u8>);
    /// Apply the change to a page image.
    fn redo(&self, page: &mut [u8]);
    /// Revert the change on a page image.
    fn undo(&self, page: &mut [u8]);

    /// Redo onto the page and unfix it.
    fn apply(&self, mut page: BufferReferenceModified) -> Result<()> {
        self.redo(page.data_mut());
        page.unfix()
    }

    /// Redo onto the page, keeping it fixed exclusively.
    fn apply_but_keep(&self, mut page: BufferReferenceModified) -> Result<BufferReferenceExclusive> {
        self.redo(page.data_mut());
        page.finish()
    }
}

/// Decode one serialized action payload.
pub type DecodeFn = fn(&mut &[u8]) -> Result<Box<dyn LogAction>>;

/// Table of decode functions keyed by `(segment type, action id)`.
pub struct ActionRegistry {
    decoders: HashMap<(SegmentType, u32), DecodeFn>,
}

impl ActionRegistry {
    fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, segment: SegmentType, action: u32, decode: DecodeFn) {
        let previous = self.decoders.insert((segment, action), decode);
        assert!(
            previous.is_none(),
            "duplicate log action registration {:?}/{}",
            segment,
            action
        );
    }

    /// Decode an action payload. Unknown ids are errors, not panics: a
    /// log written by a newer version must fail cleanly.
    pub fn decode(
        &self,
        segment: SegmentType,
        action: u32,
        input: &mut &[u8],
    ) -> Result<Box<dyn LogAction>> {
        let Some(decode) = self.decoders.get(&(segment, action)) else {
            bail!("unknown log action {:?}/{}", segment, action);
        };
        decode(input)
    }
}

static REGISTRY: LazyLock<ActionRegistry> = LazyLock::new(|| {
    let mut registry = ActionRegistry::new();
    crate::btree::actions::register_actions(&mut registry);
    registry
});

/// The process-wide action registry.
pub fn registry() -> &'static ActionRegistry {
    &REGISTRY
}

// Serialization helpers shared by all actions. Fixed-width big-endian
// integers, byte slices length-prefixed.

pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn read_u32(input: &mut &[u8]) -> Result<u32> {
    ensure!(input.len() >= 4, "log record truncated");
    let (head, tail) = input.split_at(4);
    *input = tail;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

pub fn read_bytes<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_u32(input)? as usize;
    ensure!(input.len() >= len, "log record truncated");
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip() {
        let mut out = Vec::new();
        write_u32(&mut out, 0xDEAD_BEEF);
        write_bytes(&mut out, b"payload");
        write_u32(&mut out, 7);

        let mut input = out.as_slice();
        assert_eq!(read_u32(&mut input).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_bytes(&mut input).unwrap(), b"payload");
        assert_eq!(read_u32(&mut input).unwrap(), 7);
        assert!(input.is_empty());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut out = Vec::new();
        write_bytes(&mut out, b"abcdef");
        out.truncate(6);

        let mut input = out.as_slice();
        assert!(read_bytes(&mut input).is_err());
    }

    #[test]
    fn unknown_action_is_an_error() {
        let mut input: &[u8] = &[];
        assert!(registry()
            .decode(SegmentType::Dictionary, 999, &mut input)
            .is_err());
    }
}
