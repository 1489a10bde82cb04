//! # B+-Tree Engine
//!
//! A generic disk-resident B+-tree, parameterized over a [`TreeIndex`]
//! capability trait that supplies key and entry encoding plus page
//! allocation. Concrete index segments plug in their own fixed-size
//! inner keys and (possibly variable-width) leaf packing; the engine
//! owns everything structural:
//!
//! - `find_leaf`: shared-reference descent by inner key
//! - `perform_bulkload`: bottom-up construction from a sorted stream
//! - `perform_update`: incremental sorted-stream merge with page splits
//!
//! Inner pages store sorted `(max key, child)` entries; the rightmost
//! child of a page is logically unbounded. Leaves are chained left to
//! right, inner levels carry a chain too (in bulk-load order). Even a
//! single-leaf tree gets one inner level, so the root is always an
//! inner page.
//!
//! Updates hold an exclusive root-to-leaf path in fixed arrays (depth is
//! capped at [`MAX_DEPTH`]) and channel every page change through the
//! log actions in [`actions`].

pub mod actions;
pub mod node;

mod tree;
mod updater;

pub use tree::{BTree, EntrySource, TreeIndex};

/// Maximum tree depth, root to leaf inclusive.
pub const MAX_DEPTH: usize = 10;

/// Upper bound on entries handled per leaf, and on the size of a merge
/// batch. Deliberately generous; actual leaf capacity is whatever
/// `pack_leaf_entries` manages to fit.
pub const MAX_LEAF_ENTRIES: usize = crate::storage::PAGE_SIZE;
