//! # tristore - Disk-Resident Storage Core for an RDF Triple Store
//!
//! tristore implements the storage layer of an RDF triple store: clustered
//! B+-trees over a page-oriented buffer layer over growable memory-mapped
//! files. The design prioritizes:
//!
//! - **Zero-copy reads**: mapped pages are served as direct pointers into
//!   the mapping, no intermediate buffers
//! - **Bounded descent**: fixed-depth trees (at most 10 levels), iterative
//!   algorithms, no recursion on the hot path
//! - **Mutation through log actions**: every structural page change is a
//!   physical redo/undo action applied through an exclusive page reference
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Concrete indexes (aggregated facts)    │
//! ├──────────────────────────────────────────┤
//! │   Generic B+-tree engine (bulk load,     │
//! │   lookup, incremental merge update)      │
//! ├────────────────────┬─────────────────────┤
//! │  Log actions       │  Buffer manager     │
//! │  (redo/undo)       │  (page references)  │
//! ├────────────────────┴─────────────────────┤
//! │   Partition (page access, scratch pool)  │
//! ├──────────────────────────────────────────┤
//! │   GrowableFile (mapping windows + I/O)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Page Model
//!
//! Files are arrays of 16KB pages addressed by `u32` page numbers. All
//! on-disk integers are big-endian, so pages dump byte-identically across
//! platforms. The head of a file stays memory mapped; a freshly grown tail
//! is served through pooled scratch buffers until enough of it accumulates
//! to be worth mapping.
//!
//! ## Module Overview
//!
//! - [`storage`]: growable mapped files and page-granular partitions
//! - [`buffer`]: shared/exclusive/modified page references over a frame
//!   directory
//! - [`log`]: physical redo/undo log actions and the action registry
//! - [`btree`]: the generic B+-tree engine
//! - [`index`]: concrete index segments built on the engine

pub mod btree;
pub mod buffer;
pub mod index;
pub mod log;
pub mod storage;

pub use buffer::{BufferManager, BufferReference, BufferReferenceExclusive, BufferReferenceModified};
pub use storage::{GrowableFile, Partition, PAGE_SIZE};
