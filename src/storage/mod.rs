//! # Storage Layer
//!
//! Two building blocks sit below everything else:
//!
//! - [`GrowableFile`]: a file that can grow while staying (partially)
//!   memory mapped. Mapping windows are append-only and never unmapped
//!   while the file is open, so page pointers handed out earlier stay
//!   valid for the file's lifetime.
//! - [`Partition`]: page-granular access on top of a `GrowableFile`,
//!   serving mapped pages as direct pointers and unmapped tail pages
//!   through a pool of scratch buffers.
//!
//! All page mutation happens in scratch buffers; the mapping itself is
//! only written when a finished page is flushed back while its owner
//! still holds it exclusively.

mod file;
mod partition;

pub use file::GrowableFile;
pub use partition::{PageInfo, Partition, MAPPING_THRESHOLD};

/// Size of a database page in bytes.
pub const PAGE_SIZE: usize = 16384;
