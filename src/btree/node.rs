//! On-disk node layout.
//!
//! All integers are big-endian. The page kind is discriminated by the
//! u32 at offset 8: inner pages carry the marker `0xFFFF_FFFF` there,
//! which cannot collide with a leaf because that position holds the
//! leaf's next-page pointer and `!0` is never a valid page number.
//!
//! ```text
//! inner page                          leaf page
//! +0   lsn          u64              +0   lsn        u64
//! +8   marker       u32 = !0         +8   next leaf  u32
//! +12  next (level) u32              +12  payload (segment specific)
//! +16  entry count  u32
//! +20  padding      u32
//! +24  entries: key | child u32, sorted, key = max key of child;
//!      the rightmost child is logically unbounded
//! ```

use eyre::{ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::PAGE_SIZE;

pub const INNER_HEADER_SIZE: usize = 24;
pub const LEAF_HEADER_SIZE: usize = 12;
/// Offset of the next-pointer within an inner page.
pub const INNER_NEXT_OFFSET: usize = 12;
/// Offset of the next-pointer within a leaf page.
pub const LEAF_NEXT_OFFSET: usize = 8;
/// Page kind discriminator at offset 8.
pub const INNER_MARKER: u32 = 0xFFFF_FFFF;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub struct InnerHeader {
    pub lsn: U64,
    pub marker: U32,
    pub next: U32,
    pub count: U32,
    pub pad: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub struct LeafHeader {
    pub lsn: U64,
    pub next: U32,
}

impl InnerHeader {
    pub fn from_page(page: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(page)
            .map_err(|_| eyre::eyre!("page too small for an inner header"))?;
        ensure!(header.marker.get() == INNER_MARKER, "not an inner page");
        Ok(header)
    }
}

impl LeafHeader {
    pub fn from_page(page: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(page)
            .map_err(|_| eyre::eyre!("page too small for a leaf header"))?;
        Ok(header)
    }
}

pub fn read_u32(page: &[u8], ofs: usize) -> u32 {
    u32::from_be_bytes(page[ofs..ofs + 4].try_into().unwrap())
}

pub fn write_u32(page: &mut [u8], ofs: usize, value: u32) {
    page[ofs..ofs + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn read_u64(page: &[u8], ofs: usize) -> u64 {
    u64::from_be_bytes(page[ofs..ofs + 8].try_into().unwrap())
}

pub fn write_u64(page: &mut [u8], ofs: usize, value: u64) {
    page[ofs..ofs + 8].copy_from_slice(&value.to_be_bytes());
}

pub fn is_inner(page: &[u8]) -> bool {
    read_u32(page, LEAF_NEXT_OFFSET) == INNER_MARKER
}

pub fn inner_count(page: &[u8]) -> usize {
    read_u32(page, 16) as usize
}

pub fn inner_next(page: &[u8]) -> u32 {
    read_u32(page, INNER_NEXT_OFFSET)
}

pub fn leaf_next(page: &[u8]) -> u32 {
    read_u32(page, LEAF_NEXT_OFFSET)
}

/// Byte offset of an inner entry.
pub fn inner_entry_offset(slot: usize, key_size: usize) -> usize {
    INNER_HEADER_SIZE + slot * (key_size + 4)
}

/// Child page number of an inner entry.
pub fn inner_child(page: &[u8], slot: usize, key_size: usize) -> u32 {
    read_u32(page, inner_entry_offset(slot, key_size) + key_size)
}

/// Entries that fit one inner page.
pub fn max_inner_count(key_size: usize) -> usize {
    (PAGE_SIZE - INNER_HEADER_SIZE) / (key_size + 4)
}

/// Initialize an inner page image: zero lsn, marker, level link, count.
pub fn init_inner(page: &mut [u8], next: u32, count: u32) {
    write_u64(page, 0, 0);
    write_u32(page, 8, INNER_MARKER);
    write_u32(page, INNER_NEXT_OFFSET, next);
    write_u32(page, 16, count);
    write_u32(page, 20, 0);
}

/// Initialize a leaf page image: zero lsn, chain link.
pub fn init_leaf(page: &mut [u8], next: u32) {
    write_u64(page, 0, 0);
    write_u32(page, LEAF_NEXT_OFFSET, next);
}
