//! # Page-Granular Partitions
//!
//! A [`Partition`] carves a [`GrowableFile`] into 16KB pages and decides,
//! per page, how it is served:
//!
//! ```text
//! page_no < mapped ──────────────► direct pointer into the mapping
//! page_no in grown, unmapped tail
//!     tail >= MAPPING_THRESHOLD ─► grow the mapping, then serve mapped
//!     tail <  MAPPING_THRESHOLD ─► pooled scratch buffer + pread
//! ```
//!
//! The threshold keeps mapping syscalls rare: a freshly grown tail is
//! served through scratch buffers until 4096 pages (64MB) of it have
//! accumulated, then the whole tail is pulled under the mapping at once.
//!
//! Mutation never happens in the mapping directly. A page is upgraded to
//! a scratch copy first (`write_read_page`), modified there, and copied
//! back by `flush_written_page` while the caller still holds the page
//! exclusively. Positioned reads run outside the partition mutex on a
//! cloned file handle, so a cache-miss read does not serialize unrelated
//! page traffic.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use super::{GrowableFile, PAGE_SIZE};

/// Unmapped tail size, in pages, that triggers mapping growth.
pub const MAPPING_THRESHOLD: u32 = 4096;

static NEXT_PARTITION_ID: AtomicU32 = AtomicU32::new(1);

/// An owned page-sized buffer. Aligned so fixed-width entry reads never
/// cross alignment boundaries within a page.
#[repr(align(8))]
struct PageBuf([u8; PAGE_SIZE]);

enum PageSlot {
    /// Direct pointer into a mapping window. Read-only.
    Mapped(NonNull<u8>),
    /// Private writable copy from the scratch pool.
    Scratch(Box<PageBuf>),
}

/// An open page: its number plus the storage serving it.
///
/// A `PageInfo` must not outlive the partition that produced it; the
/// buffer layer guarantees this by keeping an `Arc<Partition>` in every
/// frame holding one.
pub struct PageInfo {
    page_no: u32,
    slot: PageSlot,
}

// SAFETY: the Mapped variant's pointer targets a mapping window that is
// never unmapped while the partition is open, and page-level exclusion is
// enforced by the buffer layer above, so moving or sharing the handle
// across threads is sound.
unsafe impl Send for PageInfo {}
unsafe impl Sync for PageInfo {}

impl PageInfo {
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn data(&self) -> &[u8] {
        match &self.slot {
            // SAFETY: the pointer covers one full page inside a live
            // mapping window; no writer exists while shared references
            // are out (buffer-layer discipline).
            PageSlot::Mapped(ptr) => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), PAGE_SIZE)
            },
            PageSlot::Scratch(buf) => &buf.0,
        }
    }

    /// Mutable page contents. Only valid on writable pages; taking a
    /// mapped page here is a precondition violation.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.slot {
            PageSlot::Mapped(_) => panic!("attempted to mutate a page without write_read_page"),
            PageSlot::Scratch(buf) => &mut buf.0,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.slot, PageSlot::Scratch(_))
    }
}

struct PartitionInner {
    file: GrowableFile,
    /// Physical size in pages.
    size: u32,
    /// Mapped prefix in pages.
    mapped: u32,
    /// Scratch buffer pool.
    scratch: Vec<Box<PageBuf>>,
}

/// Page-granular access to one data file.
pub struct Partition {
    id: u32,
    read_only: bool,
    /// Independent handle for positioned reads outside the mutex.
    io: File,
    inner: Mutex<PartitionInner>,
}

impl Partition {
    /// Create a new, empty partition.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = GrowableFile::create(path)?;
        Self::from_file(file, false)
    }

    /// Open an existing partition. The file size must be page aligned.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = GrowableFile::open(path, read_only)?;
        ensure!(
            file.size() % PAGE_SIZE as u64 == 0,
            "partition size {} is not a multiple of the page size",
            file.size()
        );
        Self::from_file(file, read_only)
    }

    fn from_file(file: GrowableFile, read_only: bool) -> Result<Self> {
        let io = file.read_handle()?;
        let size = (file.size() / PAGE_SIZE as u64) as u32;
        let mapped = (file.mapped_size() / PAGE_SIZE as u64) as u32;
        Ok(Self {
            id: NEXT_PARTITION_ID.fetch_add(1, Ordering::Relaxed),
            read_only,
            io,
            inner: Mutex::new(PartitionInner {
                file,
                size,
                mapped,
                scratch: Vec::new(),
            }),
        })
    }

    /// Process-unique partition id, used to key buffer frames.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Current size in pages.
    pub fn size(&self) -> u32 {
        self.inner.lock().size
    }

    /// Mapped prefix in pages.
    pub fn mapped_pages(&self) -> u32 {
        self.inner.lock().mapped
    }

    /// Open a page for reading.
    pub fn read_page(&self, page_no: u32) -> Result<PageInfo> {
        let mut inner = self.inner.lock();
        ensure!(
            page_no < inner.size,
            "page {} out of bounds (size={})",
            page_no,
            inner.size
        );

        if page_no >= inner.mapped {
            let tail = inner.size - inner.mapped;
            if tail >= MAPPING_THRESHOLD {
                inner
                    .file
                    .grow_mapping(tail as u64 * PAGE_SIZE as u64)
                    .wrap_err("failed to grow mapping over unmapped tail")?;
                inner.mapped = inner.size;
                debug!(partition = self.id, pages = inner.mapped, "mapped tail");
            } else {
                // Cold tail page: serve a scratch copy, reading outside
                // the mutex.
                let mut buf = inner
                    .scratch
                    .pop()
                    .unwrap_or_else(|| Box::new(PageBuf([0; PAGE_SIZE])));
                drop(inner);
                self.io
                    .read_exact_at(&mut buf.0, page_no as u64 * PAGE_SIZE as u64)
                    .wrap_err_with(|| format!("failed to read page {}", page_no))?;
                return Ok(PageInfo {
                    page_no,
                    slot: PageSlot::Scratch(buf),
                });
            }
        }

        let ptr = inner
            .file
            .mapped_ptr(page_no as u64 * PAGE_SIZE as u64)
            .expect("page below mapped prefix must be mapped");
        Ok(PageInfo {
            page_no,
            // SAFETY: mapped_ptr never returns null.
            slot: PageSlot::Mapped(unsafe { NonNull::new_unchecked(ptr) }),
        })
    }

    /// Open a page for writing, preserving its current contents.
    pub fn write_page(&self, page_no: u32) -> Result<PageInfo> {
        let mut info = self.read_page(page_no)?;
        self.write_read_page(&mut info)?;
        Ok(info)
    }

    /// Open a page for writing without reading its old contents. For
    /// freshly allocated pages.
    pub fn build_page(&self, page_no: u32) -> Result<PageInfo> {
        ensure!(!self.read_only, "cannot build a page in a read-only partition");
        let mut inner = self.inner.lock();
        ensure!(
            page_no < inner.size,
            "page {} out of bounds (size={})",
            page_no,
            inner.size
        );
        let mut buf = inner
            .scratch
            .pop()
            .unwrap_or_else(|| Box::new(PageBuf([0; PAGE_SIZE])));
        buf.0.fill(0);
        Ok(PageInfo {
            page_no,
            slot: PageSlot::Scratch(buf),
        })
    }

    /// Upgrade a read page to a writable scratch copy.
    pub fn write_read_page(&self, info: &mut PageInfo) -> Result<()> {
        ensure!(!self.read_only, "cannot write a read-only partition");
        if let PageSlot::Mapped(ptr) = info.slot {
            let mut buf = {
                let mut inner = self.inner.lock();
                inner
                    .scratch
                    .pop()
                    .unwrap_or_else(|| Box::new(PageBuf([0; PAGE_SIZE])))
            };
            // SAFETY: the source covers one full mapped page and the
            // caller holds it exclusively, so nobody writes it meanwhile.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), buf.0.as_mut_ptr(), PAGE_SIZE);
            }
            info.slot = PageSlot::Scratch(buf);
        }
        Ok(())
    }

    /// Publish a written page back to storage. Does not release the page;
    /// the caller keeps its (still writable) reference.
    pub fn flush_written_page(&self, info: &PageInfo) -> Result<()> {
        let buf = match &info.slot {
            PageSlot::Scratch(buf) => buf,
            PageSlot::Mapped(_) => bail!("flush of a page that was never made writable"),
        };
        let inner = self.inner.lock();
        if info.page_no < inner.mapped {
            let ptr = inner
                .file
                .mapped_ptr(info.page_no as u64 * PAGE_SIZE as u64)
                .expect("page below mapped prefix must be mapped");
            // SAFETY: destination is one full mapped page held
            // exclusively by the caller of this flush.
            unsafe {
                std::ptr::copy_nonoverlapping(buf.0.as_ptr(), ptr, PAGE_SIZE);
            }
        } else {
            inner
                .file
                .write(info.page_no as u64 * PAGE_SIZE as u64, &buf.0)
                .wrap_err_with(|| format!("failed to write page {}", info.page_no))?;
        }
        Ok(())
    }

    /// Release a page, returning any scratch buffer to the pool.
    pub fn finish_page(&self, info: PageInfo) {
        if let PageSlot::Scratch(buf) = info.slot {
            self.inner.lock().scratch.push(buf);
        }
    }

    /// Grow the partition by at least `min_increase` pages. Returns the
    /// page range `(start, count)` of the new region.
    pub fn grow(&self, min_increase: u32) -> Result<(u32, u32)> {
        ensure!(!self.read_only, "cannot grow a read-only partition");
        ensure!(min_increase > 0, "zero-length partition grow");
        let mut inner = self.inner.lock();
        let increase = (inner.size / 8).max(min_increase);
        inner
            .file
            .grow_physically(increase as u64 * PAGE_SIZE as u64)
            .wrap_err("failed to grow partition")?;
        let start = inner.size;
        inner.size += increase;
        debug!(
            partition = self.id,
            start, increase, "grew partition"
        );
        Ok((start, increase))
    }

    /// Flush the underlying file.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.flush()
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("size", &inner.size)
            .field("mapped", &inner.mapped)
            .field("read_only", &self.read_only)
            .finish()
    }
}
