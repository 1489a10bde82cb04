//! # Growable Memory-Mapped Files
//!
//! This module implements [`GrowableFile`], a file that can grow while
//! remaining memory mapped. Remapping a file invalidates every pointer
//! into the old mapping, which would force hazard tracking onto all
//! readers. `GrowableFile` sidesteps the problem entirely:
//!
//! - mapping windows are **append-only**: growing the mapping first tries
//!   to extend the last window in place (`mremap` without `MREMAP_MAYMOVE`
//!   on Linux) and otherwise maps the new region as an additional window
//! - windows are **never unmapped** while the file is open, so a page
//!   pointer handed out once stays valid for the file's lifetime
//!
//! Growing is split in two steps. `grow_physically` extends the file on
//! disk without touching the mapping; the new tail is reached through
//! positioned reads and writes. `grow_mapping` later pulls an
//! already-grown region under the mapping, once enough tail has
//! accumulated to be worth it (the caller decides when).
//!
//! ```text
//! |<-------------- size -------------->|
//! |<----- mapped_size ----->|          |
//! +----------+--------------+----------+
//! | window 0 |   window 1   | unmapped |
//! +----------+--------------+----------+
//!              mapped: raw     tail: pread/
//!              pointers        pwrite
//! ```
//!
//! Raw-pointer access ([`MmapRaw`]) is deliberate: pages are written
//! through the mapping while unrelated pages in the same window are read
//! concurrently, so handing out `&mut` slices over whole windows would
//! claim aliasing guarantees the access pattern does not have. Page-level
//! exclusion is enforced above, by the buffer manager.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

/// A contiguous mapped region of the file.
struct MapWindow {
    offset: u64,
    len: u64,
    map: MmapRaw,
}

/// A file that can grow while staying (partially) memory mapped.
pub struct GrowableFile {
    file: File,
    read_only: bool,
    /// Physical file size in bytes.
    size: u64,
    /// Prefix of the file covered by mapping windows.
    mapped_size: u64,
    windows: Vec<MapWindow>,
}

impl GrowableFile {
    /// Create a new, empty file. Nothing is mapped until the file grows.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;

        Ok(Self {
            file,
            read_only: false,
            size: 0,
            mapped_size: 0,
            windows: Vec::new(),
        })
    }

    /// Open an existing file and map its entire current contents as one
    /// window. An empty file maps nothing.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let mut windows = Vec::new();
        if size > 0 {
            let map = Self::map_region(&file, read_only, 0, size)
                .wrap_err_with(|| format!("failed to map '{}'", path.display()))?;
            windows.push(MapWindow {
                offset: 0,
                len: size,
                map,
            });
        }

        Ok(Self {
            file,
            read_only,
            size,
            mapped_size: size,
            windows,
        })
    }

    fn map_region(file: &File, read_only: bool, offset: u64, len: u64) -> Result<MmapRaw> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len as usize);
        let map = if read_only {
            options.map_raw_read_only(file)
        } else {
            options.map_raw(file)
        }
        .wrap_err_with(|| format!("failed to map {} bytes at offset {}", len, offset))?;
        Ok(map)
    }

    /// Physical file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Prefix of the file reachable through [`Self::mapped_ptr`].
    pub fn mapped_size(&self) -> u64 {
        self.mapped_size
    }

    /// Extend the file on disk without growing the mapping. The new
    /// region reads as zeroes and is reachable via positioned I/O.
    pub fn grow_physically(&mut self, increment: u64) -> Result<()> {
        ensure!(!self.read_only, "cannot grow a read-only file");
        ensure!(increment > 0, "zero-length physical grow");

        let new_size = self.size + increment;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;
        self.size = new_size;

        Ok(())
    }

    /// Extend the mapped region over already-grown file space.
    pub fn grow_mapping(&mut self, increment: u64) -> Result<()> {
        ensure!(increment > 0, "zero-length mapping grow");
        ensure!(
            self.mapped_size + increment <= self.size,
            "mapping grow past physical size ({} + {} > {})",
            self.mapped_size,
            increment,
            self.size
        );

        // Extending the last window in place keeps the window count down.
        // mremap without MREMAP_MAYMOVE either extends the existing
        // mapping at the same address or fails, so prior pointers survive
        // either way.
        #[cfg(target_os = "linux")]
        if let Some(last) = self.windows.last_mut() {
            let new_len = (last.len + increment) as usize;
            let options = memmap2::RemapOptions::new().may_move(false);
            // SAFETY: in-place remap never invalidates pointers into the
            // window; on failure the old mapping is left untouched and we
            // fall through to mapping a fresh window.
            if unsafe { last.map.remap(new_len, options) }.is_ok() {
                last.len += increment;
                self.mapped_size += increment;
                debug!(mapped = self.mapped_size, "extended mapping in place");
                return Ok(());
            }
        }

        let map = Self::map_region(&self.file, self.read_only, self.mapped_size, increment)?;
        self.windows.push(MapWindow {
            offset: self.mapped_size,
            len: increment,
            map,
        });
        self.mapped_size += increment;
        debug!(
            mapped = self.mapped_size,
            windows = self.windows.len(),
            "added mapping window"
        );

        Ok(())
    }

    /// Raw pointer to a mapped offset, or `None` beyond the mapped
    /// prefix. The pointer stays valid until the file is closed; callers
    /// must not access across a window boundary, so anything handing out
    /// fixed-size chunks has to grow the mapping in chunk multiples.
    pub fn mapped_ptr(&self, offset: u64) -> Option<*mut u8> {
        if offset >= self.mapped_size {
            return None;
        }
        let idx = self
            .windows
            .partition_point(|w| w.offset + w.len <= offset)
            .min(self.windows.len() - 1);
        let window = &self.windows[idx];
        debug_assert!(offset >= window.offset && offset < window.offset + window.len);
        // SAFETY: offset lies inside this window, checked above.
        Some(unsafe { window.map.as_mut_ptr().add((offset - window.offset) as usize) })
    }

    /// Positioned read. Valid for the whole file, mapped or not; the
    /// kernel keeps file and mapping coherent for the same file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("failed to read {} bytes at offset {}", buf.len(), offset))
    }

    /// Positioned write.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "cannot write a read-only file");
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", data.len(), offset))
    }

    /// An independently seekable handle to the same file, for positioned
    /// reads outside any lock guarding `self`.
    pub fn read_handle(&self) -> Result<File> {
        self.file.try_clone().wrap_err("failed to clone file handle")
    }

    /// Flush every mapping window, then the file itself.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        for window in &self.windows {
            window
                .map
                .flush()
                .wrap_err_with(|| format!("failed to flush window at offset {}", window.offset))?;
        }
        self.file.sync_data().wrap_err("failed to sync file")
    }
}

impl std::fmt::Debug for GrowableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableFile")
            .field("size", &self.size)
            .field("mapped_size", &self.mapped_size)
            .field("windows", &self.windows.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}
