//! # Buffer Manager
//!
//! Scope-bound page references over a shared frame directory. Every open
//! page lives in a frame (`Arc<RwLock<FrameState>>`) keyed by partition
//! id and page number; references hold owned arc guards on that lock, so
//! they are movable values rather than borrow-bound views:
//!
//! ```text
//! BufferReference            shared read lock      data()
//! BufferReferenceExclusive   write lock            data(), modify()
//! BufferReferenceModified    write lock + scratch  data_mut(), unfix()/finish()
//! ```
//!
//! Page contents load lazily on first access and are released back to the
//! partition when the last reference to a frame drops. There is no
//! background writer: a modified page is written through to its partition
//! by `unfix()`/`finish()` before anyone else can see the frame again.
//!
//! ## Release protocol
//!
//! Dropping a reference re-locks the directory, and only if the frame's
//! reference count shows no other holder (and a `try_write` confirms no
//! guard is outstanding) the page goes back to the partition and the
//! directory entry disappears. New holders only materialize under the
//! directory mutex, so the count check cannot race.

mod reference;

pub use reference::{BufferReference, BufferReferenceExclusive, BufferReferenceModified};

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::storage::{PageInfo, Partition};

/// Directory key for one page of one partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PageKey {
    pub partition: u32,
    pub page_no: u32,
}

pub(crate) struct FrameState {
    pub(crate) partition: Arc<Partition>,
    pub(crate) page_no: u32,
    pub(crate) info: Option<PageInfo>,
}

pub(crate) type Frame = Arc<RwLock<FrameState>>;

pub(crate) struct BufferInner {
    directory: Mutex<HashMap<PageKey, Frame>>,
}

impl BufferInner {
    /// Fetch or create the frame for a page. The only place frames are
    /// handed out, always under the directory mutex.
    fn frame(&self, partition: &Arc<Partition>, page_no: u32) -> Frame {
        let key = PageKey {
            partition: partition.id(),
            page_no,
        };
        let mut directory = self.directory.lock();
        directory
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RwLock::new(FrameState {
                    partition: Arc::clone(partition),
                    page_no,
                    info: None,
                }))
            })
            .clone()
    }

    /// Drop one holder of a frame; evict the frame if it was the last.
    pub(crate) fn release(&self, frame: Frame) {
        let mut directory = self.directory.lock();
        // Two strong references left: the directory's and ours. Any other
        // holder (or a thread between frame() and locking) pushes the
        // count higher and we leave the frame alone.
        if Arc::strong_count(&frame) != 2 {
            return;
        }
        let Some(mut state) = frame.try_write() else {
            return;
        };
        if let Some(info) = state.info.take() {
            state.partition.finish_page(info);
        }
        let key = PageKey {
            partition: state.partition.id(),
            page_no: state.page_no,
        };
        drop(state);
        directory.remove(&key);
    }

    fn frame_count(&self) -> usize {
        self.directory.lock().len()
    }
}

/// Shared, cloneable handle to the frame directory.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<BufferInner>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BufferInner {
                directory: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fix a page shared. Blocks while someone holds the page exclusively.
    pub fn read_shared(
        &self,
        partition: &Arc<Partition>,
        page_no: u32,
    ) -> Result<BufferReference> {
        let frame = self.inner.frame(partition, page_no);

        let guard = frame.read_arc();
        if guard.info.is_some() {
            return Ok(BufferReference::new(guard, Arc::clone(&self.inner)));
        }
        drop(guard);

        let mut guard = frame.write_arc();
        if guard.info.is_none() {
            let state = &mut *guard;
            match state.partition.read_page(page_no) {
                Ok(info) => state.info = Some(info),
                Err(err) => {
                    drop(guard);
                    self.inner.release(frame);
                    return Err(err);
                }
            }
        }
        let guard = parking_lot::lock_api::ArcRwLockWriteGuard::downgrade(guard);
        Ok(BufferReference::new(guard, Arc::clone(&self.inner)))
    }

    /// Fix a page exclusively.
    pub fn read_exclusive(
        &self,
        partition: &Arc<Partition>,
        page_no: u32,
    ) -> Result<BufferReferenceExclusive> {
        let frame = self.inner.frame(partition, page_no);

        let mut guard = frame.write_arc();
        if guard.info.is_none() {
            let state = &mut *guard;
            match state.partition.read_page(page_no) {
                Ok(info) => state.info = Some(info),
                Err(err) => {
                    drop(guard);
                    self.inner.release(frame);
                    return Err(err);
                }
            }
        }
        Ok(BufferReferenceExclusive::new(guard, Arc::clone(&self.inner)))
    }

    /// Fix a freshly allocated page for writing without reading whatever
    /// the partition currently stores for it.
    pub fn build_page(
        &self,
        partition: &Arc<Partition>,
        page_no: u32,
    ) -> Result<BufferReferenceModified> {
        let frame = self.inner.frame(partition, page_no);

        let mut guard = frame.write_arc();
        let state = &mut *guard;
        let result = match state.info.as_mut() {
            // Already loaded (the page number was recycled): keep the
            // frame, just make it writable.
            Some(info) => state.partition.write_read_page(info),
            None => match state.partition.build_page(page_no) {
                Ok(info) => {
                    state.info = Some(info);
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            drop(guard);
            self.inner.release(frame);
            return Err(err);
        }
        Ok(BufferReferenceModified::new(guard, Arc::clone(&self.inner)))
    }

    /// Number of frames currently in the directory.
    pub fn frame_count(&self) -> usize {
        self.inner.frame_count()
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("frames", &self.inner.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;
    use tempfile::tempdir;

    fn test_partition(pages: u32) -> Arc<Partition> {
        let dir = tempdir().unwrap();
        let partition = Partition::create(dir.path().join("p")).unwrap();
        partition.grow(pages).unwrap();
        // Keep the tempdir alive for the partition's lifetime.
        std::mem::forget(dir);
        Arc::new(partition)
    }

    #[test]
    fn shared_references_coexist() {
        let partition = test_partition(4);
        let buffer = BufferManager::new();

        let a = buffer.read_shared(&partition, 1).unwrap();
        let b = buffer.read_shared(&partition, 1).unwrap();
        assert_eq!(a.page_no(), 1);
        assert_eq!(b.data().len(), PAGE_SIZE);
        assert_eq!(buffer.frame_count(), 1);

        drop(a);
        assert_eq!(buffer.frame_count(), 1);
        drop(b);
        assert_eq!(buffer.frame_count(), 0);
    }

    #[test]
    fn modify_writes_through_on_unfix() {
        let partition = test_partition(4);
        let buffer = BufferManager::new();

        let exclusive = buffer.read_exclusive(&partition, 2).unwrap();
        let mut modified = exclusive.modify().unwrap();
        modified.data_mut()[17] = 0x99;
        modified.unfix().unwrap();
        assert_eq!(buffer.frame_count(), 0);

        let shared = buffer.read_shared(&partition, 2).unwrap();
        assert_eq!(shared.data()[17], 0x99);
    }

    #[test]
    fn finish_keeps_the_page_fixed() {
        let partition = test_partition(4);
        let buffer = BufferManager::new();

        let mut modified = buffer.build_page(&partition, 3).unwrap();
        modified.data_mut()[0] = 0x42;
        let exclusive = modified.finish().unwrap();
        assert_eq!(exclusive.data()[0], 0x42);
        assert_eq!(buffer.frame_count(), 1);
        drop(exclusive);
        assert_eq!(buffer.frame_count(), 0);
    }

    #[test]
    #[should_panic(expected = "dropped without unfix or finish")]
    fn dropping_uncommitted_modified_panics() {
        let partition = test_partition(4);
        let buffer = BufferManager::new();

        let modified = buffer.build_page(&partition, 0).unwrap();
        drop(modified);
    }

    #[test]
    fn build_page_skips_reading() {
        let partition = test_partition(4);
        let buffer = BufferManager::new();

        let mut modified = buffer.build_page(&partition, 1).unwrap();
        assert!(modified.data().iter().all(|&b| b == 0));
        modified.data_mut()[5] = 5;
        modified.unfix().unwrap();
    }
}
