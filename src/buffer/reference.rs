//! Page reference types.
//!
//! All three references own an arc guard on their frame's lock, so they
//! can be stored in arrays, returned from functions and swapped between
//! slots without carrying a lifetime. The escalation path is one-way:
//!
//! ```text
//! read_shared ──► BufferReference
//! read_exclusive ──► BufferReferenceExclusive ──modify()──► Modified
//! build_page ───────────────────────────────────────────► Modified
//!                      Modified ──finish()──► BufferReferenceExclusive
//!                      Modified ──unfix()──► (released)
//! ```
//!
//! A modified reference is a liability until terminated: its page has (or
//! will have) content diverging from storage, so plain `drop` is a
//! programming error and panics.

use std::sync::Arc;

use eyre::Result;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use super::{BufferInner, FrameState};

type ReadGuard = ArcRwLockReadGuard<RawRwLock, FrameState>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, FrameState>;

/// A shared (read-only) fix on a page.
pub struct BufferReference {
    guard: Option<ReadGuard>,
    manager: Arc<BufferInner>,
}

impl BufferReference {
    pub(crate) fn new(guard: ReadGuard, manager: Arc<BufferInner>) -> Self {
        Self {
            guard: Some(guard),
            manager,
        }
    }

    pub fn page_no(&self) -> u32 {
        self.guard.as_ref().expect("released reference").page_no
    }

    pub fn data(&self) -> &[u8] {
        let state = self.guard.as_ref().expect("released reference");
        state.info.as_ref().expect("unloaded frame").data()
    }
}

impl Drop for BufferReference {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let frame = Arc::clone(ArcRwLockReadGuard::rwlock(&guard));
            drop(guard);
            self.manager.release(frame);
        }
    }
}

/// An exclusive fix on a page. Still read-only; `modify` makes it
/// writable.
pub struct BufferReferenceExclusive {
    guard: Option<WriteGuard>,
    manager: Arc<BufferInner>,
}

impl BufferReferenceExclusive {
    pub(crate) fn new(guard: WriteGuard, manager: Arc<BufferInner>) -> Self {
        Self {
            guard: Some(guard),
            manager,
        }
    }

    pub fn page_no(&self) -> u32 {
        self.guard.as_ref().expect("released reference").page_no
    }

    pub fn data(&self) -> &[u8] {
        let state = self.guard.as_ref().expect("released reference");
        state.info.as_ref().expect("unloaded frame").data()
    }

    /// Take ownership for modification. The page gets a private scratch
    /// copy if it was served straight from the mapping.
    pub fn modify(mut self) -> Result<BufferReferenceModified> {
        let mut guard = self.guard.take().expect("released reference");
        let state = &mut *guard;
        let info = state.info.as_mut().expect("unloaded frame");
        if let Err(err) = state.partition.write_read_page(info) {
            let frame = Arc::clone(ArcRwLockWriteGuard::rwlock(&guard));
            drop(guard);
            self.manager.release(frame);
            return Err(err);
        }
        Ok(BufferReferenceModified {
            guard: Some(guard),
            manager: Arc::clone(&self.manager),
        })
    }
}

impl Drop for BufferReferenceExclusive {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let frame = Arc::clone(ArcRwLockWriteGuard::rwlock(&guard));
            drop(guard);
            self.manager.release(frame);
        }
    }
}

/// An exclusive, writable fix on a page. Must end in [`Self::unfix`] or
/// [`Self::finish`].
pub struct BufferReferenceModified {
    guard: Option<WriteGuard>,
    manager: Arc<BufferInner>,
}

impl BufferReferenceModified {
    pub(crate) fn new(guard: WriteGuard, manager: Arc<BufferInner>) -> Self {
        Self {
            guard: Some(guard),
            manager,
        }
    }

    pub fn page_no(&self) -> u32 {
        self.guard.as_ref().expect("released reference").page_no
    }

    pub fn data(&self) -> &[u8] {
        let state = self.guard.as_ref().expect("released reference");
        state.info.as_ref().expect("unloaded frame").data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let state = self.guard.as_mut().expect("released reference");
        state.info.as_mut().expect("unloaded frame").data_mut()
    }

    /// Write the page through to its partition and release it.
    pub fn unfix(mut self) -> Result<()> {
        let guard = self.guard.take().expect("released reference");
        let flushed = guard
            .partition
            .flush_written_page(guard.info.as_ref().expect("unloaded frame"));
        let frame = Arc::clone(ArcRwLockWriteGuard::rwlock(&guard));
        drop(guard);
        self.manager.release(frame);
        flushed
    }

    /// Write the page through but keep it fixed exclusively.
    pub fn finish(mut self) -> Result<BufferReferenceExclusive> {
        let guard = self.guard.take().expect("released reference");
        match guard
            .partition
            .flush_written_page(guard.info.as_ref().expect("unloaded frame"))
        {
            Ok(()) => Ok(BufferReferenceExclusive {
                guard: Some(guard),
                manager: Arc::clone(&self.manager),
            }),
            Err(err) => {
                let frame = Arc::clone(ArcRwLockWriteGuard::rwlock(&guard));
                drop(guard);
                self.manager.release(frame);
                Err(err)
            }
        }
    }
}

impl Drop for BufferReferenceModified {
    fn drop(&mut self) {
        if self.guard.is_some() && !std::thread::panicking() {
            panic!("modified page reference dropped without unfix or finish");
        }
        if let Some(guard) = self.guard.take() {
            // Unwinding: give the frame back so the directory does not
            // keep a locked entry around.
            let frame = Arc::clone(ArcRwLockWriteGuard::rwlock(&guard));
            drop(guard);
            self.manager.release(frame);
        }
    }
}
