use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLockReadGuard};

use super::frame::Frame;
use crate::primitives::concurrency::CheckpointLockStateChecker;
use crate::types::{FullPageId, GridError, Result};

/// State shared between the page memory and the handles it gives out.
pub(crate) struct HandleShared {
    pub acquired: AtomicU64,
    pub checker: Arc<dyn CheckpointLockStateChecker>,
}

/// A pinned page.
///
/// While the handle lives the page stays resident at the same slot. Dropping it
/// releases the pin on every exit path.
pub struct PageHandle {
    id: FullPageId,
    frame: Arc<Frame>,
    shared: Arc<HandleShared>,
}

impl PageHandle {
    /// Wraps a frame whose pin was already taken by the caller.
    pub(crate) fn from_pinned(
        id: FullPageId,
        frame: Arc<Frame>,
        shared: Arc<HandleShared>,
        first_pin: bool,
    ) -> Self {
        if first_pin {
            shared.acquired.fetch_add(1, Ordering::Relaxed);
        }
        Self { id, frame, shared }
    }

    /// Logical identifier of the page.
    pub fn id(&self) -> FullPageId {
        self.id
    }

    /// Index of the slot holding the page inside its segment.
    pub fn slot(&self) -> usize {
        self.frame.slot
    }

    /// Current structure version; bumped by every released modification.
    pub fn version(&self) -> u64 {
        self.frame.version()
    }

    /// Takes the shared page latch.
    pub fn read(&self) -> PageRead<'_> {
        PageRead {
            guard: self.frame.buf.read(),
        }
    }

    /// Takes the shared page latch, keeping the pin inside the guard.
    pub fn into_read(self) -> PageReadGuard {
        let guard = self.frame.buf.read_arc();
        PageReadGuard {
            handle: self,
            guard,
        }
    }

    /// Takes the exclusive page latch through a second pin.
    pub fn write(&self) -> Result<PageWriteGuard> {
        self.clone().into_write()
    }

    /// Takes the exclusive page latch, keeping the pin inside the guard.
    ///
    /// The calling thread must hold the checkpoint read lock.
    pub fn into_write(self) -> Result<PageWriteGuard> {
        if !self.shared.checker.checkpoint_lock_is_held_by_thread() {
            return Err(GridError::Invalid(
                "page mutation without the checkpoint read lock",
            ));
        }
        let guard = self.frame.buf.write_arc();
        Ok(PageWriteGuard {
            handle: self,
            guard: Some(guard),
            modified: false,
        })
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        self.frame.pin();
        Self {
            id: self.id,
            frame: Arc::clone(&self.frame),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if self.frame.unpin() == 1 {
            self.shared.acquired.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("id", &self.id)
            .field("slot", &self.frame.slot)
            .field("version", &self.frame.version())
            .finish()
    }
}

/// Borrowed shared latch on a page.
pub struct PageRead<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Owned shared latch on a page.
pub struct PageReadGuard {
    handle: PageHandle,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
}

impl PageReadGuard {
    /// Pinned page behind the latch.
    pub fn handle(&self) -> &PageHandle {
        &self.handle
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Owned exclusive latch on a page.
///
/// Releasing a guard that handed out mutable access marks the page dirty and
/// bumps its version before the latch opens again.
pub struct PageWriteGuard {
    handle: PageHandle,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
    modified: bool,
}

impl PageWriteGuard {
    /// Logical identifier of the page.
    pub fn id(&self) -> FullPageId {
        self.handle.id
    }

    /// Pinned page behind the latch.
    pub fn handle(&self) -> &PageHandle {
        &self.handle
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(guard) => guard,
            None => &[],
        }
    }

    /// Mutable page bytes; marks the page modified.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        match self.guard.as_mut() {
            Some(guard) => guard,
            None => &mut [],
        }
    }

    /// Returns true when mutable access was handed out.
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data_mut()
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if self.modified {
            self.handle.frame.set_dirty(true);
            self.handle.frame.bump_version();
        }
        drop(self.guard.take());
    }
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("id", &self.handle.id)
            .field("modified", &self.modified)
            .finish()
    }
}
