use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::FullPageId;

/// Replacement state of a slot in the CLOCK-Pro tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    Hot,
    Cold,
    Test,
}

/// One page slot of a segment arena.
///
/// The buffer lock doubles as the page latch. Pin count, dirty flag and version
/// are the only fields touched without it.
pub struct Frame {
    pub slot: usize,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pin_count: AtomicU32,
    version: AtomicU64,
    dirty: AtomicBool,
}

impl Frame {
    pub fn new(slot: usize, page_size: usize) -> Self {
        Self {
            slot,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            pin_count: AtomicU32::new(0),
            version: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Increments the pin count, returning the previous value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count, returning the previous value.
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned frame");
        prev
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }
}

/// Bookkeeping for a slot, guarded by the segment mutex.
#[derive(Clone, Debug)]
pub struct SlotMeta {
    pub id: Option<FullPageId>,
    pub state: FrameState,
    pub reference: bool,
}

impl SlotMeta {
    pub fn empty() -> Self {
        Self {
            id: None,
            state: FrameState::Test,
            reference: false,
        }
    }
}
