use std::cmp::{max, min};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::frame::{Frame, FrameState, SlotMeta};
use crate::types::FullPageId;

/// One independently locked slice of page memory.
pub(crate) struct Segment {
    pub index: usize,
    pub inner: Mutex<SegmentInner>,
}

impl Segment {
    pub fn new(index: usize, capacity: usize, page_size: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(SegmentInner::new(capacity, page_size)),
        }
    }
}

/// Slot arena, page table and CLOCK-Pro replacement state of a segment.
pub(crate) struct SegmentInner {
    pub frames: Vec<Arc<Frame>>,
    slots: Vec<SlotMeta>,
    page_table: FxHashMap<FullPageId, usize>,
    free_slots: Vec<usize>,
    clock_hand_hot: usize,
    clock_hand_cold: usize,
    target_cold: usize,
    hot_count: usize,
    cold_count: usize,
    test_pages: VecDeque<FullPageId>,
    test_lookup: FxHashSet<FullPageId>,
}

impl SegmentInner {
    fn new(capacity: usize, page_size: usize) -> Self {
        let capacity = capacity.max(1);
        let frames = (0..capacity)
            .map(|slot| Arc::new(Frame::new(slot, page_size)))
            .collect();
        Self {
            frames,
            slots: vec![SlotMeta::empty(); capacity],
            page_table: FxHashMap::default(),
            // Reversed so slots fill from index zero.
            free_slots: (0..capacity).rev().collect(),
            clock_hand_hot: 0,
            clock_hand_cold: 0,
            target_cold: max(1, capacity / 2),
            hot_count: 0,
            cold_count: 0,
            test_pages: VecDeque::new(),
            test_lookup: FxHashSet::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn resident(&self) -> usize {
        self.page_table.len()
    }

    pub fn slot_id(&self, idx: usize) -> Option<FullPageId> {
        self.slots[idx].id
    }

    /// Resident pages with their slot index.
    pub fn resident_slots(&self) -> impl Iterator<Item = (FullPageId, usize)> + '_ {
        self.page_table.iter().map(|(id, idx)| (*id, *idx))
    }

    /// Finds a resident page and records the access.
    pub fn lookup(&mut self, id: FullPageId) -> Option<usize> {
        let idx = *self.page_table.get(&id)?;
        self.slots[idx].reference = true;
        Some(idx)
    }

    pub fn take_free_slot(&mut self) -> Option<usize> {
        self.free_slots.pop()
    }

    pub fn return_free_slot(&mut self, idx: usize) {
        debug_assert!(self.slots[idx].id.is_none());
        self.free_slots.push(idx);
    }

    /// Maps `id` onto an empty slot.
    ///
    /// Pages that come back while still remembered as test pages start hot and
    /// grow the cold target; first-time pages start cold and shrink it.
    pub fn install(&mut self, id: FullPageId, idx: usize) {
        debug_assert!(self.slots[idx].id.is_none());
        self.slots[idx].id = Some(id);
        self.slots[idx].reference = true;
        self.page_table.insert(id, idx);
        if self.remove_test_page(&id) {
            self.target_cold = min(self.frames.len(), self.target_cold + 1);
            self.set_state(idx, FrameState::Hot);
        } else {
            if self.target_cold > 1 {
                self.target_cold -= 1;
            }
            self.set_state(idx, FrameState::Cold);
        }
        self.adjust_cold_balance();
    }

    /// Runs the cold hand until it finds an unpinned cold page without a
    /// reference bit. The page stays mapped; [`Self::evict`] unmaps it.
    ///
    /// Returns `None` only when every resident page is pinned.
    pub fn nominate_victim(&mut self) -> Option<usize> {
        let len = self.frames.len();
        // Pinned cold pages cannot be evicted, so they do not count towards
        // the cold target.
        let mut evictable_cold = (0..len)
            .filter(|&idx| self.is_evictable(idx) && self.slots[idx].state == FrameState::Cold)
            .count();
        for _ in 0..len * 4 {
            let idx = self.clock_hand_cold;
            self.clock_hand_cold = (self.clock_hand_cold + 1) % len;
            if !self.is_evictable(idx) {
                continue;
            }
            let slot = &mut self.slots[idx];
            match slot.state {
                FrameState::Cold => {
                    if slot.reference {
                        slot.reference = false;
                        self.set_state(idx, FrameState::Hot);
                        evictable_cold = evictable_cold.saturating_sub(1);
                    } else {
                        return Some(idx);
                    }
                }
                FrameState::Hot => {
                    if slot.reference {
                        slot.reference = false;
                    } else if evictable_cold < self.target_cold {
                        self.set_state(idx, FrameState::Cold);
                        evictable_cold += 1;
                    }
                }
                FrameState::Test => {}
            }
        }
        // Every candidate kept getting referenced; take the first unpinned page.
        let start = self.clock_hand_cold;
        let fallback = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| self.is_evictable(idx))?;
        self.clock_hand_cold = (fallback + 1) % len;
        Some(fallback)
    }

    fn is_evictable(&self, idx: usize) -> bool {
        self.slots[idx].id.is_some() && self.frames[idx].pin_count() == 0
    }

    /// Unmaps the page in `idx`, remembering it as a test page.
    pub fn evict(&mut self, idx: usize) -> Option<FullPageId> {
        let old = self.slots[idx].id.take()?;
        self.page_table.remove(&old);
        self.add_test_page(old);
        self.set_state(idx, FrameState::Test);
        self.slots[idx].reference = false;
        Some(old)
    }

    /// Unmaps a freed page and returns its slot to the free list.
    pub fn release(&mut self, idx: usize) -> Option<FullPageId> {
        let old = self.slots[idx].id.take()?;
        self.page_table.remove(&old);
        self.remove_test_page(&old);
        self.set_state(idx, FrameState::Test);
        self.slots[idx].reference = false;
        self.free_slots.push(idx);
        Some(old)
    }

    fn set_state(&mut self, idx: usize, new_state: FrameState) {
        let slot = &mut self.slots[idx];
        if slot.state == new_state {
            return;
        }
        match slot.state {
            FrameState::Hot => self.hot_count = self.hot_count.saturating_sub(1),
            FrameState::Cold => self.cold_count = self.cold_count.saturating_sub(1),
            FrameState::Test => {}
        }
        match new_state {
            FrameState::Hot => self.hot_count += 1,
            FrameState::Cold => self.cold_count += 1,
            FrameState::Test => {}
        }
        slot.state = new_state;
    }

    fn add_test_page(&mut self, id: FullPageId) {
        if self.test_lookup.insert(id) {
            self.test_pages.push_back(id);
            while self.test_pages.len() > self.frames.len() {
                if let Some(removed) = self.test_pages.pop_front() {
                    self.test_lookup.remove(&removed);
                }
            }
        }
    }

    fn remove_test_page(&mut self, id: &FullPageId) -> bool {
        if self.test_lookup.remove(id) {
            if let Some(pos) = self.test_pages.iter().position(|p| p == id) {
                self.test_pages.remove(pos);
            }
            true
        } else {
            false
        }
    }

    fn adjust_cold_balance(&mut self) {
        while self.cold_count > self.target_cold {
            if !self.promote_cold_to_hot() {
                break;
            }
        }
        while self.cold_count < self.target_cold {
            if !self.demote_hot_to_cold() {
                break;
            }
        }
    }

    fn promote_cold_to_hot(&mut self) -> bool {
        if self.cold_count == 0 {
            return false;
        }
        let len = self.frames.len();
        for _ in 0..len {
            let idx = self.clock_hand_hot;
            self.clock_hand_hot = (self.clock_hand_hot + 1) % len;
            let slot = &self.slots[idx];
            if slot.id.is_some()
                && slot.state == FrameState::Cold
                && self.frames[idx].pin_count() == 0
            {
                self.set_state(idx, FrameState::Hot);
                return true;
            }
        }
        false
    }

    fn demote_hot_to_cold(&mut self) -> bool {
        if self.hot_count == 0 {
            return false;
        }
        let len = self.frames.len();
        for _ in 0..len * 2 {
            let idx = self.clock_hand_hot;
            self.clock_hand_hot = (self.clock_hand_hot + 1) % len;
            if self.slots[idx].id.is_none() || self.frames[idx].pin_count() > 0 {
                continue;
            }
            let slot = &mut self.slots[idx];
            if slot.state != FrameState::Hot {
                continue;
            }
            if slot.reference {
                slot.reference = false;
                continue;
            }
            self.set_state(idx, FrameState::Cold);
            return true;
        }
        false
    }
}
