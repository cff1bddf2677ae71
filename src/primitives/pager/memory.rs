use std::collections::hash_map::Entry;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use super::frame::Frame;
use super::handle::{HandleShared, PageHandle};
use super::options::PageMemoryOptions;
use super::segment::{Segment, SegmentInner};
use super::store::PageStore;
use crate::primitives::concurrency::{CheckpointLock, CheckpointLockStateChecker};
use crate::types::checksum::{seal_page, verify_page};
use crate::types::{page, FullPageId, GridError, GroupId, Result};

/// Callback invoked after a page left memory.
///
/// Runs outside the segment lock, so it may call back into page memory.
pub trait EvictionObserver: Send + Sync {
    /// `slot` is the arena slot the page occupied.
    fn on_page_evicted(&self, slot: u64, id: FullPageId, memory: &PageMemory);
}

impl<F> EvictionObserver for F
where
    F: Fn(u64, FullPageId, &PageMemory) + Send + Sync,
{
    fn on_page_evicted(&self, slot: u64, id: FullPageId, memory: &PageMemory) {
        self(slot, id, memory)
    }
}

/// Point-in-time page memory counters.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct PageMemoryStats {
    /// Acquisitions served from memory.
    pub hits: u64,
    /// Acquisitions that loaded the page from the store.
    pub misses: u64,
    /// Pages allocated.
    pub allocations: u64,
    /// Pages freed.
    pub frees: u64,
    /// Pages evicted to make room.
    pub evictions: u64,
    /// Dirty pages written to the store.
    pub dirty_writebacks: u64,
    /// Write-backs that failed during eviction.
    pub writeback_failures: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Pages currently resident.
    pub loaded_pages: u64,
    /// Pages currently pinned.
    pub acquired_pages: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    evictions: AtomicU64,
    dirty_writebacks: AtomicU64,
    writeback_failures: AtomicU64,
    checkpoints: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type Evicted = SmallVec<[(usize, FullPageId); 2]>;

/// Segmented, fixed-capacity cache of fixed-size pages over a [`PageStore`].
///
/// Pages are addressed by [`FullPageId`] and hashed onto segments; each segment
/// has its own lock, slot arena and CLOCK-Pro replacement state. Pinned pages
/// are never evicted. Dirty victims are written to the store before their slot
/// is reused, under the shared checkpoint lock.
pub struct PageMemory {
    options: PageMemoryOptions,
    store: Arc<dyn PageStore>,
    checkpoint: Arc<CheckpointLock>,
    observer: Option<Arc<dyn EvictionObserver>>,
    shared: Arc<HandleShared>,
    segments: RwLock<Vec<Segment>>,
    next_page: Mutex<FxHashMap<GroupId, u64>>,
    // Versions of zeroed pages that left memory; a zeroed image has no header
    // to carry them.
    blank_versions: Mutex<FxHashMap<FullPageId, u64>>,
    counters: Counters,
}

impl PageMemory {
    /// Creates a stopped page memory; call [`PageMemory::start`] before use.
    ///
    /// Mutations are checked against `checkpoint` unless another checker is
    /// installed with [`PageMemory::with_checker`].
    pub fn new(
        options: PageMemoryOptions,
        store: Arc<dyn PageStore>,
        checkpoint: Arc<CheckpointLock>,
    ) -> Result<Self> {
        options.validate()?;
        let checker: Arc<dyn CheckpointLockStateChecker> = checkpoint.clone();
        Ok(Self {
            options,
            store,
            checkpoint,
            observer: None,
            shared: Arc::new(HandleShared {
                acquired: AtomicU64::new(0),
                checker,
            }),
            segments: RwLock::new(Vec::new()),
            next_page: Mutex::new(FxHashMap::default()),
            blank_versions: Mutex::new(FxHashMap::default()),
            counters: Counters::default(),
        })
    }

    /// Installs an eviction observer.
    pub fn with_observer(mut self, observer: Arc<dyn EvictionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the checker consulted before a page latch is taken for writing.
    pub fn with_checker(mut self, checker: Arc<dyn CheckpointLockStateChecker>) -> Self {
        self.shared = Arc::new(HandleShared {
            acquired: AtomicU64::new(0),
            checker,
        });
        self
    }

    /// Allocates the segment arenas. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut segments = self.segments.write();
        if !segments.is_empty() {
            return Ok(());
        }
        let page_size = self.options.page_size as usize;
        segments.extend(
            (0..self.options.segments)
                .map(|idx| Segment::new(idx, self.options.pages_per_segment, page_size)),
        );
        info!(
            segments = self.options.segments,
            pages_per_segment = self.options.pages_per_segment,
            page_size,
            "pager.start"
        );
        Ok(())
    }

    /// Releases the segment arenas. Resident dirty pages are dropped, so run a
    /// checkpoint first to keep them. A no-op when not started.
    pub fn stop(&self) -> Result<()> {
        let mut segments = self.segments.write();
        if segments.is_empty() {
            return Ok(());
        }
        let pinned = self.acquired_pages();
        if pinned > 0 {
            warn!(pinned, "pager.stop.pinned_pages");
        }
        segments.clear();
        info!("pager.stop");
        Ok(())
    }

    /// Returns true between [`Self::start`] and [`Self::stop`].
    pub fn is_started(&self) -> bool {
        !self.segments.read().is_empty()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Options the memory was built with.
    pub fn options(&self) -> &PageMemoryOptions {
        &self.options
    }

    /// The checkpoint lock guarding mutations and evictions.
    pub fn checkpoint_lock(&self) -> &Arc<CheckpointLock> {
        &self.checkpoint
    }

    /// Pins a page, loading it from the store when not resident.
    pub fn acquire_page(&self, id: FullPageId) -> Result<PageHandle> {
        let segments = self.started_segments()?;
        let segment = &segments[self.segment_of(id, segments.len())];
        {
            let mut inner = segment.inner.lock();
            if let Some(idx) = inner.lookup(id) {
                Counters::inc(&self.counters.hits);
                return Ok(self.pin(&inner.frames[idx], id));
            }
        }
        // Faulting in may evict; evictions run under the shared checkpoint lock,
        // which has to come before the segment lock.
        let _cp = self.checkpoint.read();
        let mut evicted = Evicted::new();
        let handle = {
            let mut inner = segment.inner.lock();
            if let Some(idx) = inner.lookup(id) {
                Counters::inc(&self.counters.hits);
                self.pin(&inner.frames[idx], id)
            } else {
                Counters::inc(&self.counters.misses);
                if id.page_no >= self.next_page_no(id.group)? {
                    return Err(GridError::PageNotFound(id));
                }
                let idx = self.obtain_slot(segment.index, &mut inner, &mut evicted)?;
                let frame = Arc::clone(&inner.frames[idx]);
                if let Err(err) = self.load(id, &frame) {
                    inner.return_free_slot(idx);
                    drop(inner);
                    self.notify(&evicted);
                    return Err(err);
                }
                inner.install(id, idx);
                trace!(page = %id, slot = idx, "pager.fault_in");
                self.pin(&frame, id)
            }
        };
        self.notify(&evicted);
        Ok(handle)
    }

    /// Allocates a zeroed page in `group`. The page is resident and dirty but
    /// not pinned.
    pub fn allocate_page(&self, group: GroupId) -> Result<FullPageId> {
        let _cp = self.checkpoint.read();
        let segments = self.started_segments()?;
        let id = FullPageId::new(group, self.reserve_page_no(group)?);
        let segment = &segments[self.segment_of(id, segments.len())];
        let mut evicted = Evicted::new();
        {
            let mut inner = segment.inner.lock();
            let idx = self.obtain_slot(segment.index, &mut inner, &mut evicted)?;
            let frame = &inner.frames[idx];
            frame.buf.write().fill(0);
            frame.set_version(0);
            frame.set_dirty(true);
            inner.install(id, idx);
        }
        self.notify(&evicted);
        Counters::inc(&self.counters.allocations);
        trace!(page = %id, "pager.allocate");
        Ok(id)
    }

    /// Drops a page from memory and from the store. Fails for pinned pages.
    pub fn free_page(&self, id: FullPageId) -> Result<()> {
        let _cp = self.checkpoint.read();
        let segments = self.started_segments()?;
        let segment = &segments[self.segment_of(id, segments.len())];
        {
            let mut inner = segment.inner.lock();
            if let Some(idx) = inner.lookup(id) {
                let frame = Arc::clone(&inner.frames[idx]);
                if frame.pin_count() > 0 {
                    return Err(GridError::Invalid("cannot free a pinned page"));
                }
                inner.release(idx);
                frame.set_dirty(false);
                frame.bump_version();
            }
        }
        self.blank_versions.lock().remove(&id);
        self.store.discard(id)?;
        Counters::inc(&self.counters.frees);
        trace!(page = %id, "pager.free");
        Ok(())
    }

    /// Writes every dirty resident page to the store under the exclusive
    /// checkpoint lock. Returns the number of pages written.
    pub fn checkpoint(&self) -> Result<usize> {
        let _cp = self.checkpoint.write()?;
        let segments = self.started_segments()?;
        let mut written = 0usize;
        for segment in segments.iter() {
            let inner = segment.inner.lock();
            let dirty: SmallVec<[(FullPageId, usize); 16]> = inner
                .resident_slots()
                .filter(|(_, idx)| inner.frames[*idx].is_dirty())
                .collect();
            for (id, idx) in dirty {
                self.write_back(id, &inner.frames[idx])?;
                written += 1;
            }
        }
        self.store.sync()?;
        Counters::inc(&self.counters.checkpoints);
        debug!(pages = written, "pager.checkpoint");
        Ok(written)
    }

    /// Number of pages currently pinned by at least one handle.
    pub fn acquired_pages(&self) -> u64 {
        self.shared.acquired.load(Ordering::Relaxed)
    }

    /// Number of resident pages.
    pub fn loaded_pages(&self) -> usize {
        self.segments
            .read()
            .iter()
            .map(|segment| segment.inner.lock().resident())
            .sum()
    }

    /// Total slot capacity across segments.
    pub fn capacity(&self) -> usize {
        self.options.total_pages()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> PageMemoryStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PageMemoryStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            allocations: load(&self.counters.allocations),
            frees: load(&self.counters.frees),
            evictions: load(&self.counters.evictions),
            dirty_writebacks: load(&self.counters.dirty_writebacks),
            writeback_failures: load(&self.counters.writeback_failures),
            checkpoints: load(&self.counters.checkpoints),
            loaded_pages: self.loaded_pages() as u64,
            acquired_pages: self.acquired_pages(),
        }
    }

    /// Emits the counters as a tracing event.
    pub fn emit_tracing(&self) {
        let stats = self.stats();
        info!(
            target: "pagegrid::pager::stats",
            hits = stats.hits,
            misses = stats.misses,
            allocations = stats.allocations,
            evictions = stats.evictions,
            dirty_writebacks = stats.dirty_writebacks,
            writeback_failures = stats.writeback_failures,
            loaded_pages = stats.loaded_pages,
            acquired_pages = stats.acquired_pages,
            "pager stats snapshot"
        );
    }

    fn started_segments(&self) -> Result<parking_lot::RwLockReadGuard<'_, Vec<Segment>>> {
        // Recursive so a queued stop() cannot wedge a checkpoint behind a reader.
        let segments = self.segments.read_recursive();
        if segments.is_empty() {
            return Err(GridError::Invalid("page memory is not started"));
        }
        Ok(segments)
    }

    fn segment_of(&self, id: FullPageId, segments: usize) -> usize {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        (hasher.finish() % segments as u64) as usize
    }

    fn pin(&self, frame: &Arc<Frame>, id: FullPageId) -> PageHandle {
        let first = frame.pin() == 0;
        PageHandle::from_pinned(id, Arc::clone(frame), Arc::clone(&self.shared), first)
    }

    fn next_page_no(&self, group: GroupId) -> Result<u64> {
        let mut next = self.next_page.lock();
        if let Some(n) = next.get(&group) {
            return Ok(*n);
        }
        let n = self.store.next_page_no(group)?;
        next.insert(group, n);
        Ok(n)
    }

    fn reserve_page_no(&self, group: GroupId) -> Result<u64> {
        let mut next = self.next_page.lock();
        let slot = match next.entry(group) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.store.next_page_no(group)?),
        };
        let page_no = *slot;
        if page_no >= page::NO_PAGE {
            return Err(GridError::OutOfMemory("page number space exhausted"));
        }
        *slot += 1;
        Ok(page_no)
    }

    /// Finds an empty slot, evicting an unpinned page when the segment is full.
    fn obtain_slot(
        &self,
        segment: usize,
        inner: &mut SegmentInner,
        evicted: &mut Evicted,
    ) -> Result<usize> {
        if let Some(idx) = inner.take_free_slot() {
            return Ok(idx);
        }
        let victim = inner
            .nominate_victim()
            .ok_or(GridError::OutOfMemory("no evictable page in segment"))?;
        let id = inner
            .slot_id(victim)
            .ok_or(GridError::Corruption("eviction victim has no page"))?;
        let frame = Arc::clone(&inner.frames[victim]);
        if frame.is_dirty() {
            if let Err(err) = self.write_back(id, &frame) {
                Counters::inc(&self.counters.writeback_failures);
                warn!(segment, page = %id, error = %err, "pager.evict.writeback_failed");
                return Err(GridError::OutOfMemory("failed to write back eviction victim"));
            }
        }
        inner.evict(victim);
        Counters::inc(&self.counters.evictions);
        debug!(segment, page = %id, slot = victim, "pager.evict");
        evicted.push((victim, id));
        Ok(victim)
    }

    fn write_back(&self, id: FullPageId, frame: &Frame) -> Result<()> {
        let mut image = frame.buf.read().to_vec();
        let version = frame.version();
        let initialized = page::is_initialized(&image);
        if initialized {
            page::stamp_version(&mut image, version);
            seal_page(id, &mut image)?;
        }
        self.store.write_back(id, &image, version as u32)?;
        let mut blank = self.blank_versions.lock();
        if initialized {
            blank.remove(&id);
        } else {
            blank.insert(id, version);
        }
        drop(blank);
        frame.set_dirty(false);
        Counters::inc(&self.counters.dirty_writebacks);
        Ok(())
    }

    fn load(&self, id: FullPageId, frame: &Frame) -> Result<()> {
        let mut buf = frame.buf.write();
        buf.fill(0);
        if !self.store.read_page(id, &mut buf)? {
            return Err(GridError::PageNotFound(id));
        }
        if self.options.verify_checksums {
            verify_page(id, &buf)?;
        }
        let version = if page::is_initialized(&buf) {
            page::PageHeader::decode(&buf)?.version
        } else {
            self.blank_versions.lock().get(&id).copied().unwrap_or(0)
        };
        frame.set_version(version);
        frame.set_dirty(false);
        Ok(())
    }

    fn notify(&self, evicted: &Evicted) {
        let Some(observer) = self.observer.as_ref() else {
            return;
        };
        for (slot, id) in evicted {
            observer.on_page_evicted(*slot as u64, *id, self);
        }
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "pager.drop.stop_failed");
        }
    }
}
