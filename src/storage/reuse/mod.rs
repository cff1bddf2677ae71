#![forbid(unsafe_code)]

//! Bucketed intrusive free list of reclaimed pages.
//!
//! Each bucket is a LIFO chain threaded through the free pages themselves: a
//! recycled page is rewritten as a `Reuse` page whose payload stores the page
//! number of the next free page in the same bucket. Bucket heads and lengths
//! are mirrored into a `ReuseMeta` page so the chains can be found again after
//! a reopen.
//!
//! Meta page layout after the common header:
//!
//! ```text
//! bucket_count: u32
//! per bucket:   head: u64 (NO_PAGE when empty), len: u64
//! ```

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::primitives::pager::{PageMemory, PageWriteGuard};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{FullPageId, GridError, GroupId, Result};

const NEXT_OFFSET: usize = PAGE_HDR_LEN;
const META_COUNT_OFFSET: usize = PAGE_HDR_LEN;
const META_BUCKETS_OFFSET: usize = META_COUNT_OFFSET + 4;
const META_ENTRY_LEN: usize = 16;

/// Reuse list configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReuseOptions {
    /// Number of independently locked buckets.
    pub buckets: usize,
}

impl Default for ReuseOptions {
    fn default() -> Self {
        Self { buckets: 8 }
    }
}

impl ReuseOptions {
    /// Checks the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(GridError::Invalid("reuse list needs at least one bucket"));
        }
        if self.buckets > u32::MAX as usize {
            return Err(GridError::Invalid("too many reuse buckets"));
        }
        Ok(())
    }

    fn check_fits(&self, page_size: usize) -> Result<()> {
        if META_BUCKETS_OFFSET + self.buckets * META_ENTRY_LEN > page_size {
            return Err(GridError::Invalid("reuse buckets do not fit in a page"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Bucket {
    head: Option<u64>,
    len: usize,
}

/// Free pages of one group, kept for reuse instead of growing the group.
pub struct ReuseList {
    memory: Arc<PageMemory>,
    group: GroupId,
    meta: FullPageId,
    buckets: Vec<Mutex<Bucket>>,
    len: AtomicUsize,
}

thread_local! {
    static STRIPE: Cell<Option<usize>> = const { Cell::new(None) };
}

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

fn thread_stripe() -> usize {
    STRIPE.with(|stripe| match stripe.get() {
        Some(idx) => idx,
        None => {
            let idx = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed);
            stripe.set(Some(idx));
            idx
        }
    })
}

fn entry_offset(bucket_idx: usize) -> usize {
    META_BUCKETS_OFFSET + bucket_idx * META_ENTRY_LEN
}

fn write_entry(data: &mut [u8], bucket_idx: usize, bucket: &Bucket) {
    let off = entry_offset(bucket_idx);
    data[off..off + 8].copy_from_slice(&page::encode_page_no(bucket.head).to_be_bytes());
    data[off + 8..off + 16].copy_from_slice(&(bucket.len as u64).to_be_bytes());
}

impl ReuseList {
    /// Creates an empty list for pages of `group`, allocating its meta page
    /// in the same group.
    pub fn create(memory: Arc<PageMemory>, group: GroupId, options: ReuseOptions) -> Result<Self> {
        options.validate()?;
        options.check_fits(memory.page_size())?;
        let meta = memory.allocate_page(group)?;
        let buckets: Vec<Mutex<Bucket>> = (0..options.buckets).map(|_| Mutex::default()).collect();
        {
            let _cp = memory.checkpoint_lock().read();
            let mut guard = memory.acquire_page(meta)?.into_write()?;
            let data = guard.data_mut();
            data.fill(0);
            PageHeader::new(meta, PageKind::ReuseMeta).encode(data)?;
            data[META_COUNT_OFFSET..META_BUCKETS_OFFSET]
                .copy_from_slice(&(options.buckets as u32).to_be_bytes());
            for (idx, bucket) in buckets.iter().enumerate() {
                write_entry(data, idx, &bucket.lock());
            }
        }
        debug!(meta = %meta, buckets = options.buckets, "reuse.create");
        Ok(Self {
            memory,
            group,
            meta,
            buckets,
            len: AtomicUsize::new(0),
        })
    }

    /// Reopens the list whose bucket table lives in `meta`.
    pub fn open(memory: Arc<PageMemory>, meta: FullPageId, options: ReuseOptions) -> Result<Self> {
        options.validate()?;
        let handle = memory.acquire_page(meta)?;
        let data = handle.read();
        if page::kind_of(&data)? != PageKind::ReuseMeta {
            return Err(GridError::Corruption("reuse meta page has the wrong kind"));
        }
        let count = page::read_u32(&data, META_COUNT_OFFSET) as usize;
        if count != options.buckets {
            return Err(GridError::Invalid("reuse bucket count differs from the stored list"));
        }
        options.check_fits(data.len())?;
        let mut total = 0;
        let buckets = (0..count)
            .map(|idx| {
                let off = entry_offset(idx);
                let len = page::read_u64(&data, off + 8) as usize;
                total += len;
                Mutex::new(Bucket {
                    head: page::decode_page_no(page::read_u64(&data, off)),
                    len,
                })
            })
            .collect();
        drop(data);
        debug!(meta = %meta, free = total, "reuse.open");
        Ok(Self {
            memory,
            group: meta.group,
            meta,
            buckets,
            len: AtomicUsize::new(total),
        })
    }

    /// Page holding the bucket table.
    pub fn meta_page(&self) -> FullPageId {
        self.meta
    }

    /// Group the list serves.
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Number of pages waiting for reuse.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true when no page is waiting for reuse.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands a page back for reuse. The page must be unreferenced by any
    /// structure; adding a page twice is rejected.
    pub fn add_for_recycle(&self, id: FullPageId) -> Result<()> {
        let _cp = self.memory.checkpoint_lock().read();
        let guard = self.memory.acquire_page(id)?.into_write()?;
        self.recycle(guard)
    }

    /// Same as [`Self::add_for_recycle`] for a page the caller already latched.
    pub fn recycle(&self, mut guard: PageWriteGuard) -> Result<()> {
        let id = guard.id();
        if id.group != self.group {
            return Err(GridError::Invalid("page belongs to another group"));
        }
        if id == self.meta {
            return Err(GridError::Invalid("the reuse meta page cannot be recycled"));
        }
        if page::kind_of(guard.data())? == PageKind::Reuse {
            return Err(GridError::Invalid("page is already in the reuse list"));
        }
        let bucket_idx = (id.page_no % self.buckets.len() as u64) as usize;
        let mut bucket = self.buckets[bucket_idx].lock();
        let mut meta = self.latch_meta()?;
        let data = guard.data_mut();
        data.fill(0);
        PageHeader::new(id, PageKind::Reuse).encode(data)?;
        let next = page::encode_page_no(bucket.head);
        data[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&next.to_be_bytes());
        bucket.head = Some(id.page_no);
        bucket.len += 1;
        write_entry(meta.data_mut(), bucket_idx, &bucket);
        self.len.fetch_add(1, Ordering::AcqRel);
        trace!(page = %id, bucket = bucket_idx, "reuse.push");
        Ok(())
    }

    /// Pops a reclaimed page, reset to `Unused`, or `None` when every bucket is
    /// empty and the caller should allocate instead.
    pub fn take_recycled_page(&self) -> Result<Option<FullPageId>> {
        let _cp = self.memory.checkpoint_lock().read();
        let count = self.buckets.len();
        let start = thread_stripe() % count;
        for offset in 0..count {
            let bucket_idx = (start + offset) % count;
            let mut bucket = self.buckets[bucket_idx].lock();
            let Some(head) = bucket.head else {
                continue;
            };
            let id = FullPageId::new(self.group, head);
            let mut guard = self.memory.acquire_page(id)?.into_write()?;
            if page::kind_of(guard.data())? != PageKind::Reuse {
                return Err(GridError::Corruption("reuse chain points at a live page"));
            }
            let mut meta = self.latch_meta()?;
            let next = page::read_u64(guard.data(), NEXT_OFFSET);
            guard.data_mut().fill(0);
            bucket.head = page::decode_page_no(next);
            bucket.len -= 1;
            write_entry(meta.data_mut(), bucket_idx, &bucket);
            self.len.fetch_sub(1, Ordering::AcqRel);
            trace!(page = %id, bucket = bucket_idx, "reuse.pop");
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Pops a reclaimed page or allocates a fresh one.
    pub fn take_or_allocate(&self) -> Result<FullPageId> {
        match self.take_recycled_page()? {
            Some(id) => Ok(id),
            None => self.memory.allocate_page(self.group),
        }
    }

    /// Per-bucket chain lengths.
    pub fn bucket_lengths(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.lock().len).collect()
    }

    // Taken last, under a bucket lock and after the chain page it updates.
    fn latch_meta(&self) -> Result<PageWriteGuard> {
        self.memory.acquire_page(self.meta)?.into_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::concurrency::CheckpointLock;
    use crate::primitives::pager::{MemoryPageStore, PageMemoryOptions};
    use proptest::prelude::*;
    use std::collections::HashSet;

    const GROUP: GroupId = GroupId(3);

    fn setup(buckets: usize) -> (Arc<PageMemory>, ReuseList) {
        let opts = PageMemoryOptions {
            page_size: 512,
            segments: 2,
            pages_per_segment: 64,
            verify_checksums: true,
        };
        let memory = Arc::new(
            PageMemory::new(
                opts,
                Arc::new(MemoryPageStore::new()),
                Arc::new(CheckpointLock::new()),
            )
            .unwrap(),
        );
        memory.start().unwrap();
        let list = ReuseList::create(Arc::clone(&memory), GROUP, ReuseOptions { buckets }).unwrap();
        (memory, list)
    }

    fn memory_over(store: Arc<MemoryPageStore>) -> Arc<PageMemory> {
        let opts = PageMemoryOptions {
            page_size: 512,
            segments: 2,
            pages_per_segment: 16,
            verify_checksums: true,
        };
        let memory =
            Arc::new(PageMemory::new(opts, store, Arc::new(CheckpointLock::new())).unwrap());
        memory.start().unwrap();
        memory
    }

    #[test]
    fn pops_are_lifo_within_a_bucket() -> Result<()> {
        let (memory, list) = setup(1);
        let ids: Vec<_> = (0..4)
            .map(|_| memory.allocate_page(GROUP))
            .collect::<Result<_>>()?;
        for id in &ids {
            list.add_for_recycle(*id)?;
        }
        assert_eq!(list.len(), 4);
        for id in ids.iter().rev() {
            assert_eq!(list.take_recycled_page()?, Some(*id));
        }
        assert_eq!(list.take_recycled_page()?, None);
        assert!(list.is_empty());
        Ok(())
    }

    #[test]
    fn popped_pages_are_unused() -> Result<()> {
        let (memory, list) = setup(2);
        let id = memory.allocate_page(GROUP)?;
        list.add_for_recycle(id)?;
        let popped = list.take_recycled_page()?.unwrap();
        let handle = memory.acquire_page(popped)?;
        assert_eq!(page::kind_of(&handle.read())?, PageKind::Unused);
        Ok(())
    }

    #[test]
    fn double_recycle_is_rejected() -> Result<()> {
        let (memory, list) = setup(2);
        let id = memory.allocate_page(GROUP)?;
        list.add_for_recycle(id)?;
        assert!(matches!(list.add_for_recycle(id), Err(GridError::Invalid(_))));
        assert_eq!(list.len(), 1);
        let foreign = memory.allocate_page(GroupId(99))?;
        assert!(matches!(list.add_for_recycle(foreign), Err(GridError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn take_or_allocate_falls_back() -> Result<()> {
        let (memory, list) = setup(4);
        assert_eq!(list.meta_page().page_no, 0);
        let fresh = list.take_or_allocate()?;
        assert_eq!(fresh.page_no, 1);
        list.add_for_recycle(fresh)?;
        assert_eq!(list.take_or_allocate()?, fresh);
        assert_eq!(memory.stats().allocations, 2);
        Ok(())
    }

    #[test]
    fn meta_page_is_not_recyclable() {
        let (_memory, list) = setup(2);
        assert!(matches!(
            list.add_for_recycle(list.meta_page()),
            Err(GridError::Invalid(_))
        ));
        assert!(list.is_empty());
    }

    #[test]
    fn chains_survive_checkpoint_and_reopen() -> Result<()> {
        let store = Arc::new(MemoryPageStore::new());
        let (meta, pushed) = {
            let memory = memory_over(store.clone());
            let list = ReuseList::create(memory.clone(), GROUP, ReuseOptions { buckets: 3 })?;
            let ids: Vec<_> = (0..7)
                .map(|_| memory.allocate_page(GROUP))
                .collect::<Result<_>>()?;
            for id in &ids {
                list.add_for_recycle(*id)?;
            }
            assert_eq!(list.take_recycled_page()?.map(|id| id.group), Some(GROUP));
            memory.checkpoint()?;
            memory.stop()?;
            (list.meta_page(), list.len())
        };
        assert_eq!(pushed, 6);

        let memory = memory_over(store);
        let list = ReuseList::open(memory.clone(), meta, ReuseOptions { buckets: 3 })?;
        assert_eq!(list.len(), 6);
        assert_eq!(list.bucket_lengths().iter().sum::<usize>(), 6);
        let mut seen = HashSet::new();
        while let Some(id) = list.take_recycled_page()? {
            assert!(seen.insert(id));
            let handle = memory.acquire_page(id)?;
            assert_eq!(page::kind_of(&handle.read())?, PageKind::Unused);
        }
        assert_eq!(seen.len(), 6);
        assert!(!seen.contains(&meta));
        Ok(())
    }

    #[test]
    fn open_rejects_a_different_bucket_count() -> Result<()> {
        let store = Arc::new(MemoryPageStore::new());
        let memory = memory_over(store);
        let list = ReuseList::create(memory.clone(), GROUP, ReuseOptions { buckets: 4 })?;
        let reopened = ReuseList::open(memory, list.meta_page(), ReuseOptions { buckets: 2 });
        assert!(matches!(reopened, Err(GridError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn too_many_buckets_for_the_page() {
        let store = Arc::new(MemoryPageStore::new());
        let memory = memory_over(store);
        let created = ReuseList::create(memory, GROUP, ReuseOptions { buckets: 64 });
        assert!(matches!(created, Err(GridError::Invalid(_))));
    }

    #[test]
    fn concurrent_push_pop_keeps_pages_unique() -> Result<()> {
        let (memory, list) = setup(4);
        let list = Arc::new(list);
        let ids: Vec<_> = (0..64)
            .map(|_| memory.allocate_page(GROUP))
            .collect::<Result<_>>()?;
        for id in &ids {
            list.add_for_recycle(*id)?;
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || -> Result<Vec<FullPageId>> {
                    let mut taken = Vec::new();
                    while let Some(id) = list.take_recycled_page()? {
                        taken.push(id);
                    }
                    Ok(taken)
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap()? {
                assert!(seen.insert(id), "page {id} popped twice");
            }
        }
        assert_eq!(seen.len(), ids.len());
        assert_eq!(list.bucket_lengths(), vec![0; 4]);
        Ok(())
    }

    #[derive(Clone, Debug)]
    enum Op {
        Push,
        Pop,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Push), Just(Op::Pop)]
    }

    proptest! {
        #[test]
        fn pops_only_return_pushed_pages(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let (memory, list) = setup(3);
            let mut free: HashSet<FullPageId> = HashSet::new();
            let mut live: Vec<FullPageId> = Vec::new();
            for op in ops {
                match op {
                    Op::Push => {
                        let id = match live.pop() {
                            Some(id) => id,
                            None => memory.allocate_page(GROUP).unwrap(),
                        };
                        list.add_for_recycle(id).unwrap();
                        prop_assert!(free.insert(id));
                    }
                    Op::Pop => match list.take_recycled_page().unwrap() {
                        Some(id) => {
                            prop_assert!(free.remove(&id));
                            live.push(id);
                        }
                        None => prop_assert!(free.is_empty()),
                    },
                }
                prop_assert_eq!(list.len(), free.len());
            }
        }
    }
}
