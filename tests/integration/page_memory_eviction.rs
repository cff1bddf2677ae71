#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use pagegrid::primitives::concurrency::CheckpointLock;
use pagegrid::primitives::pager::{MemoryPageStore, PageMemory, PageMemoryOptions};
use pagegrid::storage::reuse::{ReuseList, ReuseOptions};
use pagegrid::types::page::{kind_of, PageHeader, PageKind, PAGE_HDR_LEN};
use pagegrid::{ErrorKind, FullPageId, GroupId, Result};

const GROUP: GroupId = GroupId(11);
const SEED: u64 = 0x5eed_cafe;

fn options(segments: usize, pages_per_segment: usize) -> PageMemoryOptions {
    PageMemoryOptions {
        page_size: 512,
        segments,
        pages_per_segment,
        verify_checksums: true,
    }
}

fn stamp(memory: &PageMemory, id: FullPageId) -> Result<()> {
    let _cp = memory.checkpoint_lock().read();
    let mut guard = memory.acquire_page(id)?.into_write()?;
    PageHeader::new(id, PageKind::Data).encode(guard.data_mut())?;
    guard.data_mut()[PAGE_HDR_LEN..PAGE_HDR_LEN + 8].copy_from_slice(&id.page_no.to_le_bytes());
    Ok(())
}

fn stamped_no(memory: &PageMemory, id: FullPageId) -> Result<u64> {
    let handle = memory.acquire_page(id)?;
    let data = handle.read();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[PAGE_HDR_LEN..PAGE_HDR_LEN + 8]);
    Ok(u64::from_le_bytes(raw))
}

#[test]
fn fully_pinned_segment_fails_fast() -> Result<()> {
    let memory = PageMemory::new(
        options(1, 4),
        Arc::new(MemoryPageStore::new()),
        Arc::new(CheckpointLock::new()),
    )?;
    memory.start()?;
    let mut pins = Vec::new();
    for _ in 0..4 {
        let id = memory.allocate_page(GROUP)?;
        pins.push(memory.acquire_page(id)?);
    }
    assert_eq!(memory.acquired_pages(), 4);

    let started = Instant::now();
    let err = memory.allocate_page(GROUP).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(started.elapsed() < Duration::from_secs(1));

    pins.pop();
    memory.allocate_page(GROUP)?;
    assert_eq!(memory.stats().evictions, 1);
    Ok(())
}

#[test]
fn concurrent_readers_fault_pages_back_in() -> Result<()> {
    let evicted = Arc::new(AtomicU64::new(0));
    let store = Arc::new(MemoryPageStore::new());
    let counter = evicted.clone();
    let memory = PageMemory::new(options(4, 8), store.clone(), Arc::new(CheckpointLock::new()))?
        .with_observer(Arc::new(move |_slot: u64, id: FullPageId, _: &PageMemory| {
            assert_eq!(id.group, GROUP);
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    memory.start()?;
    let memory = Arc::new(memory);

    let mut ids = Vec::new();
    for _ in 0..96 {
        let id = memory.allocate_page(GROUP)?;
        stamp(&memory, id)?;
        ids.push(id);
    }
    assert!(memory.loaded_pages() <= memory.capacity());

    let ids = Arc::new(ids);
    let workers: Vec<_> = (0..4u64)
        .map(|t| {
            let memory = memory.clone();
            let ids = ids.clone();
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED + t);
                for _ in 0..2_000 {
                    let id = ids[rng.gen_range(0..ids.len())];
                    assert_eq!(stamped_no(&memory, id)?, id.page_no);
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("reader thread")?;
    }

    let stats = memory.stats();
    assert!(stats.misses > 0);
    assert!(stats.evictions > 0);
    assert_eq!(evicted.load(Ordering::Relaxed), stats.evictions);
    assert!(store.reads() > 0);
    assert_eq!(memory.acquired_pages(), 0);
    Ok(())
}

#[test]
fn reuse_list_never_hands_out_live_pages() -> Result<()> {
    let memory = Arc::new(PageMemory::new(
        options(2, 64),
        Arc::new(MemoryPageStore::new()),
        Arc::new(CheckpointLock::new()),
    )?);
    memory.start()?;
    let reuse = ReuseList::create(memory.clone(), GROUP, ReuseOptions { buckets: 3 })?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut live: Vec<FullPageId> = Vec::new();
    let mut free: HashSet<FullPageId> = HashSet::new();

    for _ in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let id = reuse.take_or_allocate()?;
            assert!(!live.contains(&id), "page {id} handed out twice");
            if !free.remove(&id) {
                assert!(id.page_no >= live.len() as u64 + free.len() as u64);
            }
            {
                let handle = memory.acquire_page(id)?;
                assert_eq!(kind_of(&handle.read())?, PageKind::Unused);
            }
            stamp(&memory, id)?;
            live.push(id);
        } else {
            let id = live.swap_remove(rng.gen_range(0..live.len()));
            reuse.add_for_recycle(id)?;
            assert!(free.insert(id));
        }
        assert_eq!(reuse.len(), free.len());
    }

    let unique: HashSet<FullPageId> = live.iter().copied().collect();
    assert_eq!(unique.len(), live.len());
    assert!(unique.is_disjoint(&free));
    Ok(())
}
