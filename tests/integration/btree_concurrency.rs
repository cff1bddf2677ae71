#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Barrier};
use std::thread;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use pagegrid::primitives::concurrency::CheckpointLock;
use pagegrid::primitives::pager::{MemoryPageStore, PageMemory, PageMemoryOptions};
use pagegrid::storage::btree::{BPlusTree, BTreeOptions};
use pagegrid::storage::cursor::CursorRegistry;
use pagegrid::storage::reuse::{ReuseList, ReuseOptions};
use pagegrid::{GroupId, Result};

const NUM_THREADS: u64 = 6;
const OPERATIONS_PER_THREAD: u64 = 1_500;
const SEED: u64 = 0x00c0_ffee;

fn tree(pages_per_segment: usize, max_items: usize) -> Result<Arc<BPlusTree<u64, u64>>> {
    let memory = Arc::new(PageMemory::new(
        PageMemoryOptions {
            page_size: 1024,
            segments: 8,
            pages_per_segment,
            verify_checksums: true,
        },
        Arc::new(MemoryPageStore::new()),
        Arc::new(CheckpointLock::new()),
    )?);
    memory.start()?;
    let reuse = Arc::new(ReuseList::create(memory.clone(), GroupId(2), ReuseOptions::default())?);
    let options = BTreeOptions {
        max_items,
        max_key_len: 8,
        max_value_len: 8,
        ..BTreeOptions::default()
    };
    Ok(Arc::new(BPlusTree::create(memory, reuse, options)?))
}

#[test]
fn put_is_visible_to_later_get_on_every_thread() -> Result<()> {
    let tree = tree(256, 6)?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let tree = tree.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<BTreeMap<u64, u64>> {
                barrier.wait();
                let mut rng = ChaCha8Rng::seed_from_u64(SEED + t);
                let mut mine = BTreeMap::new();
                for _ in 0..OPERATIONS_PER_THREAD {
                    // Keys are partitioned by thread so each thread owns its expectations.
                    let key = rng.gen_range(0..400u64) * NUM_THREADS + t;
                    if rng.gen_bool(0.3) {
                        assert_eq!(tree.remove(&key)?, mine.remove(&key));
                    } else {
                        let value = rng.gen::<u64>();
                        assert_eq!(tree.put(&key, &value)?, mine.insert(key, value));
                        assert_eq!(tree.get(&key)?, Some(value));
                    }
                }
                Ok(mine)
            })
        })
        .collect();

    let mut expected = BTreeMap::new();
    for handle in handles {
        expected.extend(handle.join().expect("worker thread")?);
    }

    let shape = tree.verify()?;
    assert_eq!(shape.entries, expected.len() as u64);
    let actual: BTreeMap<u64, u64> = tree.iter().collect::<Result<_>>()?;
    assert_eq!(actual, expected);
    Ok(())
}

#[test]
fn scans_stay_ordered_while_writers_split_and_merge() -> Result<()> {
    let tree = tree(256, 4)?;
    for key in 0u64..2_000 {
        tree.put(&(key * 2), &key)?;
    }

    let writers: Vec<_> = (0..3u64)
        .map(|t| {
            let tree = tree.clone();
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ t);
                for _ in 0..3_000 {
                    let key = rng.gen_range(0..4_000u64);
                    if key % 2 == 0 {
                        tree.remove(&key)?;
                        tree.put(&key, &key)?;
                    } else if rng.gen_bool(0.5) {
                        tree.put(&key, &key)?;
                    } else {
                        tree.remove(&key)?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    let registry = CursorRegistry::new(tree.clone());
    for round in 0..10u64 {
        let from = round * 300;
        let mut page = registry.open(Bound::Included(&from), Bound::Excluded(&(from + 900)), 32)?;
        let mut keys: Vec<u64> = page.items.iter().map(|(k, _)| *k).collect();
        while !page.last {
            page = registry.fetch(page.handle, 32)?;
            keys.extend(page.items.iter().map(|(k, _)| *k));
        }
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(keys.iter().all(|k| (from..from + 900).contains(k)));

        let full: Vec<u64> = tree
            .iter()
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_>>()?;
        assert!(full.windows(2).all(|pair| pair[0] < pair[1]));
    }

    for writer in writers {
        writer.join().expect("writer thread")?;
    }
    assert!(registry.is_empty());

    tree.verify()?;
    for key in (0u64..4_000).step_by(2) {
        assert_eq!(tree.get(&key)?, Some(key));
    }
    Ok(())
}

#[test]
fn readers_fall_back_to_latched_descent_without_losing_keys() -> Result<()> {
    let memory = Arc::new(PageMemory::new(
        PageMemoryOptions {
            page_size: 1024,
            segments: 4,
            pages_per_segment: 512,
            verify_checksums: true,
        },
        Arc::new(MemoryPageStore::new()),
        Arc::new(CheckpointLock::new()),
    )?);
    memory.start()?;
    let reuse = Arc::new(ReuseList::create(memory.clone(), GroupId(3), ReuseOptions::default())?);
    let options = BTreeOptions {
        max_items: 4,
        max_key_len: 8,
        max_value_len: 8,
        optimistic_retries: 0,
    };
    let tree = Arc::new(BPlusTree::<u64, u64>::create(memory, reuse, options)?);
    let writer = {
        let tree = tree.clone();
        thread::spawn(move || -> Result<()> {
            for key in 1_000u64..3_000 {
                tree.put(&key, &key)?;
            }
            Ok(())
        })
    };
    for key in 0u64..1_000 {
        tree.put(&key, &key)?;
        assert_eq!(tree.get(&key)?, Some(key));
    }
    writer.join().expect("writer thread")?;
    assert_eq!(tree.len(), 3_000);
    assert!(tree.stats_snapshot().latched_fallbacks > 0);
    assert_eq!(tree.verify()?.entries, 3_000);
    Ok(())
}
