//! Micro benchmarks for the page-memory B+ tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::ops::Bound;
use std::sync::Arc;
use std::thread;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use pagegrid::primitives::concurrency::CheckpointLock;
use pagegrid::primitives::pager::{MemoryPageStore, PageMemory, PageMemoryOptions};
use pagegrid::storage::btree::{BPlusTree, BTreeOptions};
use pagegrid::storage::reuse::{ReuseList, ReuseOptions};
use pagegrid::GroupId;

const INSERT_COUNT: u64 = 32_768;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: u64 = 512;
const THREADS: u64 = 4;

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |tree| {
                for key in 0..INSERT_COUNT {
                    tree.put(&key, &key).expect("insert");
                }
                black_box(tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            fresh_tree,
            |tree| {
                for key in &random_keys {
                    tree.put(key, key).expect("insert");
                }
                black_box(tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("remove_random", |b| {
        b.iter_batched(
            || loaded_tree(INSERT_COUNT),
            |tree| {
                for key in &random_keys {
                    tree.remove(key).expect("remove");
                }
                black_box(tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function(BenchmarkId::new("parallel_insert", THREADS), |b| {
        b.iter_batched(
            || Arc::new(fresh_tree()),
            |tree| {
                let workers: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let tree = tree.clone();
                        thread::spawn(move || {
                            let mut key = t;
                            while key < INSERT_COUNT {
                                tree.put(&key, &key).expect("insert");
                                key += THREADS;
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().expect("worker");
                }
                black_box(tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = loaded_tree(INSERT_COUNT);
    let mut rng = ChaCha8Rng::seed_from_u64(0xFEED_FACE);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(0..INSERT_COUNT);
                black_box(loaded.get(&key).expect("get"));
            }
        });
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| {
            let start = rng.gen_range(0..(INSERT_COUNT - RANGE_WIDTH));
            let end = start + RANGE_WIDTH;
            for item in loaded.iter_range(Bound::Included(&start), Bound::Excluded(&end)) {
                black_box(item.expect("scan"));
            }
        });
    });

    group.finish();
}

fn fresh_tree() -> BPlusTree<u64, u64> {
    let memory = Arc::new(
        PageMemory::new(
            PageMemoryOptions {
                pages_per_segment: 4_096,
                ..PageMemoryOptions::default()
            },
            Arc::new(MemoryPageStore::new()),
            Arc::new(CheckpointLock::new()),
        )
        .expect("page memory"),
    );
    memory.start().expect("start");
    let reuse = Arc::new(
        ReuseList::create(memory.clone(), GroupId(1), ReuseOptions::default()).expect("reuse list"),
    );
    BPlusTree::create(memory, reuse, BTreeOptions::default()).expect("tree")
}

fn loaded_tree(count: u64) -> BPlusTree<u64, u64> {
    let tree = fresh_tree();
    for key in 0..count {
        tree.put(&key, &key).expect("insert");
    }
    tree
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
