#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use pagegrid::storage::swap::{SwapEntry, SwapListener, UnswapBarrier};
use pagegrid::{GridError, Result};

const SOURCES: u64 = 4;
const KEYS_PER_SOURCE: u64 = 250;

fn payload(key: u64) -> SwapEntry<Vec<u8>> {
    SwapEntry {
        ttl: 1_000,
        expire_time: 1_700_000_000_000 + key,
        version: key * 3,
        value: key.to_be_bytes().to_vec(),
    }
}

#[test]
fn waiter_sees_every_completed_entry() -> Result<()> {
    let barrier = Arc::new(UnswapBarrier::<u64, Vec<u8>>::new());
    let listener: Arc<dyn SwapListener<u64, Vec<u8>>> = barrier.clone();

    for key in 0..SOURCES * KEYS_PER_SOURCE {
        listener.on_entry_unswapping((key % 16) as u32, &key, &payload(key))?;
    }
    assert_eq!(barrier.in_flight(), (SOURCES * KEYS_PER_SOURCE) as usize);

    let finished = Arc::new(AtomicBool::new(false));
    let waiter = {
        let barrier = barrier.clone();
        let finished = finished.clone();
        thread::spawn(move || {
            barrier.wait_unswap_finished();
            finished.store(true, Ordering::SeqCst);
            barrier.entries().len()
        })
    };

    let sources: Vec<_> = (0..SOURCES)
        .map(|s| {
            let listener = listener.clone();
            thread::spawn(move || -> Result<()> {
                let mut keys: Vec<u64> = (0..KEYS_PER_SOURCE)
                    .map(|i| i * SOURCES + s)
                    .collect();
                keys.shuffle(&mut ChaCha8Rng::seed_from_u64(s));
                for key in keys {
                    listener.on_entry_unswapped((key % 16) as u32, &key, &payload(key))?;
                }
                Ok(())
            })
        })
        .collect();
    for source in sources {
        source.join().expect("swap source")?;
    }

    let seen = waiter.join().expect("waiter");
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(seen, (SOURCES * KEYS_PER_SOURCE) as usize);

    let entries = barrier.entries();
    let keys: HashSet<u64> = entries.iter().map(|info| info.key).collect();
    assert_eq!(keys.len(), entries.len());
    for info in &entries {
        assert_eq!(info.partition, (info.key % 16) as u32);
        assert_eq!(info.version, info.key * 3);
        assert_eq!(info.value, info.key.to_be_bytes().to_vec());
    }
    Ok(())
}

#[test]
fn many_waiters_are_released_together() -> Result<()> {
    let barrier = Arc::new(UnswapBarrier::<u64, Vec<u8>>::new());
    barrier.on_entry_unswapping(0, &1, &payload(1))?;
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait_unswap_finished_timeout(Duration::from_secs(30)))
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    barrier.on_entry_unswapped(0, &1, &payload(1))?;
    for waiter in waiters {
        waiter.join().expect("waiter")?;
    }
    assert_eq!(barrier.entries().len(), 1);
    Ok(())
}

#[test]
fn completion_without_start_is_a_usage_error() {
    let barrier = UnswapBarrier::<u64, Vec<u8>>::new();
    let err = barrier.on_entry_unswapped(0, &5, &payload(5)).unwrap_err();
    assert!(matches!(err, GridError::Invalid(_)));
    assert_eq!(barrier.in_flight(), 0);
}
