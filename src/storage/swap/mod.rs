#![forbid(unsafe_code)]

//! Barrier over entries moving between the cache and swap storage.
//!
//! The swap source reports each key twice: when its unswap starts and when it
//! finishes. [`UnswapBarrier`] keeps the in-flight records, moves them to the
//! completed set and lets callers block until nothing is in flight.

use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::types::{GridError, Result};

/// Payload the swap source hands over with each notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapEntry<V> {
    /// Time to live in milliseconds, 0 for eternal entries.
    pub ttl: u64,
    /// Absolute expiry in milliseconds since the epoch, 0 when none.
    pub expire_time: u64,
    /// Entry version.
    pub version: u64,
    /// Entry value.
    pub value: V,
}

/// Record captured when an unswap starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapEntryInfo<K, V> {
    /// Cache key.
    pub key: K,
    /// Partition the key lives in.
    pub partition: u32,
    /// Time to live in milliseconds.
    pub ttl: u64,
    /// Absolute expiry in milliseconds since the epoch.
    pub expire_time: u64,
    /// Entry version.
    pub version: u64,
    /// Entry value.
    pub value: V,
}

/// Receives unswap notifications from a swap source.
///
/// The two calls for one key arrive in order; calls for different keys may
/// interleave freely.
pub trait SwapListener<K, V>: Send + Sync {
    /// An entry started moving out of swap storage.
    fn on_entry_unswapping(&self, partition: u32, key: &K, entry: &SwapEntry<V>) -> Result<()>;

    /// The entry announced by [`SwapListener::on_entry_unswapping`] has arrived.
    fn on_entry_unswapped(&self, partition: u32, key: &K, entry: &SwapEntry<V>) -> Result<()>;
}

struct BarrierState<K, V> {
    in_flight: FxHashMap<K, SwapEntryInfo<K, V>>,
    completed: FxHashMap<K, SwapEntryInfo<K, V>>,
    interrupts: u64,
}

/// Collects unswapped entries and blocks callers until no unswap is pending.
///
/// Single-use: completed records are never dropped, so a new cycle needs a
/// new barrier.
pub struct UnswapBarrier<K, V> {
    state: Mutex<BarrierState<K, V>>,
    drained: Condvar,
}

impl<K, V> Default for UnswapBarrier<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> UnswapBarrier<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty barrier.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                in_flight: FxHashMap::default(),
                completed: FxHashMap::default(),
                interrupts: 0,
            }),
            drained: Condvar::new(),
        }
    }

    /// Blocks until every started unswap has finished.
    ///
    /// Returns at once when nothing is in flight. Interrupts and spurious
    /// wake-ups only cause the condition to be checked again.
    pub fn wait_unswap_finished(&self) {
        let mut state = self.state.lock();
        while !state.in_flight.is_empty() {
            self.drained.wait(&mut state);
        }
    }

    /// Like [`Self::wait_unswap_finished`] but gives up after `timeout` or
    /// when [`Self::interrupt_waiters`] is called, with
    /// [`GridError::InterruptedWait`].
    pub fn wait_unswap_finished_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let epoch = state.interrupts;
        loop {
            if state.in_flight.is_empty() {
                return Ok(());
            }
            if state.interrupts != epoch {
                debug!(pending = state.in_flight.len(), "swap.wait.interrupted");
                return Err(GridError::InterruptedWait);
            }
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                if state.in_flight.is_empty() {
                    return Ok(());
                }
                debug!(pending = state.in_flight.len(), "swap.wait.timeout");
                return Err(GridError::InterruptedWait);
            }
        }
    }

    /// Wakes every waiter. Timed waiters return [`GridError::InterruptedWait`];
    /// untimed ones re-check and keep waiting.
    pub fn interrupt_waiters(&self) {
        let mut state = self.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.drained.notify_all();
    }

    /// Point-in-time copy of the completed records.
    pub fn entries(&self) -> Vec<SwapEntryInfo<K, V>> {
        self.state.lock().completed.values().cloned().collect()
    }

    /// Number of unswaps started but not finished.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl<K, V> SwapListener<K, V> for UnswapBarrier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn on_entry_unswapping(&self, partition: u32, key: &K, entry: &SwapEntry<V>) -> Result<()> {
        let info = SwapEntryInfo {
            key: key.clone(),
            partition,
            ttl: entry.ttl,
            expire_time: entry.expire_time,
            version: entry.version,
            value: entry.value.clone(),
        };
        let mut state = self.state.lock();
        state.in_flight.insert(key.clone(), info);
        trace!(partition, pending = state.in_flight.len(), "swap.unswapping");
        Ok(())
    }

    fn on_entry_unswapped(&self, partition: u32, key: &K, _entry: &SwapEntry<V>) -> Result<()> {
        let mut state = self.state.lock();
        let info = state
            .in_flight
            .remove(key)
            .ok_or(GridError::Invalid("unswapped entry was never unswapping"))?;
        state.completed.insert(key.clone(), info);
        let pending = state.in_flight.len();
        trace!(partition, pending, "swap.unswapped");
        if pending == 0 {
            debug!(completed = state.completed.len(), "swap.drained");
            self.drained.notify_all();
        }
        Ok(())
    }
}
