#![forbid(unsafe_code)]

//! The process-wide checkpoint lock.
//!
//! Every page mutation and every eviction runs under the shared side of this
//! lock; a checkpoint takes the exclusive side to get a mutation-free boundary.
//! The lock tracks its holders per thread so nested code can ask whether the
//! current thread already holds it instead of re-acquiring and deadlocking.

use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use crate::types::{GridError, Result};

/// Answers whether the checkpoint lock is held by the calling thread.
pub trait CheckpointLockStateChecker: Send + Sync {
    /// Returns true when the current thread holds the checkpoint lock in any mode.
    fn checkpoint_lock_is_held_by_thread(&self) -> bool;
}

impl<F> CheckpointLockStateChecker for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn checkpoint_lock_is_held_by_thread(&self) -> bool {
        self()
    }
}

/// Reader/writer lock separating page mutators from checkpoints.
#[derive(Default)]
pub struct CheckpointLock {
    lock: RwLock<()>,
    shared_holders: Mutex<FxHashMap<ThreadId, u32>>,
    exclusive_holder: Mutex<Option<ThreadId>>,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Number of threads holding the shared side.
    pub readers: usize,
    /// Whether a checkpoint holds the exclusive side.
    pub checkpoint: bool,
}

/// Shared hold on the checkpoint lock.
pub struct CheckpointReadGuard<'a> {
    owner: &'a CheckpointLock,
    _raw: Option<RwLockReadGuard<'a, ()>>,
}

/// Exclusive hold on the checkpoint lock.
pub struct CheckpointWriteGuard<'a> {
    owner: &'a CheckpointLock,
    _raw: RwLockWriteGuard<'a, ()>,
}

impl CheckpointLock {
    /// Creates an unlocked checkpoint lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the shared side, blocking while a checkpoint runs.
    ///
    /// Re-entrant: a thread already holding the lock (in either mode) only bumps
    /// its hold count.
    pub fn read(&self) -> CheckpointReadGuard<'_> {
        let me = thread::current().id();
        let nested = self.shared_depth(me) > 0 || self.is_exclusive_holder(me);
        let raw = if nested { None } else { Some(self.lock.read()) };
        *self.shared_holders.lock().entry(me).or_insert(0) += 1;
        CheckpointReadGuard {
            owner: self,
            _raw: raw,
        }
    }

    /// Acquires the exclusive side, waiting for all mutators to leave.
    ///
    /// Fails when the calling thread holds the lock already; upgrading would
    /// deadlock against itself.
    pub fn write(&self) -> Result<CheckpointWriteGuard<'_>> {
        let me = thread::current().id();
        self.ensure_not_holding(me)?;
        let raw = self.lock.write();
        *self.exclusive_holder.lock() = Some(me);
        Ok(CheckpointWriteGuard {
            owner: self,
            _raw: raw,
        })
    }

    /// Acquires the exclusive side if it is free right now.
    pub fn try_write(&self) -> Result<Option<CheckpointWriteGuard<'_>>> {
        let me = thread::current().id();
        self.ensure_not_holding(me)?;
        Ok(self.lock.try_write().map(|raw| {
            *self.exclusive_holder.lock() = Some(me);
            CheckpointWriteGuard {
                owner: self,
                _raw: raw,
            }
        }))
    }

    /// Returns true when the current thread holds the lock in any mode.
    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.shared_depth(me) > 0 || self.is_exclusive_holder(me)
    }

    /// Returns a snapshot of the lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            readers: self.shared_holders.lock().len(),
            checkpoint: self.exclusive_holder.lock().is_some(),
        }
    }

    fn ensure_not_holding(&self, me: ThreadId) -> Result<()> {
        if self.shared_depth(me) > 0 {
            return Err(GridError::Invalid(
                "checkpoint write lock requested while holding the read lock",
            ));
        }
        if self.is_exclusive_holder(me) {
            return Err(GridError::Invalid("checkpoint write lock is not reentrant"));
        }
        Ok(())
    }

    fn shared_depth(&self, me: ThreadId) -> u32 {
        self.shared_holders.lock().get(&me).copied().unwrap_or(0)
    }

    fn is_exclusive_holder(&self, me: ThreadId) -> bool {
        *self.exclusive_holder.lock() == Some(me)
    }
}

impl CheckpointLockStateChecker for CheckpointLock {
    fn checkpoint_lock_is_held_by_thread(&self) -> bool {
        self.is_held_by_current_thread()
    }
}

impl Drop for CheckpointReadGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut holders = self.owner.shared_holders.lock();
        if let Some(depth) = holders.get_mut(&me) {
            *depth -= 1;
            if *depth == 0 {
                holders.remove(&me);
            }
        }
    }
}

impl Drop for CheckpointWriteGuard<'_> {
    fn drop(&mut self) {
        *self.owner.exclusive_holder.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn read_is_reentrant_and_tracked() {
        let lock = CheckpointLock::new();
        assert!(!lock.is_held_by_current_thread());
        let outer = lock.read();
        let inner = lock.read();
        assert!(lock.is_held_by_current_thread());
        drop(inner);
        assert!(lock.is_held_by_current_thread());
        drop(outer);
        assert!(!lock.is_held_by_current_thread());
        assert_eq!(lock.snapshot().readers, 0);
    }

    #[test]
    fn write_refused_while_holding_read() {
        let lock = CheckpointLock::new();
        let _read = lock.read();
        assert!(matches!(lock.write(), Err(GridError::Invalid(_))));
        assert!(matches!(lock.try_write(), Err(GridError::Invalid(_))));
    }

    #[test]
    fn checkpoint_blocks_readers_until_release() {
        let lock = Arc::new(CheckpointLock::new());
        let guard = lock.write().unwrap();
        assert!(lock.snapshot().checkpoint);
        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _read = lock.read();
                entered.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn try_write_skips_when_reader_active() {
        let lock = Arc::new(CheckpointLock::new());
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _read = lock.read();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        held_rx.recv().unwrap();
        assert!(lock.try_write().unwrap().is_none());
        release_tx.send(()).unwrap();
        reader.join().unwrap();
        assert!(lock.try_write().unwrap().is_some());
    }

    #[test]
    fn closures_act_as_checkers() {
        let always = || true;
        assert!(always.checkpoint_lock_is_held_by_thread());
        let lock = CheckpointLock::new();
        let checker: &dyn CheckpointLockStateChecker = &lock;
        assert!(!checker.checkpoint_lock_is_held_by_thread());
        let _w = lock.write().unwrap();
        assert!(checker.checkpoint_lock_is_held_by_thread());
    }
}
