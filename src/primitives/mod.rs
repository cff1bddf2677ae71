//! Low-level primitives the storage structures are built on.
//!
//! Includes positioned file I/O, the checkpoint lock and the page memory.

/// Checkpoint lock and lock-state checks.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Segmented page memory with eviction and pinning.
pub mod pager;
