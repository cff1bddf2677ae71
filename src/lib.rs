//! Page storage substrate for an in-memory data grid.
//!
//! Layers, bottom up:
//! - [`primitives::pager::PageMemory`]: segmented page cache with pinning,
//!   CLOCK-Pro eviction and write-back to a [`primitives::pager::PageStore`];
//! - [`storage::reuse::ReuseList`]: bucketed free list of recycled pages;
//! - [`storage::btree::BPlusTree`]: concurrent B+ tree over both;
//! - [`storage::cursor::CursorRegistry`]: paginated scans by handle;
//! - [`storage::swap::UnswapBarrier`]: waits for in-flight unswaps.

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::{ConfigError, GridConfig};
pub use types::{ErrorKind, FullPageId, GridError, GroupId, Result};
