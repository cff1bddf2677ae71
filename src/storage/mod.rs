//! Index structures built on page memory.
//!
//! Holds the B+ tree, the reuse list that recycles its pages, the cursor
//! registry serving paginated scans and the unswap barrier.

/// Concurrent B+ tree.
///
/// Ordered key/value index with optimistic readers and lock-coupled writers.
pub mod btree;

/// Paginated cursors over a tree.
pub mod cursor;

/// Free page recycling.
pub mod reuse;

/// Unswap barrier.
pub mod swap;

pub use btree::{BPlusTree, BTreeOptions, KeyCodec, RangeIter, ScanState, TreeShape, ValCodec};
pub use cursor::{CursorPage, CursorRegistry};
pub use reuse::{ReuseList, ReuseOptions};
pub use swap::{SwapEntry, SwapEntryInfo, SwapListener, UnswapBarrier};
