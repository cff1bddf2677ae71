#![forbid(unsafe_code)]

//! Concurrent B+ tree over page memory.

/// Encoding and decoding utilities for keys and values.
pub mod codecs;
/// B+ tree page format.
pub mod page;

mod cursor;
mod stats;
mod tree;

pub use codecs::{KeyCodec, ValCodec};
pub use cursor::{RangeIter, ScanState};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BPlusTree, BTreeOptions, TreeShape};
