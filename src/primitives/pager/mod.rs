#![forbid(unsafe_code)]

//! Segmented page memory over a pluggable page store.

mod frame;
mod handle;
mod memory;
mod options;
mod segment;
mod store;

pub use handle::{PageHandle, PageRead, PageReadGuard, PageWriteGuard};
pub use memory::{EvictionObserver, PageMemory, PageMemoryStats};
pub use options::PageMemoryOptions;
pub use store::{FilePageStore, MemoryPageStore, PageStore};
