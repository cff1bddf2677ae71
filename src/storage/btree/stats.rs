use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of B+ tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Root-to-leaf descents performed by readers and writers
    pub descents: u64,
    /// Optimistic descents restarted after failed version validation
    pub optimistic_restarts: u64,
    /// Reads that gave up on optimism and latched top-down
    pub latched_fallbacks: u64,
    /// Leaf page splits
    pub leaf_splits: u64,
    /// Inner page splits
    pub inner_splits: u64,
    /// Root splits that grew the tree
    pub root_splits: u64,
    /// Leaf merges
    pub leaf_merges: u64,
    /// Inner merges
    pub inner_merges: u64,
    /// Underflows fixed by borrowing from a sibling
    pub borrows: u64,
    /// Root collapses that shrank the tree
    pub root_collapses: u64,
    /// Cursor re-descents after a leaf changed underneath
    pub cursor_reseeks: u64,
}

/// Thread-safe statistics tracking for B+ tree operations.
#[derive(Default)]
pub struct BTreeStats {
    descents: AtomicU64,
    optimistic_restarts: AtomicU64,
    latched_fallbacks: AtomicU64,
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    root_splits: AtomicU64,
    leaf_merges: AtomicU64,
    inner_merges: AtomicU64,
    borrows: AtomicU64,
    root_collapses: AtomicU64,
    cursor_reseeks: AtomicU64,
}

macro_rules! counters {
    ($($name:ident => $inc:ident),* $(,)?) => {
        impl BTreeStats {
            $(
                #[doc = concat!("Returns the current `", stringify!($name), "` count.")]
                pub fn $name(&self) -> u64 {
                    self.$name.load(AtomicOrdering::Relaxed)
                }

                pub(crate) fn $inc(&self) {
                    self.$name.fetch_add(1, AtomicOrdering::Relaxed);
                }
            )*

            /// Creates a snapshot of all current statistics.
            pub fn snapshot(&self) -> BTreeStatsSnapshot {
                BTreeStatsSnapshot {
                    $($name: self.$name(),)*
                }
            }
        }
    };
}

counters! {
    descents => inc_descents,
    optimistic_restarts => inc_optimistic_restarts,
    latched_fallbacks => inc_latched_fallbacks,
    leaf_splits => inc_leaf_splits,
    inner_splits => inc_inner_splits,
    root_splits => inc_root_splits,
    leaf_merges => inc_leaf_merges,
    inner_merges => inc_inner_merges,
    borrows => inc_borrows,
    root_collapses => inc_root_collapses,
    cursor_reseeks => inc_cursor_reseeks,
}

impl BTreeStats {
    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "pagegrid::btree::stats",
            descents = snapshot.descents,
            optimistic_restarts = snapshot.optimistic_restarts,
            latched_fallbacks = snapshot.latched_fallbacks,
            leaf_splits = snapshot.leaf_splits,
            inner_splits = snapshot.inner_splits,
            root_splits = snapshot.root_splits,
            leaf_merges = snapshot.leaf_merges,
            inner_merges = snapshot.inner_merges,
            borrows = snapshot.borrows,
            root_collapses = snapshot.root_collapses,
            cursor_reseeks = snapshot.cursor_reseeks,
            "btree stats snapshot"
        );
    }
}
