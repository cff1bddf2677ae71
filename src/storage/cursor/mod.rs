#![forbid(unsafe_code)]

//! Paginated range scans addressed by numeric handles.
//!
//! A query front end opens a cursor, receives the first page together with a
//! handle and fetches further pages with it. Cursors hold no page pins
//! between fetches; each one only keeps a [`ScanState`].

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::storage::btree::{BPlusTree, KeyCodec, ScanState, ValCodec};
use crate::types::{GridError, Result};

/// One page of cursor results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorPage<K, V> {
    /// Handle to pass to [`CursorRegistry::fetch`].
    pub handle: u64,
    /// Entries of this page in key order.
    pub items: Vec<(K, V)>,
    /// True when the cursor is exhausted; the handle is already released.
    pub last: bool,
}

struct Cursor<K, V> {
    state: ScanState,
    // One entry read ahead so `last` is exact.
    peeked: Option<(K, V)>,
}

/// Open cursors over one tree.
pub struct CursorRegistry<K: KeyCodec, V: ValCodec> {
    tree: Arc<BPlusTree<K, V>>,
    next_handle: AtomicU64,
    cursors: Mutex<FxHashMap<u64, Arc<Mutex<Cursor<K, V>>>>>,
}

impl<K: KeyCodec, V: ValCodec> CursorRegistry<K, V> {
    /// Creates a registry serving cursors over `tree`.
    pub fn new(tree: Arc<BPlusTree<K, V>>) -> Self {
        Self {
            tree,
            next_handle: AtomicU64::new(1),
            cursors: Mutex::new(FxHashMap::default()),
        }
    }

    /// Tree the cursors read from.
    pub fn tree(&self) -> &Arc<BPlusTree<K, V>> {
        &self.tree
    }

    /// Number of open cursors.
    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    /// Returns true when no cursor is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a cursor over `[from, to]` and returns its first page.
    pub fn open(&self, from: Bound<&K>, to: Bound<&K>, page_size: usize) -> Result<CursorPage<K, V>> {
        check_page_size(page_size)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut cursor = Cursor {
            state: ScanState::new::<K>(from, to),
            peeked: None,
        };
        let (items, last) = self.fill(&mut cursor, page_size)?;
        if !last {
            self.cursors
                .lock()
                .insert(handle, Arc::new(Mutex::new(cursor)));
        }
        debug!(handle, items = items.len(), last, "cursor.open");
        Ok(CursorPage {
            handle,
            items,
            last,
        })
    }

    /// Returns the next page of `handle`.
    ///
    /// Fails with [`GridError::Invalid`] for unknown, closed or exhausted
    /// handles. A failed read closes the cursor.
    pub fn fetch(&self, handle: u64, page_size: usize) -> Result<CursorPage<K, V>> {
        check_page_size(page_size)?;
        let cursor = self
            .cursors
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(GridError::Invalid("unknown cursor handle"))?;
        let mut cursor = cursor.lock();
        let (items, last) = match self.fill(&mut cursor, page_size) {
            Ok(page) => page,
            Err(err) => {
                self.cursors.lock().remove(&handle);
                debug!(handle, error = %err, "cursor.fetch.failed");
                return Err(err);
            }
        };
        if last {
            self.cursors.lock().remove(&handle);
        }
        trace!(handle, items = items.len(), last, "cursor.fetch");
        Ok(CursorPage {
            handle,
            items,
            last,
        })
    }

    /// Cancels `handle`.
    pub fn close(&self, handle: u64) -> Result<()> {
        match self.cursors.lock().remove(&handle) {
            Some(_) => {
                debug!(handle, "cursor.close");
                Ok(())
            }
            None => Err(GridError::Invalid("unknown cursor handle")),
        }
    }

    fn fill(&self, cursor: &mut Cursor<K, V>, page_size: usize) -> Result<(Vec<(K, V)>, bool)> {
        let mut items = Vec::with_capacity(page_size);
        items.extend(cursor.peeked.take());
        while items.len() < page_size {
            match self.tree.scan_next(&mut cursor.state)? {
                Some(item) => items.push(item),
                None => return Ok((items, true)),
            }
        }
        cursor.peeked = self.tree.scan_next(&mut cursor.state)?;
        let last = cursor.peeked.is_none();
        Ok((items, last))
    }
}

fn check_page_size(page_size: usize) -> Result<()> {
    if page_size == 0 {
        return Err(GridError::Invalid("cursor page size must be non-zero"));
    }
    Ok(())
}
