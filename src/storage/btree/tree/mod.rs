use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::codecs::{KeyCodec, ValCodec};
use super::page::{self, InnerNode, LeafNode, MetaNode, Node};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::pager::{PageMemory, PageWriteGuard};
use crate::storage::reuse::ReuseList;
use crate::types::{FullPageId, GridError, Result};

mod insert;
mod read;
mod remove;
mod verify;

pub use verify::TreeShape;

/// Configuration knobs for the B+ tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeOptions {
    /// Maximum entries per leaf and separators per inner node
    pub max_items: usize,
    /// Longest encoded key accepted by `put`
    pub max_key_len: usize,
    /// Longest encoded value accepted by `put`
    pub max_value_len: usize,
    /// Optimistic descents tried before a read latches top-down
    pub optimistic_retries: u32,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            max_items: 32,
            max_key_len: 48,
            max_value_len: 48,
            optimistic_retries: 16,
        }
    }
}

impl BTreeOptions {
    /// Minimum occupancy of a non-root node.
    pub fn min_items(&self) -> usize {
        self.max_items / 2
    }

    /// Checks that a full node of maximal entries fits in `page_size` bytes.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        if self.max_items < 3 {
            return Err(GridError::Invalid("max_items must be at least 3"));
        }
        if self.max_key_len == 0 || self.max_key_len > u16::MAX as usize {
            return Err(GridError::Invalid("max_key_len out of range"));
        }
        if self.max_value_len > u16::MAX as usize {
            return Err(GridError::Invalid("max_value_len out of range"));
        }
        if self.max_items > u16::MAX as usize {
            return Err(GridError::Invalid("max_items out of range"));
        }
        let leaf = page::leaf_capacity_needed(self.max_items, self.max_key_len, self.max_value_len);
        let inner = page::inner_capacity_needed(self.max_items, self.max_key_len);
        if leaf > page_size || inner > page_size {
            return Err(GridError::Invalid("max_items entries do not fit in a page"));
        }
        Ok(())
    }
}

/// Concurrent B+ tree over page memory.
///
/// Readers descend optimistically and validate page versions; writers take the
/// checkpoint read lock and latch-couple from the meta page down. Pages freed
/// by merges go to the reuse list, and splits take pages from it first.
pub struct BPlusTree<K: KeyCodec, V: ValCodec> {
    memory: Arc<PageMemory>,
    reuse: Arc<ReuseList>,
    meta: FullPageId,
    options: BTreeOptions,
    len: AtomicU64,
    stats: Arc<BTreeStats>,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// Where a descent is headed.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Seek<'a> {
    First,
    Last,
    Key(&'a [u8]),
}

/// A node latched for writing together with its decoded form.
pub(crate) struct Latched {
    pub guard: PageWriteGuard,
    pub node: Node,
    /// Child index the descent took (inner nodes only).
    pub slot: usize,
}

impl Latched {
    pub fn page_no(&self) -> u64 {
        self.guard.id().page_no
    }

    /// Writes the decoded node back to its page.
    pub fn store(&mut self) -> Result<()> {
        let id = self.guard.id();
        self.node.encode(id, self.guard.data_mut())
    }
}

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Creates an empty tree in the reuse list's group.
    pub fn create(
        memory: Arc<PageMemory>,
        reuse: Arc<ReuseList>,
        options: BTreeOptions,
    ) -> Result<Self> {
        options.validate(memory.page_size())?;
        let (meta, root) = {
            let _cp = memory.checkpoint_lock().read();
            let meta = reuse.take_or_allocate()?;
            let root = match reuse.take_or_allocate() {
                Ok(root) => root,
                Err(err) => {
                    reuse.add_for_recycle(meta)?;
                    return Err(err);
                }
            };
            {
                let mut guard = memory.acquire_page(root)?.into_write()?;
                LeafNode::default().encode(root, guard.data_mut())?;
            }
            {
                let mut guard = memory.acquire_page(meta)?.into_write()?;
                MetaNode {
                    root: root.page_no,
                    height: 1,
                    max_items: options.max_items as u32,
                }
                .encode(meta, guard.data_mut())?;
            }
            (meta, root)
        };
        tracing::info!(meta = %meta, root = %root, "btree.create");
        Ok(Self::assemble(memory, reuse, meta, options, 0))
    }

    /// Attaches to an existing tree through its meta page.
    pub fn open(
        memory: Arc<PageMemory>,
        reuse: Arc<ReuseList>,
        meta: FullPageId,
        options: BTreeOptions,
    ) -> Result<Self> {
        options.validate(memory.page_size())?;
        if meta.group != reuse.group() {
            return Err(GridError::Invalid("meta page and reuse list groups differ"));
        }
        let stored = {
            let handle = memory.acquire_page(meta)?;
            let data = handle.read();
            MetaNode::decode(&data)?
        };
        if stored.max_items as usize != options.max_items {
            return Err(GridError::Invalid("max_items differs from the stored tree"));
        }
        let tree = Self::assemble(memory, reuse, meta, options, 0);
        let count = tree.count_entries()?;
        tree.len.store(count, AtomicOrdering::Release);
        tracing::info!(meta = %meta, entries = count, "btree.open");
        Ok(tree)
    }

    fn assemble(
        memory: Arc<PageMemory>,
        reuse: Arc<ReuseList>,
        meta: FullPageId,
        options: BTreeOptions,
        len: u64,
    ) -> Self {
        Self {
            memory,
            reuse,
            meta,
            options,
            len: AtomicU64::new(len),
            stats: Arc::new(BTreeStats::default()),
            _marker: PhantomData,
        }
    }

    /// Identifier of the meta page holding the root slot.
    pub fn meta_page(&self) -> FullPageId {
        self.meta
    }

    /// Tree options.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.len.load(AtomicOrdering::Acquire)
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels, 1 for a lone root leaf.
    pub fn height(&self) -> Result<u32> {
        let handle = self.memory.acquire_page(self.meta)?;
        let data = handle.read();
        Ok(MetaNode::decode(&data)?.height)
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Recycles every page of the tree, meta page included, and returns how
    /// many pages were handed back.
    pub fn destroy(self) -> Result<usize> {
        let _cp = self.memory.checkpoint_lock().read();
        let meta_guard = self.memory.acquire_page(self.meta)?.into_write()?;
        let meta = MetaNode::decode(&meta_guard)?;
        let mut pending = vec![meta.root];
        let mut pages = Vec::new();
        while let Some(page_no) = pending.pop() {
            let handle = self.memory.acquire_page(self.page_id(page_no))?;
            if let Node::Inner(inner) = Node::decode(&handle.read())? {
                pending.extend(inner.children);
            }
            pages.push(page_no);
        }
        for page_no in &pages {
            self.reuse.add_for_recycle(self.page_id(*page_no))?;
        }
        self.reuse.recycle(meta_guard)?;
        tracing::info!(meta = %self.meta, pages = pages.len() + 1, "btree.destroy");
        Ok(pages.len() + 1)
    }

    pub(crate) fn note_cursor_reseek(&self) {
        self.stats.inc_cursor_reseeks();
    }

    pub(crate) fn page_id(&self, page_no: u64) -> FullPageId {
        FullPageId::new(self.meta.group, page_no)
    }

    pub(crate) fn compare(a: &[u8], b: &[u8]) -> Ordering {
        K::compare_encoded(a, b)
    }

    pub(crate) fn encode_key(key: &K) -> Vec<u8> {
        let mut out = Vec::new();
        K::encode_key(key, &mut out);
        out
    }

    fn encode_entry(&self, key: &K, value: &V) -> Result<(Vec<u8>, Vec<u8>)> {
        let key = Self::encode_key(key);
        if key.len() > self.options.max_key_len {
            return Err(GridError::Invalid("key exceeds max_key_len"));
        }
        let mut val = Vec::new();
        V::encode_val(value, &mut val);
        if val.len() > self.options.max_value_len {
            return Err(GridError::Invalid("value exceeds max_value_len"));
        }
        Ok((key, val))
    }

    /// Index of the child covering `key`: the number of separators `<= key`.
    pub(crate) fn child_slot(inner: &InnerNode, seek: Seek<'_>) -> usize {
        match seek {
            Seek::First => 0,
            Seek::Last => inner.children.len() - 1,
            Seek::Key(key) => inner
                .keys
                .partition_point(|sep| Self::compare(sep, key) != Ordering::Greater),
        }
    }

    pub(crate) fn search_leaf(leaf: &LeafNode, key: &[u8]) -> std::result::Result<usize, usize> {
        leaf.entries
            .binary_search_by(|(probe, _)| Self::compare(probe, key))
    }

    pub(crate) fn latch(&self, page_no: u64) -> Result<Latched> {
        let guard = self.memory.acquire_page(self.page_id(page_no))?.into_write()?;
        let node = Node::decode(&guard)?;
        Ok(Latched {
            guard,
            node,
            slot: 0,
        })
    }

    /// Takes `count` pages from the reuse list or page memory, all or nothing.
    pub(crate) fn take_pages(&self, count: usize) -> Result<Vec<u64>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.reuse.take_or_allocate() {
                Ok(id) => pages.push(id.page_no),
                Err(err) => {
                    self.return_pages(pages)?;
                    return Err(err);
                }
            }
        }
        Ok(pages)
    }

    pub(crate) fn return_pages(&self, pages: Vec<u64>) -> Result<()> {
        for page_no in pages {
            self.reuse.add_for_recycle(self.page_id(page_no))?;
        }
        Ok(())
    }

    fn count_entries(&self) -> Result<u64> {
        let mut count = 0u64;
        let mut iter = self.iter();
        while let Some(item) = iter.next_raw()? {
            drop(item);
            count += 1;
        }
        Ok(count)
    }
}
