use super::{BPlusTree, Seek};
use crate::primitives::pager::{PageHandle, PageReadGuard};
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::{LeafNode, MetaNode, Node};
use crate::types::{FullPageId, GridError, Result};

/// A leaf copied out under its latch, with the version it had at that moment.
#[derive(Clone, Debug)]
pub(crate) struct LeafSnapshot {
    pub id: FullPageId,
    pub version: u64,
    pub leaf: LeafNode,
}

/// True when `handle` still carries `version` once no writer holds its latch.
fn still_at(handle: &PageHandle, version: u64) -> bool {
    let _latch = handle.read();
    handle.version() == version
}

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Looks up `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = Self::encode_key(key);
        let snapshot = self.find_leaf(Seek::Key(&key))?;
        match Self::search_leaf(&snapshot.leaf, &key) {
            Ok(pos) => Ok(Some(V::decode_val(&snapshot.leaf.entries[pos].1)?)),
            Err(_) => Ok(None),
        }
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let key = Self::encode_key(key);
        let snapshot = self.find_leaf(Seek::Key(&key))?;
        Ok(Self::search_leaf(&snapshot.leaf, &key).is_ok())
    }

    /// Smallest entry.
    pub fn first(&self) -> Result<Option<(K, V)>> {
        let snapshot = self.find_leaf(Seek::First)?;
        snapshot
            .leaf
            .entries
            .first()
            .map(|(k, v)| Ok((K::decode_key(k)?, V::decode_val(v)?)))
            .transpose()
    }

    /// Largest entry.
    pub fn last(&self) -> Result<Option<(K, V)>> {
        let snapshot = self.find_leaf(Seek::Last)?;
        snapshot
            .leaf
            .entries
            .last()
            .map(|(k, v)| Ok((K::decode_key(k)?, V::decode_val(v)?)))
            .transpose()
    }

    /// Finds the leaf for `seek`, optimistically first and latched once the
    /// restart budget is spent.
    pub(crate) fn find_leaf(&self, seek: Seek<'_>) -> Result<LeafSnapshot> {
        self.stats.inc_descents();
        for _ in 0..self.options.optimistic_retries {
            if let Some(snapshot) = self.descend_optimistic(seek)? {
                return Ok(snapshot);
            }
            self.stats.inc_optimistic_restarts();
        }
        self.stats.inc_latched_fallbacks();
        tracing::debug!(
            target: "pagegrid::btree::search",
            retries = self.options.optimistic_retries,
            "btree.read.latched_fallback"
        );
        self.descend_latched(seek)
    }

    /// Descends without holding a parent latch while reading a child. Each
    /// child is validated by re-checking the parent's version afterwards;
    /// `None` means the descent raced a writer and must restart.
    fn descend_optimistic(&self, seek: Seek<'_>) -> Result<Option<LeafSnapshot>> {
        let meta = self.memory.acquire_page(self.meta)?;
        let (mut parent_version, root) = {
            let data = meta.read();
            (meta.version(), MetaNode::decode(&data)?.root)
        };
        let mut parent = meta;
        let mut page_no = root;
        loop {
            let id = self.page_id(page_no);
            let child = match self.memory.acquire_page(id) {
                Ok(handle) => handle,
                Err(GridError::PageNotFound(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            let (version, decoded) = {
                let data = child.read();
                (child.version(), Node::decode(&data))
            };
            if !still_at(&parent, parent_version) {
                return Ok(None);
            }
            let Ok(node) = decoded else {
                return Ok(None);
            };
            match node {
                Node::Leaf(leaf) => {
                    tracing::trace!(
                        target: "pagegrid::btree::search",
                        page = page_no,
                        kind = "leaf",
                        "located target leaf"
                    );
                    return Ok(Some(LeafSnapshot { id, version, leaf }));
                }
                Node::Inner(inner) => {
                    page_no = inner.children[Self::child_slot(&inner, seek)];
                    parent = child;
                    parent_version = version;
                }
            }
        }
    }

    /// Descends holding shared latches coupled top-down. Always terminates;
    /// decoding errors here are real corruption.
    fn descend_latched(&self, seek: Seek<'_>) -> Result<LeafSnapshot> {
        // Faulting a child in takes the checkpoint lock; holding it from the
        // start keeps a queued checkpoint from blocking us under a latch.
        let _cp = self.memory.checkpoint_lock().read();
        let meta = self.memory.acquire_page(self.meta)?.into_read();
        let mut page_no = MetaNode::decode(&meta)?.root;
        let mut parent: PageReadGuard = meta;
        loop {
            let id = self.page_id(page_no);
            let child = self.memory.acquire_page(id)?.into_read();
            drop(parent);
            match Node::decode(&child)? {
                Node::Leaf(leaf) => {
                    return Ok(LeafSnapshot {
                        id,
                        version: child.handle().version(),
                        leaf,
                    })
                }
                Node::Inner(inner) => {
                    page_no = inner.children[Self::child_slot(&inner, seek)];
                    parent = child;
                }
            }
        }
    }

    /// Reads the leaf at `page_no`; `None` when the page is gone or is no
    /// longer a leaf.
    pub(crate) fn read_leaf(&self, page_no: u64) -> Result<Option<LeafSnapshot>> {
        let id = self.page_id(page_no);
        let handle = match self.memory.acquire_page(id) {
            Ok(handle) => handle,
            Err(GridError::PageNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let data = handle.read();
        match Node::decode(&data) {
            Ok(Node::Leaf(leaf)) => Ok(Some(LeafSnapshot {
                id,
                version: handle.version(),
                leaf,
            })),
            _ => Ok(None),
        }
    }

    /// True when the page still carries `version`.
    pub(crate) fn leaf_unchanged(&self, page_no: u64, version: u64) -> Result<bool> {
        match self.memory.acquire_page(self.page_id(page_no)) {
            Ok(handle) => Ok(still_at(&handle, version)),
            Err(GridError::PageNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
