use std::sync::atomic::Ordering as AtomicOrdering;

use super::{BPlusTree, Latched, Seek};
use crate::primitives::pager::PageWriteGuard;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::{InnerNode, LeafNode, MetaNode, Node};
use crate::types::{GridError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WriteMode {
    Insert,
    Remove,
}

/// Latches a writer still holds after lock coupling, top-down.
pub(crate) struct WritePath {
    /// Held only while the root itself may change.
    pub meta: Option<(PageWriteGuard, MetaNode)>,
    pub stack: Vec<Latched>,
}

impl WritePath {
    /// Rewrites the meta page with the held decoded copy.
    pub fn store_meta(&mut self) -> Result<()> {
        let (guard, meta) = self
            .meta
            .as_mut()
            .ok_or(GridError::Corruption("root change without the meta latch"))?;
        let id = guard.id();
        meta.encode(id, guard.data_mut())
    }
}

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let (key, value) = self.encode_entry(key, value)?;
        let _cp = self.memory.checkpoint_lock().read();
        let mut path = self.descend_for_write(&key, WriteMode::Insert)?;
        let mut leaf = path
            .stack
            .pop()
            .ok_or(GridError::Corruption("write descent ended without a leaf"))?;
        let Node::Leaf(node) = &mut leaf.node else {
            return Err(GridError::Corruption("write descent ended on an inner node"));
        };
        match Self::search_leaf(node, &key) {
            Ok(pos) => {
                let previous = std::mem::replace(&mut node.entries[pos].1, value);
                leaf.store()?;
                return Ok(Some(V::decode_val(&previous)?));
            }
            Err(pos) => node.entries.insert(pos, (key, value)),
        }
        if node.entries.len() <= self.options.max_items {
            leaf.store()?;
        } else {
            self.split_upwards(path, leaf)?;
        }
        self.len.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(None)
    }

    /// Lock-couples from the meta page to the leaf covering `key`, dropping
    /// every held ancestor whenever the newly latched node is safe for `mode`.
    pub(crate) fn descend_for_write(&self, key: &[u8], mode: WriteMode) -> Result<WritePath> {
        self.stats.inc_descents();
        let meta_guard = self.memory.acquire_page(self.meta)?.into_write()?;
        let meta = MetaNode::decode(&meta_guard)?;
        let mut path = WritePath {
            meta: Some((meta_guard, meta)),
            stack: Vec::with_capacity(meta.height as usize),
        };
        let mut page_no = meta.root;
        let mut is_root = true;
        loop {
            let mut latched = self.latch(page_no)?;
            if self.is_safe(&latched.node, mode, is_root) {
                path.meta = None;
                path.stack.clear();
            }
            let next = match &latched.node {
                Node::Inner(inner) => {
                    latched.slot = Self::child_slot(inner, Seek::Key(key));
                    Some(inner.children[latched.slot])
                }
                Node::Leaf(_) => None,
            };
            path.stack.push(latched);
            match next {
                Some(child) => {
                    page_no = child;
                    is_root = false;
                }
                None => return Ok(path),
            }
        }
    }

    fn is_safe(&self, node: &Node, mode: WriteMode, is_root: bool) -> bool {
        match mode {
            WriteMode::Insert => node.count() < self.options.max_items,
            WriteMode::Remove if is_root => match node {
                Node::Leaf(_) => true,
                Node::Inner(inner) => inner.keys.len() > 1,
            },
            WriteMode::Remove => node.count() > self.options.min_items(),
        }
    }

    /// Splits the overflowing `leaf` and carries separators up the held path,
    /// growing a new root when the old one splits.
    ///
    /// Every page the split touches is latched before the first one is
    /// rewritten, so a failed acquisition leaves the tree as it was.
    fn split_upwards(&self, path: WritePath, leaf: Latched) -> Result<()> {
        let max = self.options.max_items;
        let splitting_ancestors = path
            .stack
            .iter()
            .rev()
            .take_while(|latched| latched.node.count() >= max)
            .count();
        let grows = path.meta.is_some() && splitting_ancestors == path.stack.len();
        let pages = self.take_pages(1 + splitting_ancestors + usize::from(grows))?;
        let prepared = self
            .latch_reserved(&pages)
            .and_then(|reserved| Ok((reserved, self.latch_next_leaf(&leaf)?)));
        let (mut reserved, neighbour) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.return_pages(pages)?;
                return Err(err);
            }
        };
        let outcome = self.apply_split(path, leaf, neighbour, &mut reserved);
        for guard in reserved {
            self.reuse.recycle(guard)?;
        }
        outcome
    }

    fn latch_reserved(&self, pages: &[u64]) -> Result<Vec<PageWriteGuard>> {
        pages
            .iter()
            .map(|page_no| self.memory.acquire_page(self.page_id(*page_no))?.into_write())
            .collect()
    }

    fn latch_next_leaf(&self, leaf: &Latched) -> Result<Option<Latched>> {
        let Node::Leaf(node) = &leaf.node else {
            return Err(GridError::Corruption("leaf split on an inner node"));
        };
        node.next.map(|next_no| self.latch(next_no)).transpose()
    }

    fn apply_split(
        &self,
        mut path: WritePath,
        mut leaf: Latched,
        neighbour: Option<Latched>,
        reserved: &mut Vec<PageWriteGuard>,
    ) -> Result<()> {
        let max = self.options.max_items;
        let mut next_page = || {
            reserved
                .pop()
                .ok_or(GridError::Corruption("split ran out of reserved pages"))
        };

        let right = next_page()?;
        let mut new_child = right.id().page_no;
        let mut separator = self.split_leaf(&mut leaf, neighbour, right)?;
        drop(leaf);
        self.stats.inc_leaf_splits();

        loop {
            let Some(mut parent) = path.stack.pop() else {
                let mut guard = next_page()?;
                let id = guard.id();
                let (_, meta) = path
                    .meta
                    .as_mut()
                    .ok_or(GridError::Corruption("root split without the meta latch"))?;
                let inner = InnerNode {
                    keys: vec![separator],
                    children: vec![meta.root, new_child],
                };
                Node::Inner(inner).encode(id, guard.data_mut())?;
                drop(guard);
                meta.root = id.page_no;
                meta.height += 1;
                let height = meta.height;
                path.store_meta()?;
                self.stats.inc_root_splits();
                tracing::debug!(
                    target: "pagegrid::btree::split",
                    root = id.page_no,
                    height,
                    "btree.root_split"
                );
                break;
            };
            let slot = parent.slot;
            let Node::Inner(inner) = &mut parent.node else {
                return Err(GridError::Corruption("leaf found above another node"));
            };
            inner.keys.insert(slot, separator);
            inner.children.insert(slot + 1, new_child);
            if inner.keys.len() <= max {
                parent.store()?;
                break;
            }
            let mid = inner.keys.len() / 2;
            let mut right_keys = inner.keys.split_off(mid);
            let up = right_keys.remove(0);
            let right_children = inner.children.split_off(mid + 1);
            let mut guard = next_page()?;
            let right_id = guard.id();
            Node::Inner(InnerNode {
                keys: right_keys,
                children: right_children,
            })
            .encode(right_id, guard.data_mut())?;
            drop(guard);
            parent.store()?;
            self.stats.inc_inner_splits();
            tracing::trace!(
                target: "pagegrid::btree::split",
                left = parent.page_no(),
                right = right_id.page_no,
                "split inner page"
            );
            separator = up;
            new_child = right_id.page_no;
        }
        Ok(())
    }

    /// Moves the upper half of `leaf` into the `right` page, relinks the leaf
    /// chain through the latched `neighbour` and returns the separator for the
    /// parent.
    fn split_leaf(
        &self,
        leaf: &mut Latched,
        neighbour: Option<Latched>,
        mut right: PageWriteGuard,
    ) -> Result<Vec<u8>> {
        let left_no = leaf.page_no();
        let right_id = right.id();
        let Node::Leaf(left) = &mut leaf.node else {
            return Err(GridError::Corruption("leaf split on an inner node"));
        };
        let mid = left.entries.len() / 2;
        let right_node = LeafNode {
            entries: left.entries.split_off(mid),
            prev: Some(left_no),
            next: left.next,
        };
        left.next = Some(right_id.page_no);
        let separator = right_node.entries[0].0.clone();

        if let Some(mut neighbour) = neighbour {
            let Node::Leaf(next_leaf) = &mut neighbour.node else {
                return Err(GridError::Corruption("leaf chain points at an inner node"));
            };
            next_leaf.prev = Some(right_id.page_no);
            neighbour.store()?;
        }
        Node::Leaf(right_node).encode(right_id, right.data_mut())?;
        drop(right);
        leaf.store()?;
        tracing::trace!(
            target: "pagegrid::btree::split",
            left = left_no,
            right = right_id.page_no,
            "split leaf page"
        );
        Ok(separator)
    }
}
