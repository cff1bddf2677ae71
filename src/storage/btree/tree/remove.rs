use std::sync::atomic::Ordering as AtomicOrdering;

use super::insert::{WriteMode, WritePath};
use super::{BPlusTree, Latched};
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::Node;
use crate::types::{GridError, Result};

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let key = Self::encode_key(key);
        let _cp = self.memory.checkpoint_lock().read();
        let mut path = self.descend_for_write(&key, WriteMode::Remove)?;
        let mut leaf = path
            .stack
            .pop()
            .ok_or(GridError::Corruption("write descent ended without a leaf"))?;
        let Node::Leaf(node) = &mut leaf.node else {
            return Err(GridError::Corruption("write descent ended on an inner node"));
        };
        let Ok(pos) = Self::search_leaf(node, &key) else {
            return Ok(None);
        };
        let (_, value) = node.entries.remove(pos);
        let underfull = node.entries.len() < self.options.min_items();
        leaf.store()?;
        self.len.fetch_sub(1, AtomicOrdering::AcqRel);
        // An empty stack means the leaf was safe or is the root.
        if underfull && !path.stack.is_empty() {
            self.rebalance(path, leaf)?;
        }
        Ok(Some(V::decode_val(&value)?))
    }

    /// Restores occupancy of the underfull, already stored `node` by borrowing
    /// from or merging with a sibling, walking up while parents underflow.
    fn rebalance(&self, mut path: WritePath, mut node: Latched) -> Result<()> {
        let min = self.options.min_items();
        loop {
            let mut parent = path
                .stack
                .pop()
                .ok_or(GridError::Corruption("underflow without a latched parent"))?;
            let slot = parent.slot;
            let Node::Inner(inner) = &parent.node else {
                return Err(GridError::Corruption("leaf found above another node"));
            };
            let (mut left, mut right, sep) = if slot > 0 {
                let left_no = inner.children[slot - 1];
                // Siblings are latched left to right: release the node, latch
                // its left sibling, then latch the node again and re-read it.
                let node_no = node.page_no();
                drop(node);
                let left = self.latch(left_no)?;
                (left, self.latch(node_no)?, slot - 1)
            } else {
                let right_no = *inner
                    .children
                    .get(1)
                    .ok_or(GridError::Corruption("inner node with a single child"))?;
                (node, self.latch(right_no)?, 0)
            };
            let underfull_is_left = slot == 0;
            let donor = if underfull_is_left { &right } else { &left };
            if donor.node.count() > min {
                self.borrow(&mut parent, &mut left, &mut right, sep, underfull_is_left)?;
                left.store()?;
                right.store()?;
                parent.store()?;
                self.stats.inc_borrows();
                return Ok(());
            }

            self.merge(&mut parent, &mut left, right, sep)?;
            left.store()?;
            drop(left);

            let parent_count = parent.node.count();
            if path.stack.is_empty() {
                if path.meta.is_some() && parent_count == 0 {
                    return self.collapse_root(&mut path, parent);
                }
                return parent.store();
            }
            parent.store()?;
            if parent_count >= min {
                return Ok(());
            }
            node = parent;
        }
    }

    fn borrow(
        &self,
        parent: &mut Latched,
        left: &mut Latched,
        right: &mut Latched,
        sep: usize,
        underfull_is_left: bool,
    ) -> Result<()> {
        let Node::Inner(up) = &mut parent.node else {
            return Err(GridError::Corruption("leaf found above another node"));
        };
        match (&mut left.node, &mut right.node) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                if underfull_is_left {
                    let moved = r.entries.remove(0);
                    l.entries.push(moved);
                } else {
                    let moved = l
                        .entries
                        .pop()
                        .ok_or(GridError::Corruption("borrow from an empty leaf"))?;
                    r.entries.insert(0, moved);
                }
                up.keys[sep] = r.entries[0].0.clone();
            }
            (Node::Inner(l), Node::Inner(r)) => {
                if underfull_is_left {
                    l.keys.push(std::mem::take(&mut up.keys[sep]));
                    l.children.push(r.children.remove(0));
                    up.keys[sep] = r.keys.remove(0);
                } else {
                    let child = l
                        .children
                        .pop()
                        .ok_or(GridError::Corruption("borrow from an empty inner node"))?;
                    let key = l
                        .keys
                        .pop()
                        .ok_or(GridError::Corruption("borrow from an empty inner node"))?;
                    r.keys.insert(0, std::mem::replace(&mut up.keys[sep], key));
                    r.children.insert(0, child);
                }
            }
            _ => return Err(GridError::Corruption("siblings of different kinds")),
        }
        tracing::trace!(
            target: "pagegrid::btree::merge",
            left = left.page_no(),
            right = right.page_no(),
            "borrowed from sibling"
        );
        Ok(())
    }

    /// Moves everything from `right` into `left`, drops the separator from
    /// the parent and recycles the emptied page.
    fn merge(
        &self,
        parent: &mut Latched,
        left: &mut Latched,
        mut right: Latched,
        sep: usize,
    ) -> Result<()> {
        let left_no = left.page_no();
        let right_no = right.page_no();
        let Node::Inner(up) = &mut parent.node else {
            return Err(GridError::Corruption("leaf found above another node"));
        };
        let separator = up.keys.remove(sep);
        up.children.remove(sep + 1);
        match (&mut left.node, &mut right.node) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                l.entries.append(&mut r.entries);
                l.next = r.next;
                if let Some(next_no) = r.next {
                    let mut neighbour = self.latch(next_no)?;
                    let Node::Leaf(next_leaf) = &mut neighbour.node else {
                        return Err(GridError::Corruption("leaf chain points at an inner node"));
                    };
                    next_leaf.prev = Some(left_no);
                    neighbour.store()?;
                }
                self.stats.inc_leaf_merges();
            }
            (Node::Inner(l), Node::Inner(r)) => {
                l.keys.push(separator);
                l.keys.append(&mut r.keys);
                l.children.append(&mut r.children);
                self.stats.inc_inner_merges();
            }
            _ => return Err(GridError::Corruption("siblings of different kinds")),
        }
        self.reuse.recycle(right.guard)?;
        tracing::trace!(
            target: "pagegrid::btree::merge",
            left = left_no,
            right = right_no,
            "merged right sibling into left"
        );
        Ok(())
    }

    /// Replaces a root inner node left without separators by its only child.
    fn collapse_root(&self, path: &mut WritePath, root: Latched) -> Result<()> {
        let Node::Inner(inner) = &root.node else {
            return Err(GridError::Corruption("collapsing a leaf root"));
        };
        let child = inner.children[0];
        let old_root = root.page_no();
        {
            let (_, meta) = path
                .meta
                .as_mut()
                .ok_or(GridError::Corruption("root collapse without the meta latch"))?;
            meta.root = child;
            meta.height = meta.height.saturating_sub(1);
        }
        path.store_meta()?;
        self.reuse.recycle(root.guard)?;
        self.stats.inc_root_collapses();
        tracing::debug!(
            target: "pagegrid::btree::merge",
            old_root,
            new_root = child,
            "btree.root_collapse"
        );
        Ok(())
    }
}
