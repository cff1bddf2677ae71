use std::cmp::Ordering;

use serde::Serialize;

use super::BPlusTree;
use crate::storage::btree::codecs::{KeyCodec, ValCodec};
use crate::storage::btree::page::{MetaNode, Node};
use crate::types::{GridError, Result};

/// Structure summary returned by [`BPlusTree::verify`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TreeShape {
    /// Levels from root to leaves.
    pub height: u32,
    /// Leaf pages.
    pub leaves: usize,
    /// Inner pages.
    pub inner_nodes: usize,
    /// Entries across all leaves.
    pub entries: u64,
}

struct LeafLink {
    page_no: u64,
    prev: Option<u64>,
    next: Option<u64>,
}

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Walks the whole tree and checks its invariants: node occupancy, key
    /// order, separator bounds, uniform leaf depth and the leaf chain.
    ///
    /// Holds the meta latch shared for the duration, so no new writer starts;
    /// meant for quiescent trees.
    pub fn verify(&self) -> Result<TreeShape> {
        let meta_guard = self.memory.acquire_page(self.meta)?.into_read();
        let meta = MetaNode::decode(&meta_guard)?;
        let mut shape = TreeShape {
            height: meta.height,
            ..TreeShape::default()
        };
        let mut links = Vec::new();
        let depth = self.verify_node(meta.root, None, None, true, &mut shape, &mut links)?;
        if depth != meta.height {
            return Err(GridError::Corruption("meta height disagrees with the tree"));
        }
        for (idx, link) in links.iter().enumerate() {
            let expected_prev = idx.checked_sub(1).map(|p| links[p].page_no);
            let expected_next = links.get(idx + 1).map(|l| l.page_no);
            if link.prev != expected_prev || link.next != expected_next {
                return Err(GridError::Corruption("leaf chain out of order"));
            }
        }
        if shape.entries != self.len() {
            return Err(GridError::Corruption("entry count disagrees with the tree"));
        }
        drop(meta_guard);
        Ok(shape)
    }

    fn verify_node(
        &self,
        page_no: u64,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        is_root: bool,
        shape: &mut TreeShape,
        links: &mut Vec<LeafLink>,
    ) -> Result<u32> {
        let node = {
            let handle = self.memory.acquire_page(self.page_id(page_no))?;
            let data = handle.read();
            Node::decode(&data)?
        };
        let count = node.count();
        if count > self.options.max_items {
            return Err(GridError::Corruption("node above max_items"));
        }
        if !is_root && count < self.options.min_items() {
            return Err(GridError::Corruption("node below min_items"));
        }
        let in_bounds = |key: &[u8]| {
            lower.map_or(true, |lo| Self::compare(key, lo) != Ordering::Less)
                && upper.map_or(true, |hi| Self::compare(key, hi) == Ordering::Less)
        };
        match node {
            Node::Leaf(leaf) => {
                for pair in leaf.entries.windows(2) {
                    if Self::compare(&pair[0].0, &pair[1].0) != Ordering::Less {
                        return Err(GridError::Corruption("leaf keys out of order"));
                    }
                }
                if !leaf.entries.iter().all(|(key, _)| in_bounds(key)) {
                    return Err(GridError::Corruption("leaf key outside separator bounds"));
                }
                shape.leaves += 1;
                shape.entries += leaf.entries.len() as u64;
                links.push(LeafLink {
                    page_no,
                    prev: leaf.prev,
                    next: leaf.next,
                });
                Ok(1)
            }
            Node::Inner(inner) => {
                if is_root && inner.keys.is_empty() {
                    return Err(GridError::Corruption("root inner node without separators"));
                }
                for pair in inner.keys.windows(2) {
                    if Self::compare(&pair[0], &pair[1]) != Ordering::Less {
                        return Err(GridError::Corruption("separators out of order"));
                    }
                }
                if !inner.keys.iter().all(|key| in_bounds(key)) {
                    return Err(GridError::Corruption("separator outside parent bounds"));
                }
                shape.inner_nodes += 1;
                let mut depth = None;
                for (idx, child) in inner.children.iter().enumerate() {
                    let lo = if idx == 0 {
                        lower
                    } else {
                        Some(inner.keys[idx - 1].as_slice())
                    };
                    let hi = inner.keys.get(idx).map(Vec::as_slice).or(upper);
                    let child_depth = self.verify_node(*child, lo, hi, false, shape, links)?;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) if d != child_depth => {
                            return Err(GridError::Corruption("leaves at different depths"))
                        }
                        Some(_) => {}
                    }
                }
                Ok(depth.unwrap_or(0) + 1)
            }
        }
    }
}
