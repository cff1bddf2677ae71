//! On-page layout of tree nodes and the tree meta page.
//!
//! All node kinds start with the common page header. Leaf payload:
//! `count:u16 prev:u64 next:u64` followed by `count` entries
//! `[klen:u16][vlen:u16][key][value]`. Inner payload: `count:u16 child0:u64`
//! followed by `count` records `[klen:u16][key][child:u64]`, so child `i + 1`
//! holds keys `>= key i`. Meta payload: `root:u64 height:u32 max_items:u32`.

use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{FullPageId, GridError, Result};

const COUNT_OFFSET: usize = PAGE_HDR_LEN;
const LEAF_PREV_OFFSET: usize = COUNT_OFFSET + 2;
const LEAF_NEXT_OFFSET: usize = LEAF_PREV_OFFSET + 8;
const LEAF_ENTRIES_OFFSET: usize = LEAF_NEXT_OFFSET + 8;
const INNER_CHILD0_OFFSET: usize = COUNT_OFFSET + 2;
const INNER_RECORDS_OFFSET: usize = INNER_CHILD0_OFFSET + 8;

const META_ROOT_OFFSET: usize = PAGE_HDR_LEN;
const META_HEIGHT_OFFSET: usize = META_ROOT_OFFSET + 8;
const META_MAX_ITEMS_OFFSET: usize = META_HEIGHT_OFFSET + 4;

/// Bytes a leaf with `items` entries of maximal size needs.
pub fn leaf_capacity_needed(items: usize, max_key: usize, max_value: usize) -> usize {
    LEAF_ENTRIES_OFFSET + items * (4 + max_key + max_value)
}

/// Bytes an inner node with `items` separators of maximal size needs.
pub fn inner_capacity_needed(items: usize, max_key: usize) -> usize {
    INNER_RECORDS_OFFSET + items * (2 + max_key + 8)
}

/// Decoded leaf node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Encoded key/value pairs in key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Left neighbour in the leaf chain.
    pub prev: Option<u64>,
    /// Right neighbour in the leaf chain.
    pub next: Option<u64>,
}

/// Decoded inner node; `children.len() == keys.len() + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InnerNode {
    /// Separators in ascending order.
    pub keys: Vec<Vec<u8>>,
    /// Child page numbers; child `i` holds keys below `keys[i]`.
    pub children: Vec<u64>,
}

/// A decoded tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Leaf page with entries.
    Leaf(LeafNode),
    /// Inner page with separators and children.
    Inner(InnerNode),
}

impl Node {
    /// Number of entries (leaf) or separators (inner).
    pub fn count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Inner(inner) => inner.keys.len(),
        }
    }

    /// Returns true for a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Parses a node page. Any other page kind is corruption.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match page::kind_of(buf)? {
            PageKind::BTreeLeaf => LeafNode::decode(buf).map(Node::Leaf),
            PageKind::BTreeInner => InnerNode::decode(buf).map(Node::Inner),
            _ => Err(GridError::Corruption("page is not a tree node")),
        }
    }

    /// Rewrites the whole page as this node.
    pub fn encode(&self, id: FullPageId, buf: &mut [u8]) -> Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.encode(id, buf),
            Node::Inner(inner) => inner.encode(id, buf),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(GridError::Corruption("node record out of bounds"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<usize> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize)
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        Ok(page::read_u64(raw, 0))
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .filter(|end| *end <= self.buf.len())
            .ok_or(GridError::Invalid("node does not fit in page"))?;
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn u16(&mut self, value: usize) -> Result<()> {
        let value = u16::try_from(value).map_err(|_| GridError::Invalid("length exceeds u16"))?;
        self.put(&value.to_be_bytes())
    }

    fn u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_be_bytes())
    }
}

fn start_page(id: FullPageId, kind: PageKind, buf: &mut [u8]) -> Result<()> {
    buf.fill(0);
    PageHeader::new(id, kind).encode(buf)
}

impl LeafNode {
    /// Parses a leaf page body. The header is assumed checked.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf, COUNT_OFFSET);
        let count = reader.u16()?;
        let prev = page::decode_page_no(reader.u64()?);
        let next = page::decode_page_no(reader.u64()?);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = reader.u16()?;
            let vlen = reader.u16()?;
            let key = reader.take(klen)?.to_vec();
            let value = reader.take(vlen)?.to_vec();
            entries.push((key, value));
        }
        Ok(Self {
            entries,
            prev,
            next,
        })
    }

    /// Rewrites `buf` as the leaf page `id`.
    pub fn encode(&self, id: FullPageId, buf: &mut [u8]) -> Result<()> {
        start_page(id, PageKind::BTreeLeaf, buf)?;
        let mut writer = Writer::new(buf, COUNT_OFFSET);
        writer.u16(self.entries.len())?;
        writer.u64(page::encode_page_no(self.prev))?;
        writer.u64(page::encode_page_no(self.next))?;
        for (key, value) in &self.entries {
            writer.u16(key.len())?;
            writer.u16(value.len())?;
            writer.put(key)?;
            writer.put(value)?;
        }
        Ok(())
    }
}

impl InnerNode {
    /// Parses an inner page body.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(buf, COUNT_OFFSET);
        let count = reader.u16()?;
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        children.push(reader.u64()?);
        for _ in 0..count {
            let klen = reader.u16()?;
            keys.push(reader.take(klen)?.to_vec());
            children.push(reader.u64()?);
        }
        Ok(Self { keys, children })
    }

    /// Rewrites `buf` as the inner page `id`. Fails when the child count
    /// does not match the separators.
    pub fn encode(&self, id: FullPageId, buf: &mut [u8]) -> Result<()> {
        if self.children.len() != self.keys.len() + 1 {
            return Err(GridError::Invalid("inner node child count mismatch"));
        }
        start_page(id, PageKind::BTreeInner, buf)?;
        let mut writer = Writer::new(buf, COUNT_OFFSET);
        writer.u16(self.keys.len())?;
        writer.u64(self.children[0])?;
        for (key, child) in self.keys.iter().zip(&self.children[1..]) {
            writer.u16(key.len())?;
            writer.put(key)?;
            writer.u64(*child)?;
        }
        Ok(())
    }
}

/// The stable root slot of a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaNode {
    /// Page number of the current root.
    pub root: u64,
    /// Levels from root to leaves; 1 for a lone root leaf.
    pub height: u32,
    /// `max_items` the tree was created with.
    pub max_items: u32,
}

impl MetaNode {
    /// Parses a tree meta page.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if page::kind_of(buf)? != PageKind::Meta {
            return Err(GridError::Corruption("page is not a tree meta page"));
        }
        Ok(Self {
            root: page::read_u64(buf, META_ROOT_OFFSET),
            height: page::read_u32(buf, META_HEIGHT_OFFSET),
            max_items: page::read_u32(buf, META_MAX_ITEMS_OFFSET),
        })
    }

    /// Rewrites `buf` as the meta page `id`.
    pub fn encode(&self, id: FullPageId, buf: &mut [u8]) -> Result<()> {
        start_page(id, PageKind::Meta, buf)?;
        buf[META_ROOT_OFFSET..META_ROOT_OFFSET + 8].copy_from_slice(&self.root.to_be_bytes());
        buf[META_HEIGHT_OFFSET..META_HEIGHT_OFFSET + 4].copy_from_slice(&self.height.to_be_bytes());
        buf[META_MAX_ITEMS_OFFSET..META_MAX_ITEMS_OFFSET + 4]
            .copy_from_slice(&self.max_items.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupId;

    const ID: FullPageId = FullPageId::new(GroupId(1), 12);

    #[test]
    fn leaf_layout_roundtrip() -> Result<()> {
        let leaf = LeafNode {
            entries: vec![(b"a".to_vec(), b"one".to_vec()), (b"bb".to_vec(), vec![])],
            prev: None,
            next: Some(44),
        };
        let mut buf = vec![0xFFu8; 512];
        leaf.encode(ID, &mut buf)?;
        assert_eq!(Node::decode(&buf)?, Node::Leaf(leaf));
        Ok(())
    }

    #[test]
    fn inner_layout_roundtrip() -> Result<()> {
        let inner = InnerNode {
            keys: vec![b"m".to_vec(), b"t".to_vec()],
            children: vec![3, 4, 5],
        };
        let mut buf = vec![0u8; 512];
        Node::Inner(inner.clone()).encode(ID, &mut buf)?;
        let node = Node::decode(&buf)?;
        assert_eq!(node.count(), 2);
        assert_eq!(node, Node::Inner(inner));
        Ok(())
    }

    #[test]
    fn oversized_nodes_are_rejected() {
        let leaf = LeafNode {
            entries: vec![(vec![1u8; 300], vec![2u8; 300])],
            ..LeafNode::default()
        };
        let mut buf = vec![0u8; 512];
        assert!(matches!(leaf.encode(ID, &mut buf), Err(GridError::Invalid(_))));
    }

    #[test]
    fn foreign_pages_are_not_nodes() -> Result<()> {
        let mut buf = vec![0u8; 512];
        assert!(Node::decode(&buf).is_err());
        let meta = MetaNode {
            root: 9,
            height: 2,
            max_items: 32,
        };
        meta.encode(ID, &mut buf)?;
        assert!(Node::decode(&buf).is_err());
        assert_eq!(MetaNode::decode(&buf)?, meta);
        Ok(())
    }
}
