use std::cmp::Ordering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Bound;

use super::codecs::{KeyCodec, ValCodec};
use super::tree::{BPlusTree, Seek};
use crate::types::{GridError, Result};

#[derive(Clone, Debug)]
enum EncodedBound {
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

impl EncodedBound {
    fn from_bound<K: KeyCodec>(bound: Bound<&K>) -> Self {
        let encode = |key: &K| {
            let mut buf = Vec::new();
            K::encode_key(key, &mut buf);
            buf
        };
        match bound {
            Bound::Unbounded => EncodedBound::Unbounded,
            Bound::Included(key) => EncodedBound::Included(encode(key)),
            Bound::Excluded(key) => EncodedBound::Excluded(encode(key)),
        }
    }

    fn key_bytes(&self) -> Option<&[u8]> {
        match self {
            EncodedBound::Unbounded => None,
            EncodedBound::Included(bytes) | EncodedBound::Excluded(bytes) => Some(bytes),
        }
    }

    fn range_is_empty<K: KeyCodec>(lower: &EncodedBound, upper: &EncodedBound) -> bool {
        let (Some(lo), Some(hi)) = (lower.key_bytes(), upper.key_bytes()) else {
            return false;
        };
        match K::compare_encoded(lo, hi) {
            Ordering::Greater => true,
            Ordering::Equal => !matches!(
                (lower, upper),
                (EncodedBound::Included(_), EncodedBound::Included(_))
            ),
            Ordering::Less => false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct LeafPosition {
    page_no: u64,
    version: u64,
    next: Option<u64>,
}

/// Resumable position of a range scan.
///
/// Holds no pins: between refills it only remembers the last leaf with its
/// version and the last key returned, so it survives concurrent splits and
/// merges by re-descending from that key.
#[derive(Clone, Debug)]
pub struct ScanState {
    lower: EncodedBound,
    upper: EncodedBound,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    leaf: Option<LeafPosition>,
    last: Option<Vec<u8>>,
    done: bool,
}

impl ScanState {
    /// Starts a scan over `[from, to]` with [`Bound`] semantics.
    pub fn new<K: KeyCodec>(from: Bound<&K>, to: Bound<&K>) -> Self {
        let lower = EncodedBound::from_bound(from);
        let upper = EncodedBound::from_bound(to);
        let done = EncodedBound::range_is_empty::<K>(&lower, &upper);
        Self {
            lower,
            upper,
            buffer: VecDeque::new(),
            leaf: None,
            last: None,
            done,
        }
    }

    /// Returns true once the scan returned its last entry.
    pub fn is_done(&self) -> bool {
        self.done && self.buffer.is_empty()
    }
}

impl<K: KeyCodec, V: ValCodec> BPlusTree<K, V> {
    /// Iterates entries in `[from, to]` with [`Bound`] semantics.
    pub fn iter_range(&self, from: Bound<&K>, to: Bound<&K>) -> RangeIter<'_, K, V> {
        RangeIter {
            tree: self,
            state: ScanState::new::<K>(from, to),
            failed: false,
            _marker: PhantomData,
        }
    }

    /// Iterates all entries in key order.
    pub fn iter(&self) -> RangeIter<'_, K, V> {
        self.iter_range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Advances `state` by one entry.
    pub fn scan_next(&self, state: &mut ScanState) -> Result<Option<(K, V)>> {
        match self.scan_next_raw(state)? {
            Some((key, value)) => Ok(Some((K::decode_key(&key)?, V::decode_val(&value)?))),
            None => Ok(None),
        }
    }

    pub(crate) fn scan_next_raw(
        &self,
        state: &mut ScanState,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if state.buffer.is_empty() {
            self.refill(state)?;
        }
        let Some((key, value)) = state.buffer.pop_front() else {
            return Ok(None);
        };
        state.last = Some(key.clone());
        Ok(Some((key, value)))
    }

    /// Loads the next leaf with entries in range into the buffer.
    fn refill(&self, state: &mut ScanState) -> Result<()> {
        while !state.done && state.buffer.is_empty() {
            let snapshot = match state.leaf {
                None => {
                    let seek = match (&state.last, state.lower.key_bytes()) {
                        (Some(last), _) => Seek::Key(last),
                        (None, Some(lower)) => Seek::Key(lower),
                        (None, None) => Seek::First,
                    };
                    self.find_leaf(seek)?
                }
                Some(position) => {
                    let Some(next) = position.next else {
                        state.done = true;
                        break;
                    };
                    // Read the successor first, then confirm the current leaf
                    // is untouched: the successor can only be freed by merging
                    // it into the current leaf, which changes its version.
                    let successor = self.read_leaf(next)?;
                    if !self.leaf_unchanged(position.page_no, position.version)? {
                        self.note_cursor_reseek();
                        state.leaf = None;
                        continue;
                    }
                    successor.ok_or(GridError::Corruption("leaf chain points at a non-leaf"))?
                }
            };
            state.leaf = Some(LeafPosition {
                page_no: snapshot.id.page_no,
                version: snapshot.version,
                next: snapshot.leaf.next,
            });
            for (key, value) in snapshot.leaf.entries {
                if !self.after_start(state, &key) {
                    continue;
                }
                if self.past_end(state, &key) {
                    state.done = true;
                    break;
                }
                state.buffer.push_back((key, value));
            }
        }
        Ok(())
    }

    fn after_start(&self, state: &ScanState, key: &[u8]) -> bool {
        if let Some(last) = &state.last {
            return Self::compare(key, last) == Ordering::Greater;
        }
        match &state.lower {
            EncodedBound::Unbounded => true,
            EncodedBound::Included(bound) => Self::compare(key, bound) != Ordering::Less,
            EncodedBound::Excluded(bound) => Self::compare(key, bound) == Ordering::Greater,
        }
    }

    fn past_end(&self, state: &ScanState, key: &[u8]) -> bool {
        match &state.upper {
            EncodedBound::Unbounded => false,
            EncodedBound::Included(bound) => Self::compare(key, bound) == Ordering::Greater,
            EncodedBound::Excluded(bound) => Self::compare(key, bound) != Ordering::Less,
        }
    }
}

/// Iterator over a key range; see [`BPlusTree::iter_range`].
///
/// Keys come out strictly increasing even while other threads modify the
/// tree. Stops after the first error.
pub struct RangeIter<'a, K: KeyCodec, V: ValCodec> {
    tree: &'a BPlusTree<K, V>,
    state: ScanState,
    failed: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyCodec, V: ValCodec> RangeIter<'_, K, V> {
    pub(crate) fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree.scan_next_raw(&mut self.state)
    }
}

impl<K: KeyCodec, V: ValCodec> Iterator for RangeIter<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.tree.scan_next(&mut self.state) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
