use std::cmp::Ordering;

use crate::types::{FullPageId, GridError, GroupId, Result};

/// Key types stored in the tree in an order-preserving byte form.
pub trait KeyCodec: Sized {
    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering;

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Value types stored in the tree.
pub trait ValCodec: Sized {
    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

fn fixed<const N: usize>(bytes: &[u8], what: &'static str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| GridError::Corruption(what))
}

impl KeyCodec for u64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed(bytes, "u64 key length mismatch")?))
    }
}

// Sign bit flipped so the big-endian bytes sort like the integers.
impl KeyCodec for i64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&((*key as u64) ^ (1 << 63)).to_be_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        let raw = u64::from_be_bytes(fixed(bytes, "i64 key length mismatch")?);
        Ok((raw ^ (1 << 63)) as i64)
    }
}

impl KeyCodec for Vec<u8> {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for u64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed(src, "u64 value length mismatch")?))
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl ValCodec for FullPageId {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.group.0.to_be_bytes());
        out.extend_from_slice(&value.page_no.to_be_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        if src.len() != 12 {
            return Err(GridError::Corruption("page id value length mismatch"));
        }
        let group = u32::from_be_bytes(fixed(&src[..4], "page id value length mismatch")?);
        let page_no = u64::from_be_bytes(fixed(&src[4..], "page id value length mismatch")?);
        Ok(FullPageId::new(GroupId(group), page_no))
    }
}
