#![forbid(unsafe_code)]

//! Identifiers, the error taxonomy and the common page header.

use std::fmt;

/// Page checksum helpers.
pub mod checksum;

pub use checksum::page_crc32;

/// Identifier of a page group (one index, one cache partition, ...).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GroupId(pub u32);

/// Logical identifier of a page: owning group plus page number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FullPageId {
    /// Group the page belongs to.
    pub group: GroupId,
    /// Page number, unique within the group.
    pub page_no: u64,
}

impl FullPageId {
    /// Builds an identifier from its parts.
    pub const fn new(group: GroupId, page_no: u64) -> Self {
        Self { group, page_no }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FullPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group.0, self.page_no)
    }
}

/// Coarse classification of a [`GridError`].
///
/// Operators use it to tell "add capacity" apart from "investigate corruption".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Memory or page capacity is exhausted.
    Capacity,
    /// A page identifier is unknown.
    NotFound,
    /// The page store failed.
    Io,
    /// A blocking wait was interrupted.
    Interrupted,
    /// On-page data is inconsistent.
    Consistency,
    /// The caller violated an API precondition.
    Usage,
}

/// Errors produced by the page storage core.
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    /// A segment is full and no page could be evicted, or allocation was denied.
    #[error("out of page memory: {0}")]
    OutOfMemory(&'static str),
    /// The page is neither resident nor known to the page store.
    #[error("page not found: {0}")]
    PageNotFound(FullPageId),
    /// Page store I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A blocking wait ended before its condition held.
    #[error("wait interrupted")]
    InterruptedWait,
    /// Page content failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Invalid argument or violated precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl GridError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::OutOfMemory(_) => ErrorKind::Capacity,
            GridError::PageNotFound(_) => ErrorKind::NotFound,
            GridError::Io(_) => ErrorKind::Io,
            GridError::InterruptedWait => ErrorKind::Interrupted,
            GridError::Corruption(_) => ErrorKind::Consistency,
            GridError::Invalid(_) => ErrorKind::Usage,
        }
    }

    /// Returns true for capacity exhaustion.
    pub fn is_capacity(&self) -> bool {
        self.kind() == ErrorKind::Capacity
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GridError>;

pub mod page {
    //! Common header shared by every page kind.

    use core::convert::{TryFrom, TryInto};

    use super::{FullPageId, GridError, GroupId, Result};

    /// Magic bytes at the start of every initialized page.
    pub const PAGE_MAGIC: [u8; 4] = *b"PGRD";
    /// Current header format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 512;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: u32 = 65536;
    /// Length of the common header.
    pub const PAGE_HDR_LEN: usize = 32;
    /// Sentinel stored in page-number fields meaning "no page".
    pub const NO_PAGE: u64 = u64::MAX;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// `PAGE_MAGIC` bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Big-endian header format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// [`super::PageKind`] tag.
        pub const PAGE_KIND: usize = 6;
        /// Always zero.
        pub const RESERVED: usize = 7;
        /// Owning group id.
        pub const GROUP: Range<usize> = 8..12;
        /// Page number within the group.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// Version stamped at write-back.
        pub const VERSION: Range<usize> = 20..28;
        /// crc32 of the page with this field zeroed.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Page type tag.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Freshly allocated or reclaimed page without content.
        Unused = 0,
        /// Tree meta page holding the root slot.
        Meta = 1,
        /// Page parked in the reuse list.
        Reuse = 2,
        /// B+Tree leaf node.
        BTreeLeaf = 3,
        /// B+Tree inner node.
        BTreeInner = 4,
        /// Opaque caller payload.
        Data = 5,
        /// Reuse list bucket table.
        ReuseMeta = 6,
    }

    impl PageKind {
        /// Returns the on-page tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = GridError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                0 => Ok(PageKind::Unused),
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::Reuse),
                3 => Ok(PageKind::BTreeLeaf),
                4 => Ok(PageKind::BTreeInner),
                5 => Ok(PageKind::Data),
                6 => Ok(PageKind::ReuseMeta),
                _ => Err(GridError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded common header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Header format version.
        pub format_version: u16,
        /// Page type.
        pub kind: PageKind,
        /// Identifier the page was written for.
        pub id: FullPageId,
        /// Structure version counter at the time the header was written.
        pub version: u64,
        /// Checksum over the full page with this field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Creates a header for `id` with a zero version and checksum.
        pub fn new(id: FullPageId, kind: PageKind) -> Self {
            Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                id,
                version: 0,
                crc32: 0,
            }
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(GridError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::GROUP].copy_from_slice(&self.id.group.0.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.id.page_no.to_be_bytes());
            hdr[header::VERSION].copy_from_slice(&self.version.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Parses and validates a header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(GridError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(GridError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(
                hdr[header::FORMAT_VERSION]
                    .try_into()
                    .map_err(|_| GridError::Corruption("page header truncated"))?,
            );
            if format_version != PAGE_FORMAT_VERSION {
                return Err(GridError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(GridError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let group = GroupId(read_u32(hdr, header::GROUP.start));
            let page_no = read_u64(hdr, header::PAGE_NO.start);
            let version = read_u64(hdr, header::VERSION.start);
            let crc32 = read_u32(hdr, header::CRC32.start);
            Ok(Self {
                format_version,
                kind,
                id: FullPageId::new(group, page_no),
                version,
                crc32,
            })
        }
    }

    /// Returns true when the page starts with the header magic.
    pub fn is_initialized(buf: &[u8]) -> bool {
        buf.len() >= PAGE_HDR_LEN && buf[header::MAGIC] == PAGE_MAGIC
    }

    /// Reads the kind tag of an initialized page, `Unused` otherwise.
    pub fn kind_of(buf: &[u8]) -> Result<PageKind> {
        if !is_initialized(buf) {
            return Ok(PageKind::Unused);
        }
        PageKind::try_from(buf[header::PAGE_KIND])
    }

    /// Zeroes the checksum field.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(GridError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Stores the structure version into an initialized header.
    pub fn stamp_version(buf: &mut [u8], version: u64) {
        if is_initialized(buf) {
            buf[header::VERSION].copy_from_slice(&version.to_be_bytes());
        }
    }

    /// Reads a big-endian `u32` at `off`.
    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&buf[off..off + 4]);
        u32::from_be_bytes(arr)
    }

    /// Reads a big-endian `u64` at `off`.
    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[off..off + 8]);
        u64::from_be_bytes(arr)
    }

    /// Encodes an optional page number using [`NO_PAGE`] as the sentinel.
    pub fn encode_page_no(page_no: Option<u64>) -> u64 {
        page_no.unwrap_or(NO_PAGE)
    }

    /// Decodes a page number written by [`encode_page_no`].
    pub fn decode_page_no(raw: u64) -> Option<u64> {
        (raw != NO_PAGE).then_some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::page::{self, PageHeader, PageKind};
    use super::{ErrorKind, FullPageId, GridError, GroupId};
    use std::convert::TryFrom;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; page::PAGE_HDR_LEN];
        let mut header = PageHeader::new(FullPageId::new(GroupId(7), 42), PageKind::BTreeLeaf);
        header.version = 11;
        header.crc32 = 0xDEAD_BEEF;
        header.encode(&mut buf).unwrap();
        assert_eq!(PageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn uninitialized_page_reports_unused() {
        let buf = [0u8; 64];
        assert!(!page::is_initialized(&buf));
        assert_eq!(page::kind_of(&buf).unwrap(), PageKind::Unused);
        assert!(PageHeader::decode(&buf).is_err());
    }

    #[test]
    fn clear_crc32_zeroes_field() {
        let mut buf = [0xFFu8; page::PAGE_HDR_LEN];
        page::clear_crc32(&mut buf).unwrap();
        assert!(buf[page::header::CRC32].iter().all(|&b| b == 0));
    }

    #[test]
    fn page_kind_from_u8_rejects_unknown() {
        assert!(PageKind::try_from(200).is_err());
    }

    #[test]
    fn error_kinds_separate_capacity_from_corruption() {
        assert_eq!(GridError::OutOfMemory("full").kind(), ErrorKind::Capacity);
        assert!(GridError::OutOfMemory("full").is_capacity());
        assert_eq!(
            GridError::Corruption("bad").kind(),
            ErrorKind::Consistency
        );
        assert!(!GridError::Corruption("bad").is_capacity());
    }
}
