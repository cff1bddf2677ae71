use serde::{Deserialize, Serialize};

use crate::types::{page, GridError, Result};

/// Configuration for [`super::PageMemory`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PageMemoryOptions {
    /// Size of each page in bytes; a power of two.
    pub page_size: u32,
    /// Number of independently locked segments.
    pub segments: usize,
    /// Number of page slots per segment.
    pub pages_per_segment: usize,
    /// Verify page checksums when faulting pages in.
    pub verify_checksums: bool,
}

impl Default for PageMemoryOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            segments: 4,
            pages_per_segment: 1024,
            verify_checksums: true,
        }
    }
}

impl PageMemoryOptions {
    /// Checks the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(GridError::Invalid("page size must be a power of two"));
        }
        if self.page_size < page::MIN_PAGE_SIZE || self.page_size > page::MAX_PAGE_SIZE {
            return Err(GridError::Invalid("page size out of range"));
        }
        if self.segments == 0 {
            return Err(GridError::Invalid("segment count must be non-zero"));
        }
        if self.pages_per_segment == 0 {
            return Err(GridError::Invalid("segment capacity must be non-zero"));
        }
        Ok(())
    }

    /// Total number of page slots across all segments.
    pub fn total_pages(&self) -> usize {
        self.segments.saturating_mul(self.pages_per_segment)
    }
}
