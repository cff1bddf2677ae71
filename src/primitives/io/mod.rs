#![forbid(unsafe_code)]

//! Positioned file I/O used by the file-backed page store.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use crate::types::{GridError, Result};

/// Positioned reads and writes against a single file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from offset `off`; fails on a short file.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at offset `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(file),
        })
    }
}

#[cfg(unix)]
fn read_chunk(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(dst, off)
}

#[cfg(unix)]
fn write_chunk(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(src, off)
}

#[cfg(windows)]
fn read_chunk(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(dst, off)
}

#[cfg(windows)]
fn write_chunk(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(src, off)
}

#[cfg(not(any(unix, windows)))]
fn read_chunk(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_chunk(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned writes unsupported on this platform",
    ))
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = read_chunk(&self.inner, dst, off)?;
            if read == 0 {
                return Err(GridError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "positioned read reached EOF",
                )));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = write_chunk(&self.inner, src, off)?;
            if written == 0 {
                return Err(GridError::Io(io::Error::new(
                    ErrorKind::WriteZero,
                    "positioned write made no progress",
                )));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }
}
