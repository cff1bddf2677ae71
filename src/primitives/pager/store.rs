use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{FullPageId, GridError, GroupId, Result};

/// Backing storage that evicted and checkpointed pages are written to.
pub trait PageStore: Send + Sync + 'static {
    /// Persists a full page image. `tag` is the low half of the page version.
    fn write_back(&self, id: FullPageId, page: &[u8], tag: u32) -> Result<()>;

    /// Reads a page image into `dst`. Returns false when the page was never
    /// stored.
    fn read_page(&self, id: FullPageId, dst: &mut [u8]) -> Result<bool>;

    /// Forgets a freed page.
    fn discard(&self, _id: FullPageId) -> Result<()> {
        Ok(())
    }

    /// First page number the group has never used.
    fn next_page_no(&self, _group: GroupId) -> Result<u64> {
        Ok(0)
    }

    /// Makes previous writes durable.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Heap-backed store used by tests and ephemeral grids.
///
/// Writes can be made to fail on demand to exercise eviction failure paths.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<FxHashMap<FullPageId, (Box<[u8]>, u32)>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryPageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write-back fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful write-backs.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of pages read back.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of stored pages.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns true if nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tag recorded with the last write of `id`.
    pub fn tag_of(&self, id: FullPageId) -> Option<u32> {
        self.pages.lock().get(&id).map(|(_, tag)| *tag)
    }
}

impl PageStore for MemoryPageStore {
    fn write_back(&self, id: FullPageId, page: &[u8], tag: u32) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GridError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write-back failure",
            )));
        }
        self.pages.lock().insert(id, (page.into(), tag));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_page(&self, id: FullPageId, dst: &mut [u8]) -> Result<bool> {
        let pages = self.pages.lock();
        let Some((image, _)) = pages.get(&id) else {
            return Ok(false);
        };
        if image.len() != dst.len() {
            return Err(GridError::Corruption("stored page size mismatch"));
        }
        dst.copy_from_slice(image);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn discard(&self, id: FullPageId) -> Result<()> {
        self.pages.lock().remove(&id);
        Ok(())
    }

    fn next_page_no(&self, group: GroupId) -> Result<u64> {
        Ok(self
            .pages
            .lock()
            .keys()
            .filter(|id| id.group == group)
            .map(|id| id.page_no + 1)
            .max()
            .unwrap_or(0))
    }
}

/// One file per group under a directory; page `n` lives at `n * page_size`.
///
/// Discarded pages are overwritten with zeros and read back as unused pages.
pub struct FilePageStore {
    dir: PathBuf,
    page_size: usize,
    files: Mutex<FxHashMap<GroupId, Arc<dyn FileIo>>>,
}

impl FilePageStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), page_size, "store.file.open");
        Ok(Self {
            dir,
            page_size: page_size as usize,
            files: Mutex::new(FxHashMap::default()),
        })
    }

    /// Directory holding the group files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_path(&self, group: GroupId) -> PathBuf {
        self.dir.join(format!("group-{}.pages", group.0))
    }

    fn file(&self, group: GroupId) -> Result<Arc<dyn FileIo>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&group) {
            return Ok(Arc::clone(file));
        }
        let file: Arc<dyn FileIo> = Arc::new(StdFileIo::open(self.group_path(group))?);
        files.insert(group, Arc::clone(&file));
        Ok(file)
    }

    fn offset(&self, page_no: u64) -> Result<u64> {
        page_no
            .checked_mul(self.page_size as u64)
            .ok_or(GridError::Invalid("page offset overflow"))
    }
}

impl PageStore for FilePageStore {
    fn write_back(&self, id: FullPageId, page: &[u8], _tag: u32) -> Result<()> {
        if page.len() != self.page_size {
            return Err(GridError::Invalid("page image size mismatch"));
        }
        self.file(id.group)?.write_at(self.offset(id.page_no)?, page)
    }

    fn read_page(&self, id: FullPageId, dst: &mut [u8]) -> Result<bool> {
        let file = self.file(id.group)?;
        let off = self.offset(id.page_no)?;
        if off + dst.len() as u64 > file.len()? {
            return Ok(false);
        }
        file.read_at(off, dst)?;
        Ok(true)
    }

    fn discard(&self, id: FullPageId) -> Result<()> {
        let file = self.file(id.group)?;
        let off = self.offset(id.page_no)?;
        if off < file.len()? {
            file.write_at(off, &vec![0u8; self.page_size])?;
        }
        Ok(())
    }

    fn next_page_no(&self, group: GroupId) -> Result<u64> {
        Ok(self.file(group)?.len()? / self.page_size as u64)
    }

    fn sync(&self) -> Result<()> {
        let files: Vec<_> = self.files.lock().values().cloned().collect();
        for file in files {
            file.sync_all()?;
        }
        Ok(())
    }
}
