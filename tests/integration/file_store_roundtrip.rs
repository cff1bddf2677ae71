#![allow(missing_docs)]

use std::sync::Arc;

use tempfile::tempdir;

use pagegrid::primitives::concurrency::CheckpointLock;
use pagegrid::primitives::pager::{FilePageStore, PageMemory, PageMemoryOptions, PageStore};
use pagegrid::storage::btree::{BPlusTree, BTreeOptions};
use pagegrid::storage::reuse::ReuseList;
use pagegrid::types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use pagegrid::{FullPageId, GridConfig, GridError, GroupId, Result};

const GROUP: GroupId = GroupId(5);

fn open_memory(dir: &std::path::Path, config: &GridConfig) -> Result<Arc<PageMemory>> {
    let store = Arc::new(FilePageStore::open(dir, config.pager.page_size)?);
    let memory = PageMemory::new(config.pager.clone(), store, Arc::new(CheckpointLock::new()))?;
    memory.start()?;
    Ok(Arc::new(memory))
}

fn config() -> GridConfig {
    GridConfig::from_toml_str(
        r#"
        [pager]
        page_size = 1024
        segments = 2
        pages_per_segment = 16

        [btree]
        max_items = 8
        max_key_len = 16
        max_value_len = 16
        "#,
    )
    .expect("valid config")
}

#[test]
fn tree_survives_checkpoint_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let config = config();
    let (meta, reuse_meta, parked) = {
        let memory = open_memory(dir.path(), &config)?;
        let reuse = Arc::new(ReuseList::create(memory.clone(), GROUP, config.reuse.clone())?);
        let tree =
            BPlusTree::<Vec<u8>, u64>::create(memory.clone(), reuse.clone(), config.btree.clone())?;
        for n in 0u64..600 {
            tree.put(&format!("key-{n:05}").into_bytes(), &n)?;
        }
        for n in (0u64..600).step_by(4) {
            tree.remove(&format!("key-{n:05}").into_bytes())?;
        }
        assert!(memory.stats().evictions > 0);
        memory.checkpoint()?;
        memory.stop()?;
        (tree.meta_page(), reuse.meta_page(), reuse.len())
    };

    let memory = open_memory(dir.path(), &config)?;
    let reuse = Arc::new(ReuseList::open(memory.clone(), reuse_meta, config.reuse.clone())?);
    assert_eq!(reuse.len(), parked);
    let tree = BPlusTree::<Vec<u8>, u64>::open(memory.clone(), reuse, meta, config.btree.clone())?;
    assert_eq!(tree.len(), 450);
    assert_eq!(tree.get(&b"key-00001".to_vec())?, Some(1));
    assert_eq!(tree.get(&b"key-00004".to_vec())?, None);
    let first = tree.first()?.expect("non-empty tree");
    assert_eq!(first.0, b"key-00001".to_vec());
    tree.verify()?;
    assert!(memory.stats().misses > 0);
    Ok(())
}

#[test]
fn corrupted_page_is_detected_on_fault_in() -> Result<()> {
    let dir = tempdir()?;
    let config = config();
    let id = {
        let memory = open_memory(dir.path(), &config)?;
        let id = memory.allocate_page(GROUP)?;
        {
            let _cp = memory.checkpoint_lock().read();
            let mut guard = memory.acquire_page(id)?.into_write()?;
            PageHeader::new(id, PageKind::Data).encode(guard.data_mut())?;
            guard.data_mut()[PAGE_HDR_LEN] = 0x42;
        }
        assert_eq!(memory.checkpoint()?, 1);
        id
    };

    let store = FilePageStore::open(dir.path(), config.pager.page_size)?;
    let mut image = vec![0u8; config.pager.page_size as usize];
    assert!(store.read_page(id, &mut image)?);
    assert_eq!(image[PAGE_HDR_LEN], 0x42);
    image[PAGE_HDR_LEN] = 0x43;
    store.write_back(id, &image, 0)?;

    let memory = open_memory(dir.path(), &config)?;
    assert!(matches!(
        memory.acquire_page(id),
        Err(GridError::Corruption(_))
    ));
    let unknown = FullPageId::new(GROUP, 99);
    assert!(matches!(
        memory.acquire_page(unknown),
        Err(GridError::PageNotFound(_))
    ));
    Ok(())
}
