use std::sync::Arc;

use small_db::{
    btree::{default_comparator, BTree},
    buffer_pool::{mfp::MfpFlags, BufferPool},
    lock::{LatchLockManager, LockManager},
    page::metadata::MetadataPage,
};

/// Open a fresh single-value B-tree over its own temp file and buffer
/// pool, the way every scenario test in this crate starts.
pub fn open_tree(dir: &tempfile::TempDir, name: &str, page_size: usize) -> Arc<BTree> {
    open_tree_with(dir, name, page_size, false)
}

/// Same, but with duplicate-key support enabled (off-page duplicate
/// subtrees kick in once a key's duplicate set outgrows the page).
pub fn open_dup_tree(dir: &tempfile::TempDir, name: &str, page_size: usize) -> Arc<BTree> {
    open_tree_with(dir, name, page_size, true)
}

fn open_tree_with(dir: &tempfile::TempDir, name: &str, page_size: usize, dup_sort: bool) -> Arc<BTree> {
    let bp = Arc::new(BufferPool::new(page_size));
    let path = dir.path().join(name);
    let fileid = bp
        .open_file(&path, None, 0, MetadataPage::LSN_FIELD_OFFSET, MfpFlags::default())
        .unwrap();
    let lock_manager: Arc<dyn LockManager> = Arc::new(LatchLockManager::new());
    BTree::create(bp, lock_manager, fileid, page_size, false, dup_sort, default_comparator()).unwrap()
}

pub fn key(i: u32) -> Vec<u8> {
    format!("k{:03}", i).into_bytes()
}

pub fn data(i: u32) -> Vec<u8> {
    vec![i as u8; 12]
}
