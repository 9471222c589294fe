//! An embeddable transactional storage engine: a B-tree/Recno page
//! engine, a shared buffer pool, a write-ahead log and lock manager,
//! and a recovery-driven replay applier. Not a database server: no
//! SQL, no query planner, no network protocol — see `DESIGN.md`.

pub mod applier;
pub mod btree;
pub mod buffer_pool;
pub mod error;
pub mod fileid;
pub mod io;
pub mod lock;
pub mod lsn;
pub mod page;
pub mod txlog;
pub mod txn;
pub mod types;
pub mod utils;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        btree::{default_comparator, BTree, PutMode, SearchMode},
        buffer_pool::{mfp::MfpFlags, BufferPool},
        lock::{LatchLockManager, LockManager},
    };

    fn open_tree(dir: &tempfile::TempDir, page_size: usize) -> Arc<BTree> {
        let bp = Arc::new(BufferPool::new(page_size));
        let path = dir.path().join("data.db");
        let fileid = bp.open_file(&path, None, 0, crate::page::metadata::MetadataPage::LSN_FIELD_OFFSET, MfpFlags::default()).unwrap();
        let lock_manager: Arc<dyn crate::lock::LockManager> = Arc::new(LatchLockManager::new());
        BTree::create(bp, lock_manager, fileid, page_size, false, false, default_comparator()).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, 1024);
        tree.put(b"k1", b"v1", PutMode::NoOverwrite).unwrap();
        tree.put(b"k2", b"v2", PutMode::NoOverwrite).unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tree.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);
    }

    #[test]
    fn duplicate_key_rejected_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, 1024);
        tree.put(b"k1", b"v1", PutMode::NoOverwrite).unwrap();
        assert!(tree.put(b"k1", b"v2", PutMode::NoOverwrite).is_err());
        tree.put(b"k1", b"v2", PutMode::Overwrite).unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn split_on_many_keys_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, 1024);
        for i in 0..64u32 {
            let key = format!("k{:03}", i).into_bytes();
            tree.put(&key, &vec![i as u8; 12], PutMode::NoOverwrite).unwrap();
        }
        for i in 0..64u32 {
            let key = format!("k{:03}", i).into_bytes();
            assert_eq!(tree.get(&key).unwrap(), Some(vec![i as u8; 12]));
        }

        let mut cursor = tree.open_cursor();
        let mut seen = Vec::new();
        let mut item = cursor.first().unwrap();
        while let Some((k, _)) = item {
            seen.push(k);
            item = cursor.next().unwrap();
        }
        assert_eq!(seen.len(), 64);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn delete_then_reverse_split_collapses_pages() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, 1024);
        for i in 0..64u32 {
            let key = format!("k{:03}", i).into_bytes();
            tree.put(&key, &vec![i as u8; 12], PutMode::NoOverwrite).unwrap();
        }
        for i in 0..60u32 {
            let key = format!("k{:03}", i).into_bytes();
            tree.del(&key).unwrap();
        }
        for i in 0..60u32 {
            let key = format!("k{:03}", i).into_bytes();
            assert_eq!(tree.get(&key).unwrap(), None);
        }
        for i in 60..64u32 {
            let key = format!("k{:03}", i).into_bytes();
            assert_eq!(tree.get(&key).unwrap(), Some(vec![i as u8; 12]));
        }
    }

    #[test]
    fn duplicates_migrate_to_opd_and_count_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let bp = Arc::new(BufferPool::new(512));
        let path = dir.path().join("data.db");
        let fileid = bp.open_file(&path, None, 0, crate::page::metadata::MetadataPage::LSN_FIELD_OFFSET, MfpFlags::default()).unwrap();
        let lock_manager: Arc<dyn crate::lock::LockManager> = Arc::new(LatchLockManager::new());
        let tree = BTree::create(bp, lock_manager, fileid, 512, false, true, default_comparator()).unwrap();

        for i in 0..200u32 {
            tree.put(b"dupkey", &i.to_le_bytes(), PutMode::KeyLast).unwrap();
        }
        assert_eq!(tree.count(b"dupkey").unwrap(), 200);
    }

    #[test]
    fn search_modes_find_duplicate_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, 1024);
        tree.put(b"k1", b"a", PutMode::KeyFirst).unwrap();
        tree.put(b"k1", b"b", PutMode::KeyLast).unwrap();
        let locker = tree.lock_manager.id();
        let r = tree.search(locker, b"k1", SearchMode::KeyLast).unwrap();
        assert!(r.slot >= 1);
        tree.lock_manager.id_free(locker);
    }
}
