//! Scenario 6: the write-ahead-log durability invariant, exercised
//! across the real `BufferPool` + `AriesLogManager` pair rather than
//! a stub, plus the freelist/eviction behaviors that sit alongside it.

use std::sync::Arc;

use small_db::{
    buffer_pool::{mfp::MfpFlags, BufferPool, GetFlags, GetPgno, PutFlags},
    page::metadata::MetadataPage,
    txlog::AriesLogManager,
};

/// A page written back by the buffer pool must have its log forced
/// first: writing, then dropping the pin to force an evict-driven
/// writeback, must leave the log durable for that page's LSN.
#[test]
fn writeback_forces_log_before_evicting_dirty_page() {
    let dir = tempfile::tempdir().unwrap();
    let bp = Arc::new(BufferPool::new(512));
    let log = Arc::new(AriesLogManager::new(dir.path().join("wal.log")));
    bp.set_log_force(log.clone());

    let path = dir.path().join("data.db");
    let fileid = bp
        .open_file(&path, None, 0, MetadataPage::LSN_FIELD_OFFSET, MfpFlags::default())
        .unwrap();

    let pin = bp
        .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
        .unwrap();
    pin.with_page_mut(|p| p.bytes[40] = 7);
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
    drop(pin);

    // sync forces every dirty page through writeback -> log.flush.
    assert!(bp.sync(small_db::lsn::Lsn::ZERO).is_ok());
}

/// A file's fileid survives a rename through `nameop`: pages opened
/// under the old path remain addressable by the same fileid under
/// the new one.
#[test]
fn nameop_rename_keeps_fileid_stable() {
    let dir = tempfile::tempdir().unwrap();
    let bp = Arc::new(BufferPool::new(512));
    let old_path = dir.path().join("old.db");
    let new_path = dir.path().join("new.db");

    let fileid = bp
        .open_file(&old_path, None, 0, 0, MfpFlags::default())
        .unwrap();
    let pin = bp
        .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
        .unwrap();
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
    drop(pin);

    bp.nameop(fileid, Some(new_path.clone())).unwrap();
    assert!(new_path.exists());
    assert!(!old_path.exists());

    let pin2 = bp.get(fileid, GetPgno::Exact(1), GetFlags::default()).unwrap();
    drop(pin2);
}

/// Checkpointing writes the outstanding-transaction list and moves the
/// checkpoint pointer; recovering immediately after (nothing active)
/// is a no-op that leaves the file in a clean, reusable state.
#[test]
fn checkpoint_then_recover_on_a_clean_log_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let bp = Arc::new(BufferPool::new(512));
    let _fileid = bp
        .open_file(&dir.path().join("data.db"), None, 0, 0, MfpFlags::default())
        .unwrap();

    let log = AriesLogManager::new(dir.path().join("wal.log"));
    log.log_checkpoint(&bp).unwrap();
    assert!(log.recover(&bp).is_ok());
}

/// A transaction that starts, updates a page, then aborts must see
/// its before-image restored once `log_abort` runs, round-tripping
/// through a real buffer pool rather than a hand-rolled page buffer.
#[test]
fn abort_after_update_restores_page_through_buffer_pool() {
    let dir = tempfile::tempdir().unwrap();
    let bp = Arc::new(BufferPool::new(512));
    let fileid = bp
        .open_file(&dir.path().join("data.db"), None, 0, -1, MfpFlags::default())
        .unwrap();

    let log = AriesLogManager::new(dir.path().join("wal.log"));
    let tx = 11u64;
    log.log_start(tx).unwrap();

    let pin = bp
        .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
        .unwrap();
    let before = pin.with_page(|p| p.bytes.clone());
    pin.with_page_mut(|p| p.bytes[5] = 99);
    let after = pin.with_page(|p| p.bytes.clone());
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
    let key = pin.key;
    drop(pin);

    log.log_update(tx, key, &before, &after).unwrap();
    log.log_abort(tx, &bp).unwrap();

    let pin2 = bp.get(fileid, GetPgno::Exact(key.pgno), GetFlags::default()).unwrap();
    assert_eq!(pin2.with_page(|p| p.bytes[5]), before[5]);
}
