//! Integration-level coverage of the replay applier through its
//! public surface only (no `super::*` access to private `State`),
//! exercising the gap/reorder algorithm and checkpoint handling the
//! way a recovering replica would drive it.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use small_db::{
    applier::{ChainedRecord, Control, ControlFlags, GapRequester, LogSource, Outcome, RecType, Applier},
    buffer_pool::BufferPool,
    lock::{LatchLockManager, LockManager},
    lsn::Lsn,
    txlog::AriesLogManager,
    txn::TransactionManager,
};

struct NullGapRequester(Mutex<Vec<(Lsn, Lsn)>>);
impl GapRequester for NullGapRequester {
    fn request_gap(&self, first_missing: Lsn, first_known_after_gap: Lsn) {
        self.0.lock().unwrap().push((first_missing, first_known_after_gap));
    }
}

struct MapLogSource(Mutex<BTreeMap<Lsn, (Control, ChainedRecord)>>);
impl LogSource for MapLogSource {
    fn fetch(&self, lsn: Lsn) -> Option<(Control, ChainedRecord)> {
        self.0.lock().unwrap().get(&lsn).cloned()
    }
}

fn ctrl(lsn: Lsn, rectype: RecType) -> Control {
    Control {
        lsn,
        generation: 1,
        rectype,
        log_version: 1,
        flags: ControlFlags::default(),
    }
}

fn record() -> ChainedRecord {
    ChainedRecord {
        prev_lsn: Lsn::ZERO,
        locker: 0,
        locks_needed: vec![],
        payload: vec![9, 9, 9],
    }
}

fn new_applier(dir: &std::path::Path) -> (Applier, Arc<NullGapRequester>) {
    let bp = Arc::new(BufferPool::new(512));
    let log = Arc::new(AriesLogManager::new(dir.join("wal.log")));
    let lock_manager: Arc<dyn LockManager> = Arc::new(LatchLockManager::new());
    let txn_log = AriesLogManager::new(dir.join("wal2.log"));
    let txn_manager = Arc::new(TransactionManager::new(txn_log, Box::new(LatchLockManager::new())));
    let gap = Arc::new(NullGapRequester(Mutex::new(vec![])));
    let source = Arc::new(MapLogSource(Mutex::new(BTreeMap::new())));
    let applier = Applier::new(log, source, bp, lock_manager, txn_manager, gap.clone(), Lsn::new(1, 1));
    (applier, gap)
}

/// Scenario 4: a 2-record gap opens up, then closes. Records that
/// arrived early are drained in LSN order once the gap-filler shows
/// up, and the gap requester is told about the hole exactly once.
#[test]
fn gap_scenario_requests_the_hole_once_and_drains_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (applier, gap) = new_applier(dir.path());

    assert_eq!(applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap(), Outcome::StartupDone);
    assert_eq!(applier.apply(ctrl(Lsn::new(1, 4), RecType::Other), record()).unwrap(), Outcome::Buffered);
    assert_eq!(applier.apply(ctrl(Lsn::new(1, 3), RecType::Other), record()).unwrap(), Outcome::Buffered);
    assert_eq!(applier.pending_len(), 2);

    assert_eq!(applier.apply(ctrl(Lsn::new(1, 2), RecType::Other), record()).unwrap(), Outcome::Applied);
    assert_eq!(applier.ready_lsn(), Lsn::new(1, 5));
    assert_eq!(applier.pending_len(), 0);
    assert!(!gap.0.lock().unwrap().is_empty());
}

/// A record at exactly `ready_lsn` applies immediately with no
/// buffering and no gap request.
#[test]
fn in_order_records_never_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let (applier, gap) = new_applier(dir.path());

    for offset in 1..=5u32 {
        let out = applier.apply(ctrl(Lsn::new(1, offset), RecType::Other), record()).unwrap();
        assert_ne!(out, Outcome::Buffered);
    }
    assert_eq!(applier.pending_len(), 0);
    assert!(gap.0.lock().unwrap().is_empty());
}

/// Scenario 5: a checkpoint record arrives while the applier is
/// mid-stream; it must be dispatched without poisoning later records'
/// ordering (the pending map and ready_lsn keep advancing past it).
#[test]
fn checkpoint_record_does_not_disrupt_subsequent_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let (applier, _gap) = new_applier(dir.path());

    applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
    applier.apply(ctrl(Lsn::new(1, 2), RecType::Checkpoint), record()).unwrap();
    let out = applier.apply(ctrl(Lsn::new(1, 3), RecType::Other), record()).unwrap();
    assert_ne!(out, Outcome::Buffered);
    assert_eq!(applier.ready_lsn(), Lsn::new(1, 4));
}

/// A duplicate of an already-applied LSN is dropped, not reapplied,
/// and does not advance `ready_lsn`.
#[test]
fn already_applied_lsn_is_ignored_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    let (applier, _gap) = new_applier(dir.path());

    applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
    let before = applier.ready_lsn();
    let out = applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
    assert_eq!(out, Outcome::Ignore);
    assert_eq!(applier.ready_lsn(), before);
}
