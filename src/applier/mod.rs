//! Recovery-driven replay applier: turns an out-of-order stream of
//! incoming log records into a linearly applied history, with gap
//! detection and a pending-record map, so a transaction's records only
//! get applied once every one of them has arrived.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::{
    buffer_pool::BufferPool,
    error::SmallError,
    lock::{LockManager, LockMode, LockRequest},
    lsn::Lsn,
    txlog::LogManager,
    txn::TransactionManager,
    types::SmallResult,
};

const DEFAULT_REQUEST_GAP: u64 = 1;
const DEFAULT_MAX_GAP: u64 = 128;

/// The record-type tag this applier dispatches on. `rectype` is a
/// thin enum rather than the raw opcode space a real log uses,
/// because this crate has no SQL/query layer generating records —
/// every record this applier sees comes from the transaction log this
/// same crate writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecType {
    NewFile,
    FileHandleOpen,
    FileHandleClose,
    TxnCommit,
    TxnPrepare,
    Checkpoint,
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlFlags {
    pub permanent: bool,
}

/// Accompanies every record fed to [`Applier::apply`]. `log_version`
/// and `generation` let a future wire format evolve without the
/// applier's core loop caring; neither is interpreted here.
#[derive(Debug, Clone, Copy)]
pub struct Control {
    pub lsn: Lsn,
    pub generation: u32,
    pub rectype: RecType,
    pub log_version: u32,
    pub flags: ControlFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Buffered,
    NotPermYet(Lsn),
    Perm(Lsn),
    StartupDone,
    LogReady,
    Ignore,
    Retry,
}

/// A record envelope carrying the `prev_lsn` chain link `apply_txn`
/// walks backward through. Every record this engine logs (not just
/// UPDATE) carries one, including START/COMMIT/ABORT, so a commit's
/// chain can be collected without consulting a separate index.
#[derive(Debug, Clone)]
pub struct ChainedRecord {
    pub prev_lsn: Lsn,
    pub locker: crate::lock::LockerId,
    /// Objects this record's replay will need locked, gathered once
    /// up front so `apply_txn` can acquire them all atomically via
    /// [`LockManager::vec`] before replaying anything.
    pub locks_needed: Vec<(crate::buffer_pool::PageKey, LockMode)>,
    pub payload: Vec<u8>,
}

/// Looks a record up by LSN — backed by the local durable log once a
/// record has been appended, and by the pending map before that. This
/// is how `apply_txn` walks `prev_lsn` chains and how gap-fill records
/// get replayed once they arrive.
pub trait LogSource: Send + Sync {
    fn fetch(&self, lsn: Lsn) -> Option<(Control, ChainedRecord)>;
}

/// Sends a gap request `(first_missing, first_known_after_gap)` to
/// the current master if known, else broadcasts. The applier never
/// blocks on this — see §4.3's gap-request policy.
pub trait GapRequester: Send + Sync {
    fn request_gap(&self, first_missing: Lsn, first_known_after_gap: Lsn);
}

struct State {
    ready_lsn: Lsn,
    waiting_lsn: Lsn,
    max_perm_lsn: Lsn,
    pending_map: BTreeMap<Lsn, (Control, ChainedRecord)>,
    rcvd_recs: u64,
    wait_recs: u64,
    max_gap: u64,
    request_gap: u64,
    startup_complete: bool,
    current_log_file: u32,
    /// `Some((start, end))` while collecting log before replay:
    /// records in range are logged but not side-effect dispatched.
    recovery_range: Option<(Lsn, Lsn)>,
}

/// Owns the pending-record map and drives the apply algorithm. One
/// instance per environment; `state` is the `mtx_clientdb` of §5's
/// mutex hierarchy — position 7, the last one acquired and first
/// released, and never held across `sync`.
pub struct Applier {
    state: Mutex<State>,
    log: Arc<dyn LogManager>,
    log_source: Arc<dyn LogSource>,
    buffer_pool: Arc<BufferPool>,
    lock_manager: Arc<dyn LockManager>,
    txn_manager: Arc<TransactionManager>,
    gap_requester: Arc<dyn GapRequester>,
}

impl Applier {
    pub fn new(
        log: Arc<dyn LogManager>,
        log_source: Arc<dyn LogSource>,
        buffer_pool: Arc<BufferPool>,
        lock_manager: Arc<dyn LockManager>,
        txn_manager: Arc<TransactionManager>,
        gap_requester: Arc<dyn GapRequester>,
        start_lsn: Lsn,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                ready_lsn: start_lsn,
                waiting_lsn: Lsn::ZERO,
                max_perm_lsn: Lsn::ZERO,
                pending_map: BTreeMap::new(),
                rcvd_recs: 0,
                wait_recs: 0,
                max_gap: DEFAULT_MAX_GAP,
                request_gap: DEFAULT_REQUEST_GAP,
                startup_complete: false,
                current_log_file: start_lsn.file,
                recovery_range: None,
            }),
            log,
            log_source,
            buffer_pool,
            lock_manager,
            txn_manager,
            gap_requester,
        }
    }

    /// Declares `[start, end]` as a log-recovery window: records in it
    /// are appended but not side-effect dispatched, per §4.3's
    /// "log-only recovery mode".
    pub fn begin_log_recovery(&self, start: Lsn, end: Lsn) {
        self.state.lock().unwrap().recovery_range = Some((start, end));
    }

    /// `apply(control, record) → Outcome`. The reordering algorithm of
    /// §4.3: records arriving at exactly `ready_lsn` are applied
    /// immediately and drain the pending map forward; records ahead of
    /// `ready_lsn` are buffered with gap-request bookkeeping; records
    /// behind it are duplicates.
    pub fn apply(&self, control: Control, record: ChainedRecord) -> Result<Outcome, SmallError> {
        let mut state = self.state.lock().unwrap();

        use std::cmp::Ordering::*;
        let outcome = match control.lsn.cmp(&state.ready_lsn) {
            Equal => {
                drop(state);
                self.apply_and_drain(control, record)?
            }
            Greater => {
                self.buffer(&mut state, control, record);
                Outcome::Buffered
            }
            Less => {
                if control.flags.permanent {
                    state.max_perm_lsn = state.max_perm_lsn.max(control.lsn);
                    Outcome::Perm(state.max_perm_lsn)
                } else {
                    Outcome::Ignore
                }
            }
        };

        Ok(outcome)
    }

    fn buffer(&self, state: &mut State, control: Control, record: ChainedRecord) {
        if state.pending_map.contains_key(&control.lsn) {
            return;
        }
        state.pending_map.insert(control.lsn, (control, record));
        state.waiting_lsn = if state.waiting_lsn.is_zero() {
            control.lsn
        } else {
            state.waiting_lsn.min(control.lsn)
        };

        if state.wait_recs == 0 {
            state.wait_recs = state.request_gap;
        } else {
            state.rcvd_recs += 1;
        }

        if state.rcvd_recs >= state.wait_recs {
            self.gap_requester.request_gap(state.ready_lsn, state.waiting_lsn);
            state.wait_recs = (state.wait_recs * 2).min(state.max_gap);
            state.rcvd_recs = 0;
        }
    }

    /// Apply `control`/`record` (which is known to sit at `ready_lsn`),
    /// advance `ready_lsn`, then keep pulling anything the pending map
    /// now has ready.
    fn apply_and_drain(&self, control: Control, record: ChainedRecord) -> Result<Outcome, SmallError> {
        let was_first = {
            let state = self.state.lock().unwrap();
            !state.startup_complete
        };

        self.dispatch(&control, &record)?;

        {
            let mut state = self.state.lock().unwrap();
            state.ready_lsn = Lsn::new(control.lsn.file, control.lsn.offset + 1);
            state.rcvd_recs = 0;
            state.wait_recs = 0;

            loop {
                let next = state
                    .pending_map
                    .iter()
                    .next()
                    .filter(|(lsn, _)| **lsn == state.ready_lsn)
                    .map(|(lsn, _)| *lsn);

                let Some(lsn) = next else { break };
                let (ctrl, rec) = state.pending_map.remove(&lsn).unwrap();
                drop(state);
                self.dispatch(&ctrl, &rec)?;
                state = self.state.lock().unwrap();
                state.ready_lsn = Lsn::new(ctrl.lsn.file, ctrl.lsn.offset + 1);
            }

            if state.ready_lsn == state.waiting_lsn {
                state.waiting_lsn = Lsn::ZERO;
            }

            if in_recovery_range(&state, control.lsn) && log_range_exhausted(&state) {
                state.recovery_range = None;
                return Ok(Outcome::LogReady);
            }
        }

        if !was_first {
            return Ok(Outcome::Applied);
        }
        let mut state = self.state.lock().unwrap();
        state.startup_complete = true;
        Ok(Outcome::StartupDone)
    }

    /// Per-record-type dispatch. `recovery_range` suppresses side
    /// effects for records inside a declared log-recovery window,
    /// still logging them but not acting on them.
    fn dispatch(&self, control: &Control, record: &ChainedRecord) -> SmallResult {
        let suppress = {
            let state = self.state.lock().unwrap();
            in_recovery_range(&state, control.lsn)
        };

        match control.rectype {
            RecType::NewFile => {
                let mut state = self.state.lock().unwrap();
                if control.lsn.file > state.current_log_file {
                    state.current_log_file = control.lsn.file;
                }
                Ok(())
            }
            RecType::FileHandleClose => Ok(()),
            RecType::FileHandleOpen => Ok(()),
            RecType::TxnCommit => {
                if suppress {
                    return Ok(());
                }
                self.apply_txn(control, record)?;
                self.log.flush(control.lsn)
            }
            RecType::TxnPrepare => self.log.flush(control.lsn),
            RecType::Checkpoint => self.apply_checkpoint(control, record),
            RecType::Other => {
                self.log.put(&record.payload)?;
                Ok(())
            }
        }
    }

    /// Checkpoints are not applied inline: insert into the pending map
    /// under the checkpoint's own LSN, release the applier mutex
    /// before calling `sync` (which can block on page I/O), then
    /// re-acquire to write the record and remove the pending entry.
    fn apply_checkpoint(&self, control: &Control, record: &ChainedRecord) -> SmallResult {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending_map.contains_key(&control.lsn) {
                return Ok(());
            }
            state
                .pending_map
                .insert(control.lsn, (*control, record.clone()));
        }

        self.buffer_pool.sync(control.lsn)?;
        self.txn_manager.checkpoint(&self.buffer_pool)?;

        let mut state = self.state.lock().unwrap();
        state.pending_map.remove(&control.lsn);
        drop(state);
        self.log.put(&record.payload)?;
        Ok(())
    }

    /// Walk `prev_lsn` backward from the commit record, collecting
    /// every LSN in the transaction's chain (recursing into
    /// child-transaction links reached the same way), sort ascending,
    /// take a fresh locker, acquire every needed lock atomically, then
    /// replay in order. A lock-wait deadlock anywhere in the replay
    /// restarts the whole transaction once.
    fn apply_txn(&self, control: &Control, commit: &ChainedRecord) -> SmallResult {
        for _attempt in 0..2 {
            match self.try_apply_txn(control, commit) {
                Ok(()) => return Ok(()),
                Err(e) if e.to_string().contains("deadlock") => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SmallError::new("apply_txn: deadlock retry exhausted"))
    }

    fn try_apply_txn(&self, control: &Control, commit: &ChainedRecord) -> SmallResult {
        let mut chain = self.collect_chain(control.lsn, commit.prev_lsn)?;
        chain.sort_by_key(|(lsn, _, _)| *lsn);

        let locker = self.lock_manager.id();
        let requests: Vec<LockRequest> = chain
            .iter()
            .flat_map(|(_, _, record)| {
                record
                    .locks_needed
                    .iter()
                    .map(|(object, mode)| LockRequest { object: *object, mode: *mode })
            })
            .collect();

        let handles = match self.lock_manager.vec(locker, &requests) {
            Ok(h) => h,
            Err(e) => {
                self.lock_manager.id_free(locker);
                return Err(e);
            }
        };

        let result = (|| -> SmallResult {
            for (lsn, ctrl, record) in &chain {
                let _ = lsn;
                self.dispatch(ctrl, record)?;
            }
            Ok(())
        })();

        for handle in handles {
            let _ = self.lock_manager.put(handle);
        }
        self.lock_manager.id_free(locker);

        result
    }

    fn collect_chain(
        &self,
        stop_before: Lsn,
        mut cursor: Lsn,
    ) -> Result<Vec<(Lsn, Control, ChainedRecord)>, SmallError> {
        let mut chain = Vec::new();
        while !cursor.is_zero() && cursor != stop_before {
            let (ctrl, rec) = self
                .log_source
                .fetch(cursor)
                .ok_or_else(|| SmallError::new("apply_txn: missing record in chain"))?;
            let prev = rec.prev_lsn;
            chain.push((cursor, ctrl, rec));
            cursor = prev;
        }
        Ok(chain)
    }

    pub fn ready_lsn(&self) -> Lsn {
        self.state.lock().unwrap().ready_lsn
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending_map.len()
    }
}

fn in_recovery_range(state: &State, lsn: Lsn) -> bool {
    match state.recovery_range {
        Some((start, end)) => lsn >= start && lsn <= end,
        None => false,
    }
}

fn log_range_exhausted(state: &State) -> bool {
    match state.recovery_range {
        Some((_, end)) => state.ready_lsn > end,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer_pool::BufferPool, lock::LatchLockManager, txlog::AriesLogManager, txn::TransactionManager};
    use std::sync::Mutex as StdMutex;

    struct NullGapRequester(StdMutex<Vec<(Lsn, Lsn)>>);
    impl GapRequester for NullGapRequester {
        fn request_gap(&self, first_missing: Lsn, first_known_after_gap: Lsn) {
            self.0.lock().unwrap().push((first_missing, first_known_after_gap));
        }
    }

    struct MapLogSource(StdMutex<BTreeMap<Lsn, (Control, ChainedRecord)>>);
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
            payload: vec![1, 2, 3],
        }
    }

    fn new_applier(dir: &std::path::Path) -> Applier {
        let bp = Arc::new(BufferPool::new(512));
        let log = Arc::new(AriesLogManager::new(dir.join("wal.log")));
        let lock_manager: Arc<dyn LockManager> = Arc::new(LatchLockManager::new());
        let txn_log = AriesLogManager::new(dir.join("wal2.log"));
        let txn_manager = Arc::new(TransactionManager::new(txn_log, Box::new(LatchLockManager::new())));
        let gap = Arc::new(NullGapRequester(StdMutex::new(vec![])));
        let source = Arc::new(MapLogSource(StdMutex::new(BTreeMap::new())));
        Applier::new(log, source, bp, lock_manager, txn_manager, gap, Lsn::new(1, 1))
    }

    #[test]
    fn gap_scenario_applies_out_of_order_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let applier = new_applier(dir.path());

        let o1 = applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
        assert_eq!(o1, Outcome::StartupDone);

        let o2 = applier.apply(ctrl(Lsn::new(1, 3), RecType::Other), record()).unwrap();
        assert_eq!(o2, Outcome::Buffered);

        let o3 = applier.apply(ctrl(Lsn::new(1, 4), RecType::Other), record()).unwrap();
        assert_eq!(o3, Outcome::Buffered);

        let o4 = applier.apply(ctrl(Lsn::new(1, 2), RecType::Other), record()).unwrap();
        assert_eq!(o4, Outcome::Applied);

        assert_eq!(applier.ready_lsn(), Lsn::new(1, 5));
        assert_eq!(applier.pending_len(), 0);
    }

    #[test]
    fn duplicate_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let applier = new_applier(dir.path());
        applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
        let out = applier.apply(ctrl(Lsn::new(1, 1), RecType::Other), record()).unwrap();
        assert_eq!(out, Outcome::Ignore);
    }
}
