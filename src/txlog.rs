//! The write-ahead log, consumed by the core through the narrow
//! contract of §6: `put`/`flush`/`cursor`/`cursor.get`. An ARIES-style
//! log recording generic `(fileid, pgno)` page images so the log has
//! no knowledge of what a page means, plus a `Raw` record kind so the
//! applier can append opaque replication records through the same file
//! (§4.3 "append the raw record bytes").

use std::{
    collections::{HashMap, HashSet},
    io::{Read, SeekFrom},
    path::Path,
    sync::Mutex,
};

use log::debug;

use crate::{
    buffer_pool::{BufferPool, GetFlags, GetPgno, LogForce, PageKey, PutFlags},
    error::SmallError,
    fileid::FileId,
    io::{read_exact, read_into, Decodeable, Encodeable, SmallFile},
    lock::LockerId,
    lsn::Lsn,
    page::PageNo,
    types::SmallResult,
};

static NO_CHECKPOINT: u64 = 0;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RecordType {
    Abort,
    Commit,
    Update,
    Start,
    Checkpoint,
    Raw,
}

impl RecordType {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecordType::Abort,
            1 => RecordType::Commit,
            2 => RecordType::Update,
            3 => RecordType::Start,
            4 => RecordType::Checkpoint,
            5 => RecordType::Raw,
            _ => panic!("invalid log record type: {}", value),
        }
    }
}

impl Encodeable for RecordType {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for RecordType {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let value = read_exact(reader, 1);
        RecordType::from_u8(value[0])
    }
}

impl Encodeable for PageKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = self.fileid.encode();
        buf.extend_from_slice(&self.pgno.encode());
        buf
    }
}

impl Decodeable for PageKey {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let fileid = FileId::decode_from(reader);
        let pgno = PageNo::decode_from(reader);
        PageKey::new(fileid, pgno)
    }
}

/// The narrow log-manager contract the core actually calls through.
pub trait LogManager: Send + Sync {
    fn put(&self, record: &[u8]) -> Result<Lsn, SmallError>;
    fn flush(&self, up_to: Lsn) -> SmallResult;
}

/// Mutable log state, guarded by a single mutex so `AriesLogManager`
/// can hand out `&self` methods and be shared behind an `Arc` the way
/// the lock manager and buffer pool already are.
struct LogState {
    tx_start_position: HashMap<LockerId, u64>,
    file: SmallFile,
    current_offset: u64,
    total_records: usize,
    log_file_number: u32,
}

impl LogState {
    fn pre_append(&mut self) -> SmallResult {
        self.total_records += 1;
        if self.file.get_size()? == 0 {
            self.reset_file()?;
        }
        Ok(())
    }

    fn reset_file(&mut self) -> SmallResult {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write(&NO_CHECKPOINT)?;
        self.current_offset = self.file.get_current_position()?;
        Ok(())
    }

    fn lsn_here(&self) -> Lsn {
        Lsn::new(self.log_file_number, self.current_offset as u32)
    }

    fn rollback(&mut self, tx: LockerId, buffer_pool: &BufferPool) -> SmallResult {
        self.file.seek(SeekFrom::Start(0))?;
        let last_checkpoint_position: u64 = read_into(&mut self.file);

        let start_position = if last_checkpoint_position == NO_CHECKPOINT {
            0
        } else {
            self.file.seek(SeekFrom::Start(last_checkpoint_position))?;
            last_checkpoint_position
        };

        self.file.seek(SeekFrom::Start(start_position))?;
        let file_size = self.file.get_size()?;

        while self.file.get_current_position()? < file_size {
            let record_type: RecordType = read_into(&mut self.file);
            match record_type {
                RecordType::Start => {
                    let _: LockerId = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Update => {
                    let tid: LockerId = read_into(&mut self.file);
                    let key: PageKey = read_into(&mut self.file);
                    let before: Vec<u8> = read_into(&mut self.file);
                    let _after: Vec<u8> = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);

                    if tid == tx {
                        restore_page(buffer_pool, key, &before)?;
                    }
                }
                RecordType::Checkpoint => {
                    self.skip_checkpoint();
                }
                RecordType::Raw => {
                    let _: Vec<u8> = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Commit | RecordType::Abort => {
                    let _: LockerId = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);
                }
            }
        }

        Ok(())
    }

    fn skip_checkpoint(&mut self) {
        let _: i64 = read_into(&mut self.file);
        let tx_count: u64 = read_into(&mut self.file);
        for _ in 0..tx_count {
            let _: LockerId = read_into(&mut self.file);
            let _: u64 = read_into(&mut self.file);
        }
        let _: u64 = read_into(&mut self.file);
    }

    fn get_incomplete_transactions(&mut self) -> Result<HashSet<LockerId>, SmallError> {
        self.file.seek(SeekFrom::Start(0))?;
        let last_checkpoint: u64 = read_into(&mut self.file);

        let mut incomplete = HashSet::new();

        if last_checkpoint != NO_CHECKPOINT {
            self.file.seek(SeekFrom::Start(last_checkpoint))?;
            let record_type: RecordType = read_into(&mut self.file);
            if record_type != RecordType::Checkpoint {
                return Err(SmallError::new("invalid checkpoint record type"));
            }
            let _: i64 = read_into(&mut self.file);
            let tx_count: u64 = read_into(&mut self.file);
            for _ in 0..tx_count {
                let tid: LockerId = read_into(&mut self.file);
                incomplete.insert(tid);
                let _: u64 = read_into(&mut self.file);
            }
            let _: u64 = read_into(&mut self.file);
        }

        let file_size = self.file.get_size()?;
        while self.file.get_current_position()? < file_size {
            let record_type: RecordType = read_into(&mut self.file);
            match record_type {
                RecordType::Start => {
                    let tid: LockerId = read_into(&mut self.file);
                    incomplete.insert(tid);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Update => {
                    let _: LockerId = read_into(&mut self.file);
                    let _: PageKey = read_into(&mut self.file);
                    let _: Vec<u8> = read_into(&mut self.file);
                    let _: Vec<u8> = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Checkpoint => self.skip_checkpoint(),
                RecordType::Raw => {
                    let _: Vec<u8> = read_into(&mut self.file);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Commit => {
                    let tid: LockerId = read_into(&mut self.file);
                    incomplete.remove(&tid);
                    let _: u64 = read_into(&mut self.file);
                }
                RecordType::Abort => {
                    let tid: LockerId = read_into(&mut self.file);
                    incomplete.remove(&tid);
                    let _: u64 = read_into(&mut self.file);
                }
            }
        }

        Ok(incomplete)
    }
}

fn restore_page(buffer_pool: &BufferPool, key: PageKey, before: &[u8]) -> SmallResult {
    let pin = buffer_pool.get(key.fileid, GetPgno::Exact(key.pgno), GetFlags::default())?;
    pin.with_page_mut(|page| page.bytes.copy_from_slice(before));
    buffer_pool.put(&pin, PutFlags { dirty: true, ..Default::default() })
}

/// ARIES-style log manager: before/after page images per UPDATE
/// record, a checkpoint carrying the outstanding-transaction list, and
/// a lazy `pre_append` that throws out stale contents the first time
/// something is actually appended, since until then we don't know
/// whether the caller wants the existing file truncated for recovery.
/// Internally mutex-guarded so it can be shared via `Arc<dyn LogManager>`
/// the way the rest of this engine's external collaborators are.
pub struct AriesLogManager {
    state: Mutex<LogState>,
}

impl AriesLogManager {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let mut file = SmallFile::new(file_path);
        let size = file.get_size().unwrap();
        file.seek(SeekFrom::End(0)).unwrap();

        Self {
            state: Mutex::new(LogState {
                tx_start_position: HashMap::new(),
                file,
                current_offset: size,
                total_records: 0,
                log_file_number: 1,
            }),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.file.set_len(0).unwrap();
        state.tx_start_position.clear();
        state.current_offset = 0;
        state.total_records = 0;
    }

    pub fn records_count(&self) -> usize {
        self.state.lock().unwrap().total_records
    }

    pub fn log_start(&self, tx: LockerId) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        state.pre_append()?;

        state.file.write(&RecordType::Start)?;
        state.file.write(&tx)?;
        state.file.write(&state.current_offset)?;

        let offset = state.current_offset;
        state.tx_start_position.insert(tx, offset);
        state.current_offset = state.file.get_current_position()?;
        Ok(())
    }

    pub fn log_update(
        &self,
        tx: LockerId,
        key: PageKey,
        before: &[u8],
        after: &[u8],
    ) -> Result<Lsn, SmallError> {
        let mut state = self.state.lock().unwrap();
        state.pre_append()?;

        state.file.write(&RecordType::Update)?;
        state.file.write(&tx)?;
        state.file.write(&key)?;
        state.file.write(&before.to_vec())?;
        state.file.write(&after.to_vec())?;
        state.file.write(&state.current_offset)?;

        let lsn = state.lsn_here();
        state.current_offset = state.file.get_current_position()?;
        Ok(lsn)
    }

    pub fn log_commit(&self, tx: LockerId) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        state.pre_append()?;

        state.file.write(&RecordType::Commit)?;
        state.file.write(&tx)?;
        state.file.write(&state.current_offset)?;

        state.current_offset = state.file.get_current_position()?;
        state.tx_start_position.remove(&tx);
        Ok(())
    }

    /// Write the ABORT record and roll the transaction's updates back
    /// by restoring each UPDATE record's before-image directly through
    /// the buffer pool, in reverse chronological order from the last
    /// checkpoint (or from the start of the file if there is none).
    pub fn log_abort(&self, tx: LockerId, buffer_pool: &BufferPool) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        let original_offset = state.file.get_current_position()?;
        state.rollback(tx, buffer_pool)?;
        state.file.seek(SeekFrom::Start(original_offset))?;

        state.file.write(&RecordType::Abort)?;
        state.file.write(&tx)?;
        state.file.write(&state.current_offset)?;

        state.current_offset = state.file.get_current_position()?;
        state.tx_start_position.remove(&tx);
        Ok(())
    }

    /// Flush pending buffer-pool writes up to `ckpt_lsn`, write the
    /// outstanding-transaction list, then patch the checkpoint pointer
    /// at file offset 0.
    pub fn log_checkpoint(&self, buffer_pool: &BufferPool) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        state.pre_append()?;
        state.file.flush()?;

        let ckpt_lsn = state.lsn_here();
        drop(state);
        buffer_pool.sync(ckpt_lsn)?;
        let mut state = self.state.lock().unwrap();

        let checkpoint_start = state.file.get_current_position()?;
        state.file.write(&RecordType::Checkpoint)?;
        state.file.write(&NO_CHECKPOINT)?;
        state.file.write(&state.tx_start_position.len())?;
        for (tx, pos) in &state.tx_start_position.clone() {
            state.file.write(tx)?;
            state.file.write(pos)?;
        }
        let checkpoint_end = state.file.get_current_position()?;

        state.file.seek(SeekFrom::Start(0))?;
        state.file.write(&checkpoint_start)?;

        state.file.seek(SeekFrom::Start(checkpoint_end))?;
        state.file.write(&checkpoint_start)?;
        state.current_offset = state.file.get_current_position()?;
        Ok(())
    }

    /// Analysis + undo recovery on startup: identify incomplete
    /// transactions from the last checkpoint forward, then walk the
    /// whole log backward restoring their before-images.
    pub fn recover(&self, buffer_pool: &BufferPool) -> SmallResult {
        let mut state = self.state.lock().unwrap();
        let incomplete = state.get_incomplete_transactions()?;

        state.file.seek(SeekFrom::End(0))?;
        while state.file.get_current_position()? >= 17 {
            state
                .file
                .seek(SeekFrom::Current(-(std::mem::size_of::<u64>() as i64)))?;
            let record_start: u64 = read_into(&mut state.file);
            state.file.seek(SeekFrom::Start(record_start))?;
            let record_type: RecordType = read_into(&mut state.file);

            match record_type {
                RecordType::Start => {
                    let _: LockerId = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
                RecordType::Update => {
                    let tid: LockerId = read_into(&mut state.file);
                    let key: PageKey = read_into(&mut state.file);
                    let before: Vec<u8> = read_into(&mut state.file);
                    let _after: Vec<u8> = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);

                    if incomplete.contains(&tid) {
                        restore_page(buffer_pool, key, &before)?;
                    }
                }
                RecordType::Checkpoint => state.skip_checkpoint(),
                RecordType::Raw => {
                    let _: Vec<u8> = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
                RecordType::Commit | RecordType::Abort => {
                    let _: LockerId = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
            }

            state.file.seek(SeekFrom::Start(record_start))?;
        }

        state.reset_file()
    }

    /// Debug dump, in the same tree-drawing style as the rest of the
    /// engine's diagnostics.
    pub fn show_log_contents(&self) {
        let mut state = self.state.lock().unwrap();
        let original_offset = state.file.get_current_position().unwrap();
        let mut depiction = String::new();
        state.file.seek(SeekFrom::Start(0)).unwrap();
        let last_checkpoint: u64 = read_into(&mut state.file);
        depiction.push_str(&format!("├── [8 bytes] last checkpoint: {}\n", last_checkpoint));

        let file_size = state.file.get_size().unwrap();
        while state.file.get_current_position().unwrap() < file_size {
            let pos = state.file.get_current_position().unwrap();
            let record_type: RecordType = read_into(&mut state.file);
            depiction.push_str(&format!("├── {:?}-[pos {}]\n", record_type, pos));
            match record_type {
                RecordType::Start | RecordType::Commit | RecordType::Abort => {
                    let _: LockerId = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
                RecordType::Update => {
                    let _: LockerId = read_into(&mut state.file);
                    let _: PageKey = read_into(&mut state.file);
                    let _: Vec<u8> = read_into(&mut state.file);
                    let _: Vec<u8> = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
                RecordType::Checkpoint => state.skip_checkpoint(),
                RecordType::Raw => {
                    let _: Vec<u8> = read_into(&mut state.file);
                    let _: u64 = read_into(&mut state.file);
                }
            }
        }

        debug!("log content:\n{}", depiction);
        state.file.seek(SeekFrom::Start(original_offset)).unwrap();
    }
}

impl LogForce for AriesLogManager {
    /// Force the log to disk. A single append-only file makes "up to
    /// `up_to`" equivalent to a full `fsync`, since every record
    /// before it is already on disk by construction.
    fn flush(&self, _up_to: Lsn) -> SmallResult {
        let state = self.state.lock().unwrap();
        state.file.sync_all()
    }
}

/// The generic opaque-record append/force contract of §6, consumed by
/// [`crate::applier::Applier`] for records it doesn't interpret itself
/// (§4.3 "Any other: append the raw record bytes to the log").
impl LogManager for AriesLogManager {
    fn put(&self, record: &[u8]) -> Result<Lsn, SmallError> {
        let mut state = self.state.lock().unwrap();
        state.pre_append()?;

        state.file.write(&RecordType::Raw)?;
        state.file.write(&record.to_vec())?;
        state.file.write(&state.current_offset)?;

        let lsn = state.lsn_here();
        state.current_offset = state.file.get_current_position()?;
        Ok(lsn)
    }

    fn flush(&self, up_to: Lsn) -> SmallResult {
        LogForce::flush(self, up_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_round_trips_through_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let log = AriesLogManager::new(dir.path().join("wal.log"));
        let lsn1 = LogManager::put(&log, b"hello").unwrap();
        let lsn2 = LogManager::put(&log, b"world").unwrap();
        assert!(lsn2 > lsn1);
        assert_eq!(log.records_count(), 2);
    }

    #[test]
    fn flush_forces_file_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = AriesLogManager::new(dir.path().join("wal.log"));
        let lsn = LogManager::put(&log, b"payload").unwrap();
        assert!(LogManager::flush(&log, lsn).is_ok());
    }

    #[test]
    fn abort_restores_before_image() {
        use crate::{buffer_pool::{BufferPool, GetFlags, GetPgno, PutFlags}, fileid::FileId};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let bp = Arc::new(BufferPool::new(512));
        let path = dir.path().join("data.db");
        let fileid = bp
            .open_file(&path, None, 0, -1, crate::buffer_pool::mfp::MfpFlags::default())
            .unwrap();

        let log = AriesLogManager::new(dir.path().join("wal.log"));
        let tx = 1u64;
        log.log_start(tx).unwrap();

        let pin = bp.get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() }).unwrap();
        let before = pin.with_page(|p| p.bytes.clone());
        pin.with_page_mut(|p| p.bytes[30] = 42);
        let after = pin.with_page(|p| p.bytes.clone());
        bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
        let key = pin.key;
        drop(pin);

        log.log_update(tx, key, &before, &after).unwrap();
        log.log_abort(tx, &bp).unwrap();

        let pin2 = bp.get(fileid, GetPgno::Exact(key.pgno), GetFlags::default()).unwrap();
        assert_eq!(pin2.with_page(|p| p.bytes[30]), before[30]);
        let _ = FileId::generate();
    }
}
