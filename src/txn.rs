//! Transaction manager: begin/commit/abort bookkeeping external to
//! the B-tree core, per §6's `begin`/`commit`/`abort` contract. Each
//! transaction is just an id plus a status lookup; it drives the
//! generic [`crate::lock::LockManager`], [`crate::txlog::AriesLogManager`]
//! and [`crate::buffer_pool::BufferPool`] rather than owning any
//! table-specific state itself.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use crate::{
    buffer_pool::BufferPool,
    lock::{LockManager, LockerId},
    txlog::AriesLogManager,
    types::SmallResult,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// A single client transaction. Holds nothing but its locker id and
/// status; the actual lock/page state lives in the lock manager and
/// buffer pool, addressed by that id.
#[derive(Debug, Clone, Copy)]
pub struct Transaction {
    pub locker: LockerId,
}

/// Drives `begin`/`commit`/`abort` over the lock manager, log manager
/// and buffer pool. One instance lives per open environment.
pub struct TransactionManager {
    status: RwLock<HashMap<LockerId, TransactionStatus>>,
    log: AriesLogManager,
    lock_manager: Box<dyn LockManager>,
}

impl TransactionManager {
    pub fn new(log: AriesLogManager, lock_manager: Box<dyn LockManager>) -> Self {
        Self {
            status: RwLock::new(HashMap::new()),
            log,
            lock_manager,
        }
    }

    pub fn begin(&self) -> Result<Transaction, crate::error::SmallError> {
        let locker = self.lock_manager.id();
        self.log.log_start(locker)?;
        self.status.write().unwrap().insert(locker, TransactionStatus::Active);
        Ok(Transaction { locker })
    }

    pub fn status_of(&self, locker: LockerId) -> Option<TransactionStatus> {
        self.status.read().unwrap().get(&locker).copied()
    }

    /// Force dirty pages the transaction touched, write the COMMIT
    /// record, release every lock it holds. `force` mirrors the
    /// teacher's `aries_no_force` feature flag: when off, a commit can
    /// return before its pages hit disk, relying purely on the log.
    pub fn commit(&self, tx: Transaction, buffer_pool: &BufferPool, force: bool) -> SmallResult {
        if force {
            buffer_pool.sync(crate::lsn::Lsn::ZERO)?;
        }

        self.log.log_commit(tx.locker)?;
        self.lock_manager.release_locker(tx.locker);
        self.status
            .write()
            .unwrap()
            .insert(tx.locker, TransactionStatus::Committed);
        Ok(())
    }

    /// Roll the transaction's updates back via the log (restoring
    /// before-images through the buffer pool), then release its locks.
    pub fn abort(&self, tx: Transaction, buffer_pool: &BufferPool) -> SmallResult {
        self.log.log_abort(tx.locker, buffer_pool)?;
        self.lock_manager.release_locker(tx.locker);
        self.status
            .write()
            .unwrap()
            .insert(tx.locker, TransactionStatus::Aborted);
        Ok(())
    }

    pub fn checkpoint(&self, buffer_pool: &BufferPool) -> SmallResult {
        self.log.log_checkpoint(buffer_pool)
    }

    pub fn recover(&self, buffer_pool: &BufferPool) -> SmallResult {
        self.log.recover(buffer_pool)
    }

    pub fn lock_manager(&self) -> &dyn LockManager {
        self.lock_manager.as_ref()
    }
}
