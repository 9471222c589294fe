//! Cursor protocol (§3 "Cursor", §4.2): a position within a tree that
//! survives the underlying page being split or having items deleted
//! out from under it. Iterates a page chain with next/prev/rewind,
//! generalized to the key/data model and to the `SearchMode` table
//! this engine's `BTree` exposes.

use std::sync::Arc;

use crate::{
    btree::tree::{BTree, PutMode, SearchMode},
    buffer_pool::PagePin,
    error::SmallError,
    lock::{LockHandle, LockManager, LockerId},
    page::{btree::{try_decode_dup_ref, LeafEntry}, PageNo},
    types::SmallResult,
};

/// Bits describing why a cursor is positioned where it is.
#[derive(Copy, Clone, Default, Debug)]
pub struct CursorFlags {
    /// The item under the cursor has been logically deleted.
    pub deleted: bool,
    /// Positioned inside an off-page duplicate (OPD) subtree.
    pub opd: bool,
}

/// Where a cursor currently sits: the leaf page, the item's slot,
/// and — if positioned inside an OPD chain — the chain head and the
/// index of the current item within the chain's flattened contents.
struct Position {
    leaf_pgno: PageNo,
    slot: usize,
    opd_head: Option<PageNo>,
    opd_index: usize,
}

/// A live handle into a [`BTree`]. Holds its own locker id, released
/// on drop/`close`.
pub struct Cursor {
    tree: Arc<BTree>,
    locker: LockerId,
    position: Option<Position>,
    pub flags: CursorFlags,
}

impl Cursor {
    pub(crate) fn new(tree: Arc<BTree>) -> Self {
        let locker = tree.lock_manager.id();
        Self { tree, locker, position: None, flags: CursorFlags::default() }
    }

    /// Release the cursor's locks and pins. Equivalent to dropping it;
    /// kept as an explicit method since closing a cursor is a named
    /// step in the spec's cursor lifecycle (§3 "Cursor").
    pub fn close(self) {
        drop(self);
    }

    fn fetch(&self, pgno: PageNo) -> Result<(PagePin, LockHandle), SmallError> {
        self.tree.fetch_leaf(self.locker, pgno)
    }

    fn entries_at(&self, pgno: PageNo) -> Result<Vec<LeafEntry>, SmallError> {
        let (pin, lock) = self.fetch(pgno)?;
        let entries = self.tree.entries_of(&pin);
        self.tree.lock_manager.put(lock)?;
        Ok(entries)
    }

    /// Move to the first record, or `None` if the tree is empty.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let edge = self.tree.descend_edge(self.locker, true)?;
        let (pin, lock) = match edge {
            Some(p) => p,
            None => {
                self.position = None;
                return Ok(None);
            }
        };
        let pgno = pin.key.pgno;
        self.tree.lock_manager.put(lock)?;
        self.position = Some(Position { leaf_pgno: pgno, slot: 0, opd_head: None, opd_index: 0 });
        self.advance_past_deleted(true)
    }

    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let edge = self.tree.descend_edge(self.locker, false)?;
        let (pin, lock) = match edge {
            Some(p) => p,
            None => {
                self.position = None;
                return Ok(None);
            }
        };
        let pgno = pin.key.pgno;
        let entries = self.tree.entries_of(&pin);
        self.tree.lock_manager.put(lock)?;
        if entries.is_empty() {
            self.position = None;
            return Ok(None);
        }
        self.position = Some(Position { leaf_pgno: pgno, slot: entries.len() - 1, opd_head: None, opd_index: 0 });
        self.current()
    }

    /// Position on `key` (the first duplicate, if any). Does not
    /// modify the tree regardless of `mode` — use [`Cursor::put`] for
    /// inserting.
    pub fn get(&mut self, key: &[u8], mode: SearchMode) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let r = self.tree.search(self.locker, key, mode)?;
        if !r.found {
            for (_, l, _) in r.ancestors {
                self.tree.lock_manager.put(l)?;
            }
            self.tree.lock_manager.put(r.leaf_lock)?;
            self.position = None;
            return Ok(None);
        }
        let pgno = r.leaf.key.pgno;
        let slot = r.slot;
        for (_, l, _) in r.ancestors {
            self.tree.lock_manager.put(l)?;
        }
        self.tree.lock_manager.put(r.leaf_lock)?;

        self.position = Some(Position { leaf_pgno: pgno, slot, opd_head: None, opd_index: 0 });
        self.current()
    }

    fn current(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let pos = match &self.position {
            Some(p) => p,
            None => return Ok(None),
        };
        let entries = self.entries_at(pos.leaf_pgno)?;
        if pos.slot >= entries.len() {
            self.position = None;
            return Ok(None);
        }
        let entry = &entries[pos.slot];

        if let Some(first_pgno) = try_decode_dup_ref(&entry.data) {
            let items = crate::btree::dup::iter_all(&self.tree.buffer_pool, self.tree.fileid, first_pgno)?;
            // A position can land directly on a dup-ref slot (via
            // `get`/`first`/`last`) without having descended into the
            // chain yet; enter it here so `next()` advances from item
            // 0 instead of re-discovering the chain and replaying it.
            let entry_key = entry.key.clone();
            let pos = self.position.as_mut().unwrap();
            if pos.opd_head.is_none() {
                pos.opd_head = Some(first_pgno);
                pos.opd_index = 0;
            }
            let idx = pos.opd_index;
            if idx >= items.len() {
                return self.next();
            }
            self.flags.opd = true;
            return Ok(Some((entry_key, items[idx].clone())));
        }

        self.flags.opd = false;
        if entry.deleted {
            self.flags.deleted = true;
            return self.next();
        }
        self.flags.deleted = false;
        Ok(Some((entry.key.clone(), self.materialize(&entry.data)?)))
    }

    fn materialize(&self, data: &[u8]) -> Result<Vec<u8>, SmallError> {
        if let Some(overflow) = crate::page::btree::OverflowRef::try_decode(data) {
            crate::btree::overflow::read_chain(&self.tree.buffer_pool, self.tree.fileid, &overflow)
        } else {
            Ok(data.to_vec())
        }
    }

    fn advance_past_deleted(&mut self, forward: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let got = self.current()?;
        if got.is_some() {
            return Ok(got);
        }
        if forward {
            self.next()
        } else {
            self.prev()
        }
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let pos = match &mut self.position {
            Some(p) => p,
            None => return Ok(None),
        };

        // Inside an OPD chain: just advance the flattened index.
        if let Some(first_pgno) = pos.opd_head {
            let items = crate::btree::dup::iter_all(&self.tree.buffer_pool, self.tree.fileid, first_pgno)?;
            if pos.opd_index + 1 < items.len() {
                pos.opd_index += 1;
                return self.current();
            }
            pos.opd_head = None;
            pos.opd_index = 0;
            pos.slot += 1;
            return self.roll_forward();
        }

        let entries = self.entries_at(pos.leaf_pgno)?;
        if pos.slot < entries.len() {
            if let Some(first_pgno) = try_decode_dup_ref(&entries[pos.slot].data) {
                pos.opd_head = Some(first_pgno);
                pos.opd_index = 0;
                return self.current();
            }
        }
        pos.slot += 1;
        self.roll_forward()
    }

    /// If `slot` ran past the end of the current leaf, hop to the next
    /// leaf in the chain (possibly several times, skipping empties).
    fn roll_forward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        loop {
            let pos = match &mut self.position {
                Some(p) => p,
                None => return Ok(None),
            };
            let (pin, lock) = self.fetch(pos.leaf_pgno)?;
            let header = self.tree.header_of(&pin);
            let entries = self.tree.entries_of(&pin);
            self.tree.lock_manager.put(lock)?;

            if pos.slot < entries.len() {
                return self.current();
            }
            if header.next_pgno == 0 {
                self.position = None;
                return Ok(None);
            }
            self.position = Some(Position { leaf_pgno: header.next_pgno, slot: 0, opd_head: None, opd_index: 0 });
        }
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        let pos = match &mut self.position {
            Some(p) => p,
            None => return Ok(None),
        };

        if let Some(first_pgno) = pos.opd_head {
            if pos.opd_index > 0 {
                pos.opd_index -= 1;
                return self.current();
            }
            pos.opd_head = None;
            if pos.slot == 0 {
                return self.roll_backward();
            }
            pos.slot -= 1;
            let _ = first_pgno;
            return self.current();
        }

        if pos.slot == 0 {
            return self.roll_backward();
        }
        pos.slot -= 1;
        self.current()
    }

    fn roll_backward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SmallError> {
        loop {
            let pos = match &mut self.position {
                Some(p) => p,
                None => return Ok(None),
            };
            let (pin, lock) = self.fetch(pos.leaf_pgno)?;
            let header = self.tree.header_of(&pin);
            self.tree.lock_manager.put(lock)?;

            if header.prev_pgno == 0 {
                self.position = None;
                return Ok(None);
            }
            let prev_entries = self.entries_at(header.prev_pgno)?;
            if prev_entries.is_empty() {
                self.position = Some(Position { leaf_pgno: header.prev_pgno, slot: 0, opd_head: None, opd_index: 0 });
                continue;
            }
            self.position = Some(Position { leaf_pgno: header.prev_pgno, slot: prev_entries.len() - 1, opd_head: None, opd_index: 0 });
            return self.current();
        }
    }

    /// Insert `(key, data)` at this cursor. For duplicate trees, `mode`
    /// selects the insertion point within the existing duplicate run.
    pub fn put(&mut self, key: &[u8], data: &[u8], mode: PutMode) -> SmallResult {
        self.tree.put(key, data, mode)?;
        self.get(key, SearchMode::Find)?;
        Ok(())
    }

    /// Logically delete the item under the cursor.
    pub fn del(&mut self) -> SmallResult {
        let (key, _) = match self.current()? {
            Some(kv) => kv,
            None => return Err(SmallError::new("cursor not positioned on a record")),
        };
        self.tree.del(&key)?;
        self.flags.deleted = true;
        Ok(())
    }

    /// Number of duplicates sharing the cursor's current key.
    pub fn count(&mut self) -> Result<usize, SmallError> {
        let (key, _) = match self.current()? {
            Some(kv) => kv,
            None => return Ok(0),
        };
        self.tree.count(&key)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.tree.lock_manager.id_free(self.locker);
    }
}
