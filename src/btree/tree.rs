//! The B-tree/Recno page engine (§4.2): page shapes, the stack-based
//! search used by splits and deletes, bottom-up splitting (modeled
//! here as recursive descent with split propagation on the return
//! path — functionally the same "try leaf, retry parent" effect as an
//! explicit stack loop gets, just carried on the call stack instead of
//! an array; see `DESIGN.md`), reverse-split/empty-page collapse, and
//! record-number maintenance for `C_RECNUM` trees. Generalized from
//! fixed tuple rows and a single fixed comparator to arbitrary
//! byte-string keys/data and a pluggable [`Comparator`].

use std::{
    cmp::Ordering,
    sync::{atomic::{AtomicU32, Ordering as AtomicOrdering}, Arc},
};

use crate::{
    btree::{
        alloc::{alloc_page, free_page},
        comparator::Comparator,
        dup,
        overflow,
    },
    buffer_pool::{BufferPool, GetFlags, GetPgno, PageKey, PagePin, PutFlags},
    error::SmallError,
    fileid::FileId,
    lock::{LockManager, LockMode, LockerId},
    page::{
        btree::{encode_dup_ref, overflow_threshold, try_decode_dup_ref, truncate_separator, InternalEntry, LeafEntry, OverflowRef},
        metadata::MetadataPage,
        Page, PageHeader, PageNo, PageType, INDEX_ENTRY_BYTES, PAGE_HEADER_BYTES,
    },
    types::SmallResult,
};

/// Hard cap on tree height (§4.2 "Root split").
pub const MAX_LEVEL: u8 = 255;

/// Combined dup-run byte budget above which a key's duplicate set
/// migrates off-page (§4.2 "Duplicate").
fn opd_threshold(page_size: usize) -> usize {
    page_size / 4
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Find,
    FindWr,
    KeyFirst,
    KeyLast,
    Stk,
    WrPair,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PutMode {
    /// Reject if the key already exists (single-value trees) or the
    /// exact `(key, data)` pair already exists (duplicate trees).
    NoOverwrite,
    /// Replace the existing single value for this key.
    Overwrite,
    /// Insert a new duplicate before the first existing one.
    KeyFirst,
    /// Insert a new duplicate after the last existing one.
    KeyLast,
}

pub struct SearchResult {
    pub ancestors: Vec<(PagePin, crate::lock::LockHandle, usize)>,
    pub leaf: PagePin,
    pub leaf_lock: crate::lock::LockHandle,
    pub slot: usize,
    pub found: bool,
}

struct SplitInfo {
    separator: Vec<u8>,
    left_pgno: PageNo,
    right_pgno: PageNo,
    left_nrecs: u32,
    right_nrecs: u32,
}

struct InsertOutcome {
    split: Option<SplitInfo>,
    nrecs_delta: i32,
}

/// One B-tree/Recno file: a root-pointer-bearing metadata page (pgno
/// 0) plus the page chain it roots. `recnum` selects the Recno page
/// types and enables `nrecs` maintenance (§4.2 "Record numbers");
/// `dup_sort` selects sorted-duplicate insertion (binary search on
/// `data`) over literal KEYFIRST/KEYLAST positioning.
pub struct BTree {
    pub fileid: FileId,
    pub buffer_pool: Arc<BufferPool>,
    pub lock_manager: Arc<dyn LockManager>,
    pub comparator: Comparator,
    pub recnum: bool,
    pub dup_sort: bool,
    pub page_size: usize,
    /// Fast-path root hint (§4.2): the most recently modified leaf's
    /// pgno, read without the tree mutex and tolerated stale — every
    /// caller double-checks the page it names before trusting it.
    hint_leaf: AtomicU32,
}

impl BTree {
    pub fn create(
        buffer_pool: Arc<BufferPool>,
        lock_manager: Arc<dyn LockManager>,
        fileid: FileId,
        page_size: usize,
        recnum: bool,
        dup_sort: bool,
        comparator: Comparator,
    ) -> Result<Arc<Self>, SmallError> {
        // pgno 0: metadata page.
        let meta_pin = buffer_pool.get(fileid, GetPgno::Exact(0), GetFlags { create: true, ..Default::default() })?;
        let mut meta = MetadataPage::new(fileid, page_size as u32, 1);
        meta.flags = (recnum as u32) | ((dup_sort as u32) << 1);
        meta_pin.with_page_mut(|p| *p = meta.to_page());
        buffer_pool.put(&meta_pin, PutFlags { dirty: true, ..Default::default() })?;

        // pgno 1: empty root leaf.
        let root_type = if recnum { PageType::LeafRecno } else { PageType::LeafBtree };
        let root_pin = buffer_pool.get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })?;
        root_pin.with_page_mut(|p| *p = Page::new_empty(root_pin.key.pgno, root_type, page_size));
        buffer_pool.put(&root_pin, PutFlags { dirty: true, ..Default::default() })?;

        Ok(Arc::new(Self {
            fileid,
            buffer_pool,
            lock_manager,
            comparator,
            recnum,
            dup_sort,
            page_size,
            hint_leaf: AtomicU32::new(0),
        }))
    }

    pub fn open(
        buffer_pool: Arc<BufferPool>,
        lock_manager: Arc<dyn LockManager>,
        fileid: FileId,
        comparator: Comparator,
    ) -> Result<Arc<Self>, SmallError> {
        let meta_pin = buffer_pool.get(fileid, GetPgno::Exact(0), GetFlags::default())?;
        let meta = meta_pin.with_page(MetadataPage::from_page);
        Ok(Arc::new(Self {
            fileid,
            buffer_pool,
            lock_manager,
            comparator,
            recnum: meta.flags & 1 != 0,
            dup_sort: meta.flags & 2 != 0,
            page_size: meta.pagesize as usize,
            hint_leaf: AtomicU32::new(0),
        }))
    }

    pub fn open_cursor(self: &Arc<Self>) -> crate::btree::cursor::Cursor {
        crate::btree::cursor::Cursor::new(self.clone())
    }

    fn root_pgno(&self) -> Result<PageNo, SmallError> {
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(0), GetFlags::default())?;
        Ok(pin.with_page(|p| MetadataPage::from_page(p).root_pgno))
    }

    fn set_root_pgno(&self, pgno: PageNo) -> SmallResult {
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(0), GetFlags::default())?;
        pin.with_page_mut(|p| {
            let mut meta = MetadataPage::from_page(p);
            meta.root_pgno = pgno;
            *p = meta.to_page();
        });
        self.buffer_pool.put(&pin, PutFlags { dirty: true, ..Default::default() })
    }

    // ---- page (de)serialization -----------------------------------

    fn read_leaf(&self, pin: &PagePin) -> (PageHeader, Vec<LeafEntry>) {
        pin.with_page(|p| (p.header(), p.items().iter().map(|b| LeafEntry::decode(b)).collect()))
    }

    fn read_internal(&self, pin: &PagePin) -> (PageHeader, Vec<InternalEntry>) {
        pin.with_page(|p| (p.header(), p.items().iter().map(|b| InternalEntry::decode(b)).collect()))
    }

    fn leaf_fits(&self, entries: &[LeafEntry]) -> bool {
        let needed: usize = entries.iter().map(|e| e.encode().len() + INDEX_ENTRY_BYTES).sum();
        PAGE_HEADER_BYTES + needed <= self.page_size
    }

    fn internal_fits(&self, entries: &[InternalEntry]) -> bool {
        let needed: usize = entries.iter().map(|e| e.encode().len() + INDEX_ENTRY_BYTES).sum();
        PAGE_HEADER_BYTES + needed <= self.page_size
    }

    fn write_leaf(&self, pin: &PagePin, template: &PageHeader, entries: &[LeafEntry]) -> SmallResult {
        let page_type = if self.recnum { PageType::LeafRecno } else { PageType::LeafBtree };
        let mut page = Page::new_empty(template.pgno, page_type, self.page_size);
        let mut header = page.header();
        header.prev_pgno = template.prev_pgno;
        header.next_pgno = template.next_pgno;
        header.level = template.level;
        header.lsn = template.lsn;
        page.set_header(&header);
        for e in entries {
            if !page.insert_item(page.entries(), &e.encode()) {
                return Err(SmallError::new("leaf page overflow during write_leaf"));
            }
        }
        pin.with_page_mut(|p| *p = page);
        self.buffer_pool.put(pin, PutFlags { dirty: true, ..Default::default() })
    }

    fn write_internal(&self, pin: &PagePin, template: &PageHeader, entries: &[InternalEntry]) -> SmallResult {
        let page_type = if self.recnum { PageType::InternalRecno } else { PageType::InternalBtree };
        let mut page = Page::new_empty(template.pgno, page_type, self.page_size);
        let mut header = page.header();
        header.prev_pgno = template.prev_pgno;
        header.next_pgno = template.next_pgno;
        header.level = template.level;
        header.lsn = template.lsn;
        page.set_header(&header);
        for e in entries {
            if !page.insert_item(page.entries(), &e.encode()) {
                return Err(SmallError::new("internal page overflow during write_internal"));
            }
        }
        pin.with_page_mut(|p| *p = page);
        self.buffer_pool.put(pin, PutFlags { dirty: true, ..Default::default() })
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.comparator)(a, b)
    }

    /// Lower bound: the first index whose key is `>= target`, and
    /// whether that key compares equal.
    fn leaf_lower_bound(&self, entries: &[LeafEntry], target: &[u8]) -> (usize, bool) {
        let mut lo = 0usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.cmp(&entries[mid].key, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo < entries.len() && self.cmp(&entries[lo].key, target) == Ordering::Equal;
        (lo, found)
    }

    /// Internal-page child selection: the rightmost non-placeholder
    /// entry whose key is `<= target`, or the placeholder (index 0)
    /// if none qualifies.
    fn internal_child_index(&self, entries: &[InternalEntry], target: &[u8]) -> usize {
        let mut lo = 1usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.cmp(&entries[mid].key, target) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo > 1 {
            lo - 1
        } else {
            0
        }
    }

    // ---- search -----------------------------------------------------

    /// Stack-based search restartable under concurrent modification
    /// (§4.2 "Search"). Collects the full ancestor stack during
    /// descent and releases whatever `mode` doesn't require once the
    /// leaf is reached, rather than releasing mid-descent — see
    /// `DESIGN.md` for why that's equivalent here.
    pub fn search(&self, locker: LockerId, key: &[u8], mode: SearchMode) -> Result<SearchResult, SmallError> {
        let mut ancestors = Vec::new();
        let mut cur_pgno = self.root_pgno()?;

        loop {
            let lock_mode = if matches!(mode, SearchMode::Find) { LockMode::Read } else { LockMode::Write };
            let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, cur_pgno), lock_mode)?;
            let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(cur_pgno), GetFlags::default())?;
            let header = pin.with_page(|p| p.header());

            if header.page_type.is_leaf() {
                let (_, entries) = self.read_leaf(&pin);
                let (mut slot, found) = self.leaf_lower_bound(&entries, key);
                if mode == SearchMode::KeyLast && found {
                    while slot < entries.len() && self.cmp(&entries[slot].key, key) == Ordering::Equal {
                        slot += 1;
                    }
                }

                let retain = match mode {
                    SearchMode::Stk => ancestors.len(),
                    SearchMode::WrPair => ancestors.len().min(1),
                    _ => 0,
                };
                let drop_count = ancestors.len() - retain;
                let kept: Vec<_> = ancestors.split_off(drop_count);
                for (p, l, _) in ancestors {
                    let _ = self.lock_manager.put(l);
                    drop(p);
                }

                return Ok(SearchResult { ancestors: kept, leaf: pin, leaf_lock: lock, slot, found });
            }

            let (_, entries) = self.read_internal(&pin);
            let idx = self.internal_child_index(&entries, key);
            let child_pgno = entries[idx].child_pgno;
            ancestors.push((pin, lock, idx));
            cur_pgno = child_pgno;
        }
    }

    fn release_search(&self, result: SearchResult) {
        let _ = self.lock_manager.put(result.leaf_lock);
        drop(result.leaf);
        for (p, l, _) in result.ancestors {
            let _ = self.lock_manager.put(l);
            drop(p);
        }
    }

    // ---- get / count --------------------------------------------------

    pub fn get(self: &Arc<Self>, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        let locker = self.lock_manager.id();
        let result = self.search(locker, key, SearchMode::Find);
        let out = (|| {
            let r = result?;
            let (_, entries) = self.read_leaf(&r.leaf);
            let out = if r.found && !entries[r.slot].deleted {
                Some(self.materialize_data(&entries[r.slot].data)?)
            } else {
                None
            };
            self.release_search(r);
            Ok(out)
        })();
        self.lock_manager.id_free(locker);
        out
    }

    fn materialize_data(&self, data: &[u8]) -> Result<Vec<u8>, SmallError> {
        if let Some(overflow) = OverflowRef::try_decode(data) {
            overflow::read_chain(&self.buffer_pool, self.fileid, &overflow)
        } else {
            Ok(data.to_vec())
        }
    }

    /// Free the overflow chain an entry's data slot references, if
    /// any, before that slot's old value is discarded by an overwrite
    /// or a logical delete. A no-op for inline data or a `DupRef`
    /// slot (dup chains are freed by their own callers in `dup.rs`).
    fn free_entry_payload(&self, data: &[u8]) -> SmallResult {
        if let Some(overflow) = OverflowRef::try_decode(data) {
            overflow::free_chain(&self.buffer_pool, self.fileid, overflow.first_pgno)?;
        }
        Ok(())
    }

    /// Number of duplicates for `key`: on-page run length, or the
    /// off-page chain's length if the key migrated to an OPD subtree.
    pub fn count(self: &Arc<Self>, key: &[u8]) -> Result<usize, SmallError> {
        let locker = self.lock_manager.id();
        let result = self.search(locker, key, SearchMode::Find);
        let out = (|| {
            let r = result?;
            let (_, entries) = self.read_leaf(&r.leaf);
            let mut n = 0usize;
            if r.found {
                if let Some(first_pgno) = try_decode_dup_ref(&entries[r.slot].data) {
                    n = dup::count(&self.buffer_pool, self.fileid, first_pgno)?;
                } else {
                    let mut s = r.slot;
                    while s < entries.len() && self.cmp(&entries[s].key, key) == Ordering::Equal {
                        if !entries[s].deleted {
                            n += 1;
                        }
                        s += 1;
                    }
                }
            }
            self.release_search(r);
            Ok(n)
        })();
        self.lock_manager.id_free(locker);
        out
    }

    // ---- put ------------------------------------------------------------

    pub fn put(self: &Arc<Self>, key: &[u8], data: &[u8], mode: PutMode) -> SmallResult {
        let locker = self.lock_manager.id();
        let result = self.put_locked(locker, key, data, mode);
        self.lock_manager.id_free(locker);
        result
    }

    fn put_locked(&self, locker: LockerId, key: &[u8], data: &[u8], mode: PutMode) -> SmallResult {
        let root = self.root_pgno()?;
        let outcome = self.insert_recursive(locker, root, key, data, mode)?;

        if let Some(split) = outcome.split {
            let root_lock = self.lock_manager.get(locker, PageKey::new(self.fileid, 0), LockMode::Write)?;
            let old_root_header = {
                let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(split.left_pgno), GetFlags::default())?;
                pin.with_page(|p| p.header())
            };
            let new_level = old_root_header.level.checked_add(1).ok_or_else(|| SmallError::new("too many levels"))?;
            if new_level > MAX_LEVEL {
                self.lock_manager.put(root_lock)?;
                return Err(SmallError::new("too many levels"));
            }

            let new_root_pin = alloc_page(
                &self.buffer_pool,
                self.fileid,
                if self.recnum { PageType::InternalRecno } else { PageType::InternalBtree },
                self.page_size,
            )?;
            let entries = vec![
                InternalEntry { child_pgno: split.left_pgno, nrecs: self.recnum.then_some(split.left_nrecs), key: vec![] },
                InternalEntry { child_pgno: split.right_pgno, nrecs: self.recnum.then_some(split.right_nrecs), key: split.separator },
            ];
            let mut template = new_root_pin.with_page(|p| p.header());
            template.level = new_level;
            self.write_internal(&new_root_pin, &template, &entries)?;
            self.set_root_pgno(new_root_pin.key.pgno)?;
            self.lock_manager.put(root_lock)?;
        }

        Ok(())
    }

    fn insert_recursive(&self, locker: LockerId, pgno: PageNo, key: &[u8], data: &[u8], mode: PutMode) -> Result<InsertOutcome, SmallError> {
        let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, pgno), LockMode::Write)?;
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        let header = pin.with_page(|p| p.header());

        let result = if header.page_type.is_leaf() {
            self.insert_into_leaf(&pin, &header, key, data, mode)
        } else {
            self.insert_into_internal(locker, &pin, &header, key, data, mode)
        };

        self.lock_manager.put(lock)?;
        result
    }

    fn insert_duplicate_slot(&self, entries: &[LeafEntry], run_start: usize, run_end: usize, data: &[u8], mode: PutMode) -> usize {
        if self.dup_sort {
            let mut lo = run_start;
            let mut hi = run_end;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if self.cmp(&entries[mid].data, data) == Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        } else if mode == PutMode::KeyLast {
            run_end
        } else {
            run_start
        }
    }

    fn insert_into_leaf(&self, pin: &PagePin, header: &PageHeader, key: &[u8], data: &[u8], mode: PutMode) -> Result<InsertOutcome, SmallError> {
        let (_, mut entries) = self.read_leaf(pin);
        let (slot, found) = self.leaf_lower_bound(&entries, key);
        let mut nrecs_delta: i32 = 0;

        let data_owned = if data.len() >= overflow_threshold(self.page_size) {
            overflow::write_chain(&self.buffer_pool, self.fileid, self.page_size, data)?.encode()
        } else {
            data.to_vec()
        };

        if found {
            if let Some(first_pgno) = try_decode_dup_ref(&entries[slot].data) {
                let new_head = dup::insert(&self.buffer_pool, self.fileid, self.page_size, Some(first_pgno), &data_owned, &self.comparator)?;
                entries[slot].data = encode_dup_ref(new_head);
                nrecs_delta = 1;
                self.write_leaf(pin, header, &entries)?;
                return Ok(InsertOutcome { split: None, nrecs_delta });
            }

            let mut run_end = slot;
            while run_end < entries.len() && self.cmp(&entries[run_end].key, key) == Ordering::Equal {
                run_end += 1;
            }

            match mode {
                PutMode::NoOverwrite if !entries[slot].deleted => return Err(SmallError::new("key already exists")),
                PutMode::Overwrite | PutMode::NoOverwrite => {
                    let was_deleted = entries[slot].deleted;
                    self.free_entry_payload(&entries[slot].data)?;
                    entries[slot] = LeafEntry::new(key.to_vec(), data_owned);
                    if was_deleted {
                        nrecs_delta = 1;
                    }
                }
                PutMode::KeyFirst | PutMode::KeyLast => {
                    let at = self.insert_duplicate_slot(&entries, slot, run_end, &data_owned, mode);
                    entries.insert(at, LeafEntry::new(key.to_vec(), data_owned.clone()));
                    nrecs_delta = 1;

                    let run_bytes: usize = (slot..=run_end).filter(|&i| i < entries.len()).map(|i| entries[i].encode().len()).sum();
                    if run_bytes >= opd_threshold(self.page_size) {
                        self.promote_run_to_opd(&mut entries, slot, run_end + 1)?;
                    }
                }
            }
        } else {
            entries.insert(slot, LeafEntry::new(key.to_vec(), data_owned));
            nrecs_delta = 1;
        }

        if self.leaf_fits(&entries) {
            self.write_leaf(pin, header, &entries)?;
            self.hint_leaf.store(header.pgno, AtomicOrdering::Relaxed);
            return Ok(InsertOutcome { split: None, nrecs_delta });
        }

        self.split_leaf(pin, header, entries, nrecs_delta)
    }

    /// Migrate an inline duplicate run `[start, end)` to an off-page
    /// chain, replacing it with a single `DupRef` entry.
    fn promote_run_to_opd(&self, entries: &mut Vec<LeafEntry>, start: usize, end: usize) -> SmallResult {
        let key = entries[start].key.clone();
        let mut head = None;
        for e in entries[start..end].iter().filter(|e| !e.deleted) {
            head = Some(dup::insert(&self.buffer_pool, self.fileid, self.page_size, head, &e.data, &self.comparator)?);
        }
        let head = head.expect("promoted run must be non-empty");
        entries.splice(start..end, [LeafEntry::new(key, encode_dup_ref(head))]);
        Ok(())
    }

    fn split_leaf(&self, pin: &PagePin, header: &PageHeader, entries: Vec<LeafEntry>, nrecs_delta: i32) -> Result<InsertOutcome, SmallError> {
        if entries.len() <= 1 {
            return Err(SmallError::new("leaf page cannot be split: single item too large for the page"));
        }
        let mid = self.pick_leaf_split_point(&entries);
        let (left, right) = entries.split_at(mid);
        let (mut left, mut right) = (left.to_vec(), right.to_vec());
        if right.is_empty() {
            // A duplicate run or overflow item spans the whole page;
            // caller's overflow/OPD promotion should prevent this, but
            // guard against pathological single-huge-item pages.
            return Err(SmallError::new("leaf page cannot be split: single item too large"));
        }

        let right_pin = alloc_page(&self.buffer_pool, self.fileid, header.page_type, self.page_size)?;
        let right_pgno = right_pin.key.pgno;
        let left_pgno = header.pgno;

        // fix sibling links
        let old_next = header.next_pgno;
        if old_next != 0 {
            let next_pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(old_next), GetFlags::default())?;
            next_pin.with_page_mut(|p| {
                let mut h = p.header();
                h.prev_pgno = right_pgno;
                p.set_header(&h);
            });
            self.buffer_pool.put(&next_pin, PutFlags { dirty: true, ..Default::default() })?;
        }

        let mut left_header = *header;
        left_header.next_pgno = right_pgno;
        self.write_leaf(pin, &left_header, &left)?;

        let mut right_header = right_pin.with_page(|p| p.header());
        right_header.prev_pgno = left_pgno;
        right_header.next_pgno = old_next;
        right_header.level = header.level;
        self.write_leaf(&right_pin, &right_header, &right)?;

        let separator = truncate_separator(&right[0].key, &left.last().unwrap().key);

        Ok(InsertOutcome {
            split: Some(SplitInfo {
                separator,
                left_pgno,
                right_pgno,
                left_nrecs: left.iter().filter(|e| !e.deleted).count() as u32,
                right_nrecs: right.iter().filter(|e| !e.deleted).count() as u32,
            }),
            nrecs_delta,
        })
    }

    /// Sum sizes from the left, stopping at roughly half the page;
    /// shift up to 3 entries to avoid cutting a duplicate run in half
    /// (§4.2 "Split" step 3).
    fn pick_leaf_split_point(&self, entries: &[LeafEntry]) -> usize {
        let target = self.page_size / 2;
        let mut acc = 0usize;
        let mut cut = entries.len() / 2;
        for (i, e) in entries.iter().enumerate() {
            acc += e.encode().len() + INDEX_ENTRY_BYTES;
            if acc >= target {
                cut = i + 1;
                break;
            }
        }
        cut = cut.clamp(1, entries.len() - 1);

        for shift in 0..=3 {
            for candidate in [cut.saturating_sub(shift), (cut + shift).min(entries.len() - 1)] {
                if candidate == 0 || candidate >= entries.len() {
                    continue;
                }
                if entries[candidate - 1].key != entries[candidate].key {
                    return candidate;
                }
            }
        }
        cut
    }

    fn insert_into_internal(
        &self,
        locker: LockerId,
        pin: &PagePin,
        header: &PageHeader,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> Result<InsertOutcome, SmallError> {
        let (_, mut entries) = self.read_internal(pin);
        let idx = self.internal_child_index(&entries, key);
        let child_pgno = entries[idx].child_pgno;

        let child_outcome = self.insert_recursive(locker, child_pgno, key, data, mode)?;

        if self.recnum {
            if let Some(n) = entries[idx].nrecs {
                entries[idx].nrecs = Some((n as i64 + child_outcome.nrecs_delta as i64).max(0) as u32);
            }
        }

        let split = match child_outcome.split {
            None => {
                self.write_internal(pin, header, &entries)?;
                None
            }
            Some(s) => {
                entries[idx].child_pgno = s.left_pgno;
                if self.recnum {
                    entries[idx].nrecs = Some(s.left_nrecs);
                }
                entries.insert(idx + 1, InternalEntry { child_pgno: s.right_pgno, nrecs: self.recnum.then_some(s.right_nrecs), key: s.separator });

                if self.internal_fits(&entries) {
                    self.write_internal(pin, header, &entries)?;
                    None
                } else {
                    Some(self.split_internal(pin, header, entries)?)
                }
            }
        };

        Ok(InsertOutcome { split, nrecs_delta: child_outcome.nrecs_delta })
    }

    fn split_internal(&self, pin: &PagePin, header: &PageHeader, entries: Vec<InternalEntry>) -> Result<SplitInfo, SmallError> {
        let mid = entries.len() / 2;
        let (left, right) = entries.split_at(mid);
        let (left, mut right) = (left.to_vec(), right.to_vec());

        let separator = right[0].key.clone();
        right[0].key = vec![]; // new placeholder, never compared

        let right_pin = alloc_page(&self.buffer_pool, self.fileid, header.page_type, self.page_size)?;
        let right_pgno = right_pin.key.pgno;
        let left_pgno = header.pgno;

        self.write_internal(pin, header, &left)?;
        let mut right_header = right_pin.with_page(|p| p.header());
        right_header.level = header.level;
        self.write_internal(&right_pin, &right_header, &right)?;

        let sum_nrecs = |v: &[InternalEntry]| v.iter().filter_map(|e| e.nrecs).sum::<u32>();

        Ok(SplitInfo {
            separator,
            left_pgno,
            right_pgno,
            left_nrecs: sum_nrecs(&left),
            right_nrecs: sum_nrecs(&right),
        })
    }

    // ---- delete --------------------------------------------------------

    /// Logical delete at the cursor's key: mark `DELETED`, then attempt
    /// reverse split/collapse of the now-possibly-empty page.
    pub fn del(self: &Arc<Self>, key: &[u8]) -> SmallResult {
        let locker = self.lock_manager.id();
        let result = self.del_locked(locker, key);
        self.lock_manager.id_free(locker);
        result
    }

    fn del_locked(&self, locker: LockerId, key: &[u8]) -> SmallResult {
        let r = self.search(locker, key, SearchMode::Stk)?;
        if !r.found {
            self.release_search(r);
            return Err(SmallError::new("key not found"));
        }

        let (header, mut entries) = self.read_leaf(&r.leaf);
        if let Some(first_pgno) = try_decode_dup_ref(&entries[r.slot].data) {
            // Physically remove one item from the OPD chain; if that
            // empties it, drop the master entry entirely.
            let victim = dup::iter_all(&self.buffer_pool, self.fileid, first_pgno)?.into_iter().next();
            if let Some(victim) = victim {
                dup::remove(&self.buffer_pool, self.fileid, first_pgno, &victim)?;
            }
            if dup::is_empty(&self.buffer_pool, self.fileid, first_pgno)? {
                dup::free_chain(&self.buffer_pool, self.fileid, first_pgno)?;
                entries.remove(r.slot);
            } else {
                self.write_leaf(&r.leaf, &header, &entries)?;
                self.release_search(r);
                return Ok(());
            }
        } else {
            self.free_entry_payload(&entries[r.slot].data)?;
            entries[r.slot].deleted = true;
        }

        self.write_leaf(&r.leaf, &header, &entries)?;
        self.maybe_reverse_split(r, entries)
    }

    /// Physical deletion of all logically-deleted entries on a page,
    /// run when a cursor leaves a page it marked entries dead on.
    pub fn compact_leaf(&self, locker: LockerId, pgno: PageNo) -> SmallResult {
        let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, pgno), LockMode::Write)?;
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        let (header, entries) = self.read_leaf(&pin);
        let kept: Vec<LeafEntry> = entries.into_iter().filter(|e| !e.deleted).collect();
        self.write_leaf(&pin, &header, &kept)?;
        self.lock_manager.put(lock)
    }

    /// After a delete empties a leaf (or an internal page is left with
    /// one child), walk back up freeing the contiguous spine of
    /// now-empty pages and shrinking the separator from the surviving
    /// ancestor (§4.2 "Reverse split / empty-page collapse").
    fn maybe_reverse_split(&self, r: SearchResult, leaf_entries: Vec<LeafEntry>) -> SmallResult {
        let live_count = leaf_entries.iter().filter(|e| !e.deleted).count();
        let leaf_pgno = r.leaf.key.pgno;

        if live_count > 0 || r.ancestors.is_empty() {
            self.release_search(r);
            return Ok(());
        }

        // Root leaf never goes away, even if empty.
        let SearchResult { mut ancestors, leaf, leaf_lock, .. } = r;
        let (parent_pin, parent_lock, child_idx) = ancestors.pop().unwrap();
        let (parent_header, mut parent_entries) = self.read_internal(&parent_pin);

        free_page(&self.buffer_pool, self.fileid, leaf_pgno)?;
        self.lock_manager.put(leaf_lock)?;
        drop(leaf);
        parent_entries.remove(child_idx);

        if parent_entries.len() > 1 {
            self.write_internal(&parent_pin, &parent_header, &parent_entries)?;
            self.lock_manager.put(parent_lock)?;
            for (p, l, _) in ancestors {
                let _ = self.lock_manager.put(l);
                drop(p);
            }
            return Ok(());
        }

        // Parent collapses to a single child: splice it out and
        // continue walking up, unless it's the root.
        let sole_child_pgno = parent_entries[0].child_pgno;
        if ancestors.is_empty() {
            free_page(&self.buffer_pool, self.fileid, parent_header.pgno)?;
            self.lock_manager.put(parent_lock)?;
            self.set_root_pgno(sole_child_pgno)?;
            return Ok(());
        }

        let (grandparent_pin, grandparent_lock, gp_idx) = ancestors.pop().unwrap();
        let (gp_header, mut gp_entries) = self.read_internal(&grandparent_pin);
        gp_entries[gp_idx].child_pgno = sole_child_pgno;
        self.write_internal(&grandparent_pin, &gp_header, &gp_entries)?;
        free_page(&self.buffer_pool, self.fileid, parent_header.pgno)?;
        self.lock_manager.put(parent_lock)?;
        self.lock_manager.put(grandparent_lock)?;
        for (p, l, _) in ancestors {
            let _ = self.lock_manager.put(l);
            drop(p);
        }
        Ok(())
    }

    // ---- leftmost/rightmost + sibling walk, used by the cursor --------

    pub(crate) fn descend_edge(&self, locker: LockerId, leftmost: bool) -> Result<Option<(PagePin, crate::lock::LockHandle)>, SmallError> {
        let mut pgno = self.root_pgno()?;
        loop {
            let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, pgno), LockMode::Read)?;
            let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
            let header = pin.with_page(|p| p.header());
            if header.page_type.is_leaf() {
                if header.entries == 0 {
                    self.lock_manager.put(lock)?;
                    return Ok(None);
                }
                return Ok(Some((pin, lock)));
            }
            let (_, entries) = self.read_internal(&pin);
            let next = if leftmost { entries.first() } else { entries.last() };
            let next_pgno = next.map(|e| e.child_pgno);
            self.lock_manager.put(lock)?;
            pgno = match next_pgno {
                Some(p) => p,
                None => return Ok(None),
            };
        }
    }

    pub(crate) fn fetch_leaf(&self, locker: LockerId, pgno: PageNo) -> Result<(PagePin, crate::lock::LockHandle), SmallError> {
        let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, pgno), LockMode::Read)?;
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        Ok((pin, lock))
    }

    pub(crate) fn entries_of(&self, pin: &PagePin) -> Vec<LeafEntry> {
        self.read_leaf(pin).1
    }

    pub(crate) fn header_of(&self, pin: &PagePin) -> PageHeader {
        pin.with_page(|p| p.header())
    }

    // ---- stats (§11 supplement) ----------------------------------------

    /// Read-only page-count walk, mirroring `__bam_stat`'s counting
    /// logic narrowed to the fields this engine's page model has.
    /// Acquires only read locks, one page at a time, never more than
    /// one outstanding.
    pub fn stats(self: &Arc<Self>) -> Result<BTreeStats, SmallError> {
        let locker = self.lock_manager.id();
        let out = (|| {
            let mut stats = BTreeStats::default();
            let root = self.root_pgno()?;
            self.walk_stats(locker, root, 0, &mut stats)?;
            self.walk_freelist(&mut stats)?;
            Ok(stats)
        })();
        self.lock_manager.id_free(locker);
        out
    }

    fn walk_stats(&self, locker: LockerId, pgno: PageNo, depth: u8, stats: &mut BTreeStats) -> SmallResult {
        let lock = self.lock_manager.get(locker, PageKey::new(self.fileid, pgno), LockMode::Read)?;
        let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        let header = pin.with_page(|p| p.header());
        stats.levels = stats.levels.max(header.level as u32 + 1);

        if header.page_type.is_leaf() {
            stats.leaf_pages += 1;
            let (_, entries) = self.read_leaf(&pin);
            self.lock_manager.put(lock)?;
            drop(pin);
            for e in &entries {
                if let Some(overflow) = OverflowRef::try_decode(&e.data) {
                    stats.overflow_pages += overflow_chain_len(&self.buffer_pool, self.fileid, overflow.first_pgno)?;
                } else if let Some(first_pgno) = try_decode_dup_ref(&e.data) {
                    stats.duplicate_pages += dup::page_count(&self.buffer_pool, self.fileid, first_pgno)?;
                }
            }
            return Ok(());
        }

        stats.internal_pages += 1;
        let (_, entries) = self.read_internal(&pin);
        self.lock_manager.put(lock)?;
        drop(pin);
        for e in &entries {
            self.walk_stats(locker, e.child_pgno, depth + 1, stats)?;
        }
        Ok(())
    }

    fn walk_freelist(&self, stats: &mut BTreeStats) -> SmallResult {
        let meta_pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(0), GetFlags::default())?;
        let meta = meta_pin.with_page(MetadataPage::from_page);
        drop(meta_pin);

        let mut pgno = meta.freelist_head;
        while pgno != 0 {
            stats.free_pages += 1;
            let pin = self.buffer_pool.get(self.fileid, GetPgno::Exact(pgno), GetFlags::default())?;
            pgno = pin.with_page(|p| p.header().next_pgno);
        }
        Ok(())
    }
}

/// Page-count snapshot of one tree (§11 supplement, grounded on
/// `bt_stat.c`'s `__bam_stat`).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BTreeStats {
    pub levels: u32,
    pub leaf_pages: u32,
    pub internal_pages: u32,
    pub overflow_pages: u32,
    pub duplicate_pages: u32,
    pub free_pages: u32,
}

fn overflow_chain_len(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> Result<u32, SmallError> {
    let mut n = 0u32;
    let mut pgno = first_pgno;
    while pgno != 0 {
        n += 1;
        let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        pgno = pin.with_page(|p| p.header().next_pgno);
    }
    Ok(n)
}
