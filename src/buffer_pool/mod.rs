//! Shared, multi-region page cache: hash-bucketed LRU, pinning,
//! fileid-based file identity, per-buffer I/O serialization and
//! WAL-ordered writeback. Generalized from a fixed-table-schema
//! B-tree cache to a generic multi-file pool keyed by `(fileid, pgno)`,
//! and split into real hash buckets + cache regions per this engine's
//! design instead of one flat map.

pub mod bh;
pub mod mfp;
pub mod region;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex, RwLock,
    },
};

use memmap2::Mmap;

use crate::{
    error::SmallError,
    fileid::FileId,
    lsn::Lsn,
    page::{Page, PageNo},
    types::SmallResult,
};

pub use bh::{BhFlags, BufferHeader, PageKey};
pub use mfp::{MPoolFile, MfpFlags};
use region::CacheRegion;

/// An external collaborator's narrow log contract, consumed only for
/// `force`: the buffer pool must never write a dirty page whose LSN
/// has not yet been made durable (see [`crate::txlog::LogManager`]).
pub trait LogForce: Send + Sync {
    fn flush(&self, up_to: Lsn) -> SmallResult;
}

/// `pgin`/`pgout` hooks, looked up by `ftype` and run on page load /
/// page writeback, e.g. for byte-order swap or encryption. The pool
/// calls `pgin` exactly once per load and sets `CALLPGIN` when it
/// dirties a converted page, so the next reader re-converts.
pub trait PageCodec: Send + Sync {
    fn pgin(&self, pgno: PageNo, bytes: &mut [u8]);
    fn pgout(&self, pgno: PageNo, bytes: &mut [u8]);
}

#[derive(Copy, Clone, Debug)]
pub enum GetPgno {
    Exact(PageNo),
    /// Read current end of file.
    Last,
    /// Extend the file by one page and return it.
    New,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct GetFlags {
    pub create: bool,
    /// Suppress the "page doesn't exist" diagnostic.
    pub extent: bool,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct PutFlags {
    pub dirty: bool,
    pub discard: bool,
    /// Mark clean even if dirty; used only after a successful
    /// writeback, never by ordinary callers.
    pub clean: bool,
}

/// A pinned page. Dropping it unpins (`ref_count -= 1`); callers that
/// dirtied the page must call [`BufferPool::put`] with `dirty: true`
/// before dropping, matching the explicit `put` step in the contract.
pub struct PagePin {
    pub key: PageKey,
    bh: Arc<Mutex<BufferHeader>>,
}

impl PagePin {
    pub fn with_page<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let bh = self.bh.lock().unwrap();
        f(&bh.page)
    }

    pub fn with_page_mut<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut bh = self.bh.lock().unwrap();
        f(&mut bh.page)
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        let mut bh = self.bh.lock().unwrap();
        bh.ref_count = bh.ref_count.saturating_sub(1);
    }
}

const DEFAULT_REGIONS: usize = 4;
const DEFAULT_BUCKETS_PER_REGION: usize = 32;
const DEFAULT_MAX_BUFFERS_PER_REGION: usize = 4096;
const DEFAULT_MMAP_THRESHOLD: u64 = 10 * 1024 * 1024;

pub struct BufferPool {
    regions: Vec<CacheRegion>,
    mfps: RwLock<HashMap<FileId, Arc<Mutex<MPoolFile>>>>,
    codecs: RwLock<HashMap<u32, Arc<dyn PageCodec>>>,
    mmaps: Mutex<HashMap<FileId, Arc<Mmap>>>,
    log_force: RwLock<Option<Arc<dyn LogForce>>>,
    page_size: usize,
    mmap_threshold: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Read-only cache counters (§11 supplement, grounded on `mp_stat.c`'s
/// `memp_stat`), narrowed to the single-process fields this pool
/// actually tracks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub pages_cached: usize,
    pub dirty_pages: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl BufferPool {
    pub fn new(page_size: usize) -> Self {
        let mut regions = Vec::with_capacity(DEFAULT_REGIONS);
        for _ in 0..DEFAULT_REGIONS {
            regions.push(CacheRegion::new(
                DEFAULT_BUCKETS_PER_REGION,
                DEFAULT_MAX_BUFFERS_PER_REGION,
            ));
        }

        Self {
            regions,
            mfps: RwLock::new(HashMap::new()),
            codecs: RwLock::new(HashMap::new()),
            mmaps: Mutex::new(HashMap::new()),
            log_force: RwLock::new(None),
            page_size,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn register_codec(&self, ftype: u32, codec: Arc<dyn PageCodec>) {
        self.codecs.write().unwrap().insert(ftype, codec);
    }

    /// Wire in the external log manager's `force` call, consumed only
    /// to enforce the WAL invariant before a writeback.
    pub fn set_log_force(&self, log: Arc<dyn LogForce>) {
        *self.log_force.write().unwrap() = Some(log);
    }

    fn region_index(&self, fileid: &FileId, pgno: PageNo) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        fileid.hash(&mut hasher);
        pgno.hash(&mut hasher);
        (hasher.finish() as usize) % self.regions.len()
    }

    /// Open (or look up, if already open) the MFP for `path`. `fileid`
    /// is `None` to create a fresh file (a random fileid is stamped)
    /// and `Some` to reopen an existing one under a known identity.
    pub fn open_file(
        &self,
        path: &Path,
        fileid: Option<FileId>,
        ftype: u32,
        lsn_offset: i32,
        flags: MfpFlags,
    ) -> Result<FileId, SmallError> {
        let fileid = fileid.unwrap_or_else(FileId::generate);

        let mut mfps = self.mfps.write().unwrap();
        if let Some(mfp) = mfps.get(&fileid) {
            mfp.lock().unwrap().ref_count += 1;
            return Ok(fileid);
        }

        let mfp = MPoolFile::open(
            path.to_path_buf(),
            fileid,
            self.page_size as u32,
            lsn_offset,
            ftype,
            flags,
        );
        mfps.insert(fileid, Arc::new(Mutex::new(mfp)));
        Ok(fileid)
    }

    fn mfp_arc(&self, fileid: FileId) -> Result<Arc<Mutex<MPoolFile>>, SmallError> {
        self.mfps
            .read()
            .unwrap()
            .get(&fileid)
            .cloned()
            .ok_or_else(|| SmallError::new("file not open in buffer pool"))
    }

    /// `get(fileid, pgno_in_out, flags) -> pinned page`. See §4.1's
    /// search/allocate algorithm: a bucket hit increments `ref_count`
    /// and runs `pgin` if `CALLPGIN` was set; a miss allocates,
    /// evicting if the region is full, then reads (or zero-fills on
    /// `CREATE`/`NEW`).
    pub fn get(
        &self,
        fileid: FileId,
        pgno: GetPgno,
        flags: GetFlags,
    ) -> Result<PagePin, SmallError> {
        let mfp_arc = self.mfp_arc(fileid)?;

        let resolved_pgno = {
            let mut mfp = mfp_arc.lock().unwrap();
            if mfp.dead {
                return Err(SmallError::new("get on dead MFP"));
            }
            match pgno {
                GetPgno::Exact(p) => {
                    if p > mfp.last_pgno && !flags.create && !flags.extent {
                        return Err(SmallError::new("page doesn't exist"));
                    }
                    p
                }
                GetPgno::Last => mfp.last_pgno,
                GetPgno::New => {
                    mfp.last_pgno += 1;
                    mfp.last_pgno
                }
            }
        };

        let key = PageKey::new(fileid, resolved_pgno);
        let region_idx = self.region_index(&fileid, resolved_pgno);
        let region = &self.regions[region_idx];
        let bucket_idx = region.bucket_index(&key);

        // Step 2: look for an existing BH in this bucket.
        {
            let bucket = region.buckets[bucket_idx].lock().unwrap();
            if let Some(bh_arc) = bucket.bh_list.get(&key).cloned() {
                drop(bucket);
                let mut bh = bh_arc.lock().unwrap();
                bh.ref_count += 1;
                if bh.flags.callpgin {
                    if let Some(codec) = self.codec_for(&mfp_arc) {
                        codec.pgin(resolved_pgno, &mut bh.page.bytes);
                    }
                    bh.flags.callpgin = false;
                }
                drop(bh);
                region.touch_lru(key);
                self.hits.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(PagePin { key, bh: bh_arc });
            }
        }

        // Step 3/4: miss. Allocate (evicting if necessary) and read or
        // zero-fill the page.
        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        self.maybe_evict(region)?;

        let page_bytes_len = self.page_size;
        let mut page = Page::from_bytes(vec![0u8; page_bytes_len]);

        let is_new = matches!(pgno, GetPgno::New) || (flags.create && resolved_pgno > 0);
        if !is_new {
            let data = {
                let mut mfp = mfp_arc.lock().unwrap();
                mfp.file
                    .read_at(mfp.page_offset(resolved_pgno), page_bytes_len)
            };
            match data {
                Ok(bytes) => page.bytes = bytes,
                Err(_) if flags.create => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(codec) = self.codec_for(&mfp_arc) {
            codec.pgin(resolved_pgno, &mut page.bytes);
        }

        let bh = BufferHeader::new(key, page, 0);
        let bh_arc = Arc::new(Mutex::new(bh));
        {
            let mut bh = bh_arc.lock().unwrap();
            bh.ref_count = 1;
        }

        {
            let mut bucket = region.buckets[bucket_idx].lock().unwrap();
            bucket.bh_list.insert(key, bh_arc.clone());
        }
        *region.buffer_count.lock().unwrap() += 1;
        region.touch_lru(key);

        Ok(PagePin { key, bh: bh_arc })
    }

    fn codec_for(&self, mfp_arc: &Arc<Mutex<MPoolFile>>) -> Option<Arc<dyn PageCodec>> {
        let ftype = mfp_arc.lock().unwrap().ftype;
        self.codecs.read().unwrap().get(&ftype).cloned()
    }

    /// `put(page_ref, flags)`.
    pub fn put(&self, pin: &PagePin, flags: PutFlags) -> SmallResult {
        let mut bh = pin.bh.lock().unwrap();
        if flags.dirty {
            bh.flags.dirty = true;
        }
        if flags.clean {
            bh.flags.dirty = false;
        }
        if flags.discard {
            bh.flags.discard = true;
        }
        Ok(())
    }

    /// Evict an unpinned buffer from `region` if it has no free slots
    /// left, flushing it first if dirty. Scans the approximate LRU
    /// queue in round-robin order as the design specifies.
    fn maybe_evict(&self, region: &CacheRegion) -> SmallResult {
        let count = *region.buffer_count.lock().unwrap();
        if count < region.max_buffers {
            return Ok(());
        }

        let candidates: Vec<PageKey> = region.lru.lock().unwrap().iter().cloned().collect();
        for key in candidates {
            let bucket_idx = region.bucket_index(&key);
            let bh_arc = {
                let bucket = region.buckets[bucket_idx].lock().unwrap();
                bucket.bh_list.get(&key).cloned()
            };
            let bh_arc = match bh_arc {
                Some(bh_arc) => bh_arc,
                None => continue,
            };

            let evictable = {
                let bh = bh_arc.lock().unwrap();
                bh.evictable()
            };
            if !evictable {
                continue;
            }

            let dirty = bh_arc.lock().unwrap().flags.dirty;
            if dirty {
                self.writeback(key, &bh_arc)?;
            }

            let mut bucket = region.buckets[bucket_idx].lock().unwrap();
            bucket.bh_list.remove(&key);
            drop(bucket);
            *region.buffer_count.lock().unwrap() -= 1;
            self.evictions.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(());
        }

        Err(SmallError::new("cache region exhausted: no evictable buffer"))
    }

    /// Before issuing a page write: force the log up to the page's
    /// LSN (WAL), then write positioned bytes. Drops the buffer
    /// without writing if its MFP is dead.
    fn writeback(&self, key: PageKey, bh_arc: &Arc<Mutex<BufferHeader>>) -> SmallResult {
        let mfp_arc = self.mfp_arc(key.fileid)?;
        let mfp_dead = mfp_arc.lock().unwrap().dead;
        if mfp_dead {
            let mut bh = bh_arc.lock().unwrap();
            bh.flags.dirty = false;
            return Ok(());
        }

        let mfp_lsn_offset = mfp_arc.lock().unwrap().lsn_offset;

        let mut bh = bh_arc.lock().unwrap();
        bh.flags.locked = true;

        if mfp_lsn_offset >= 0 {
            let lsn = bh.page.lsn();
            if let Some(log) = self.log_force.read().unwrap().as_ref() {
                log.flush(lsn)?;
            }
        }

        let mut bytes = bh.page.bytes.clone();
        if let Some(codec) = self.codec_for(&mfp_arc) {
            codec.pgout(bh.page.pgno(), &mut bytes);
        }

        {
            let mut mfp = mfp_arc.lock().unwrap();
            let offset = mfp.page_offset(key.pgno);
            mfp.file.write_at(offset, &bytes)?;
        }

        bh.flags.dirty = false;
        bh.flags.locked = false;
        Ok(())
    }

    /// `sync(up_to_lsn)`: walk every region's BH list building the
    /// dirty working set, then write them back in `(fileid, pgno)`
    /// order to encourage sequential I/O.
    pub fn sync(&self, _up_to_lsn: Lsn) -> SmallResult {
        let mut dirty: Vec<(PageKey, Arc<Mutex<BufferHeader>>)> = Vec::new();
        for region in &self.regions {
            for bucket in &region.buckets {
                let bucket = bucket.lock().unwrap();
                for (key, bh_arc) in bucket.bh_list.iter() {
                    if bh_arc.lock().unwrap().flags.dirty {
                        dirty.push((*key, bh_arc.clone()));
                    }
                }
            }
        }

        dirty.sort_by_key(|(k, _)| (k.fileid.0, k.pgno));
        for (key, bh_arc) in dirty {
            self.writeback(key, &bh_arc)?;
        }
        Ok(())
    }

    /// `nameop(fileid, new_name_or_none, old_path, new_path)`: rename
    /// is a fileid-preserving path swap; remove marks the MFP dead so
    /// readers still holding cached buffers discard rather than write
    /// back (the race a global file-table lock would otherwise need
    /// to prevent).
    pub fn nameop(
        &self,
        fileid: FileId,
        new_path: Option<PathBuf>,
    ) -> SmallResult {
        let mfp_arc = self.mfp_arc(fileid)?;
        let mut mfp = mfp_arc.lock().unwrap();
        match new_path {
            Some(path) => {
                std::fs::rename(&mfp.path, &path).map_err(SmallError::from)?;
                mfp.path = path;
            }
            None => {
                mfp.dead = true;
            }
        }
        Ok(())
    }

    /// Mmap fast path: eligible only for small, read-only, non-temp
    /// files with no registered pgin/pgout. Returns `None` when not
    /// eligible, in which case callers fall back to `get`.
    pub fn try_mmap(&self, fileid: FileId) -> Option<Arc<Mmap>> {
        if let Some(existing) = self.mmaps.lock().unwrap().get(&fileid) {
            return Some(existing.clone());
        }

        let mfp_arc = self.mfps.read().unwrap().get(&fileid)?.clone();
        let mfp = mfp_arc.lock().unwrap();
        if self.codecs.read().unwrap().contains_key(&mfp.ftype) {
            return None;
        }
        if !mfp.mmap_eligible(self.mmap_threshold) {
            return None;
        }

        let file = std::fs::File::open(&mfp.path).ok()?;
        let mmap = unsafe { Mmap::map(&file).ok()? };
        let mmap = Arc::new(mmap);
        self.mmaps.lock().unwrap().insert(fileid, mmap.clone());
        Some(mmap)
    }

    /// Switching a file from read-only to read-write invalidates the
    /// mmap path: existing mapped pointers remain valid for whoever
    /// already holds them, but no new mmap is handed out.
    pub fn invalidate_mmap(&self, fileid: FileId) {
        self.mmaps.lock().unwrap().remove(&fileid);
        if let Ok(mfps) = self.mfps.read() {
            if let Some(mfp) = mfps.get(&fileid) {
                mfp.lock().unwrap().flags.can_mmap = false;
            }
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Read-only cache counters, gathered without acquiring any lock
    /// longer than a single bucket's (§11 supplement).
    pub fn stats(&self) -> BufferPoolStats {
        let mut pages_cached = 0usize;
        let mut dirty_pages = 0usize;
        for region in &self.regions {
            for bucket in &region.buckets {
                let bucket = bucket.lock().unwrap();
                pages_cached += bucket.bh_list.len();
                dirty_pages += bucket
                    .bh_list
                    .values()
                    .filter(|bh| bh.lock().unwrap().flags.dirty)
                    .count();
            }
        }
        BufferPoolStats {
            pages_cached,
            dirty_pages,
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            evictions: self.evictions.load(AtomicOrdering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::mfp::MfpFlags;
    use std::sync::atomic::AtomicBool;

    fn open(bp: &BufferPool, dir: &std::path::Path, name: &str) -> FileId {
        bp.open_file(&dir.join(name), None, 0, 0, MfpFlags::default()).unwrap()
    }

    #[test]
    fn put_get_round_trips_dirty_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let bp = BufferPool::new(512);
        let fileid = open(&bp, dir.path(), "a.db");

        let pin = bp
            .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
            .unwrap();
        pin.with_page_mut(|p| p.bytes[0] = 7);
        bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
        let pgno = pin.key.pgno;
        drop(pin);

        let pin2 = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default()).unwrap();
        assert_eq!(pin2.with_page(|p| p.bytes[0]), 7);
    }

    struct FailForce(AtomicBool);
    impl LogForce for FailForce {
        fn flush(&self, _up_to: Lsn) -> SmallResult {
            if self.0.load(AtomicOrdering::SeqCst) {
                Err(SmallError::new("stubbed flush failure"))
            } else {
                Ok(())
            }
        }
    }

    /// Scenario 6: a stubbed `flush` failure must abort the write
    /// rather than let a page reach disk with an unforced LSN.
    #[test]
    fn writeback_aborts_if_log_flush_fails() {
        let dir = tempfile::tempdir().unwrap();
        let bp = BufferPool::new(512);
        let fileid = open(&bp, dir.path(), "a.db");
        bp.set_log_force(Arc::new(FailForce(AtomicBool::new(true))));

        let pin = bp
            .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
            .unwrap();
        bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
        let key = pin.key;
        drop(pin);

        let err = bp.sync(Lsn::ZERO);
        assert!(err.is_err());

        // the buffer must still be dirty: the failed writeback must not
        // have cleared the flag or written the page.
        let region_idx = bp.region_index(&fileid, key.pgno);
        let bucket_idx = bp.regions[region_idx].bucket_index(&key);
        let bucket = bp.regions[region_idx].buckets[bucket_idx].lock().unwrap();
        let bh = bucket.bh_list.get(&key).unwrap().lock().unwrap();
        assert!(bh.flags.dirty);
    }

    #[test]
    fn dead_mfp_discards_dirty_buffer_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let bp = BufferPool::new(512);
        let fileid = open(&bp, dir.path(), "a.db");

        let pin = bp
            .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
            .unwrap();
        bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
        drop(pin);

        bp.nameop(fileid, None).unwrap();
        assert!(bp.sync(Lsn::ZERO).is_ok());
    }

    #[test]
    fn stats_reflect_hits_misses_and_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let bp = BufferPool::new(512);
        let fileid = open(&bp, dir.path(), "a.db");

        let pin = bp
            .get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })
            .unwrap();
        bp.put(&pin, PutFlags { dirty: true, ..Default::default() }).unwrap();
        let pgno = pin.key.pgno;
        drop(pin);

        let before = bp.stats();
        assert_eq!(before.pages_cached, 1);
        assert_eq!(before.dirty_pages, 1);
        assert_eq!(before.misses, 1);

        let pin2 = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default()).unwrap();
        drop(pin2);
        let after = bp.stats();
        assert_eq!(after.hits, 1);
    }

    #[test]
    fn rename_preserves_fileid_identity() {
        let dir = tempfile::tempdir().unwrap();
        let bp = BufferPool::new(512);
        let fileid = open(&bp, dir.path(), "a.db");
        let new_path = dir.path().join("b.db");

        bp.nameop(fileid, Some(new_path.clone())).unwrap();
        let mfp = bp.mfp_arc(fileid).unwrap();
        assert_eq!(mfp.lock().unwrap().path, new_path);
    }
}
