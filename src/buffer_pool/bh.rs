use crate::{fileid::FileId, page::Page, page::PageNo};

/// Identifies one cached page: a file plus a page number. Keys the
/// hash buckets and the per-region BH maps.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageKey {
    pub fileid: FileId,
    pub pgno: PageNo,
}

impl PageKey {
    pub fn new(fileid: FileId, pgno: PageNo) -> Self {
        Self { fileid, pgno }
    }
}

/// Buffer-header flags. `LOCKED` means I/O is in progress on this
/// buffer and every reader must wait on its guard mutex rather than
/// trust the bytes; `TRASH` means the bytes are not yet valid (set
/// while a fresh buffer's read is outstanding); `CALLPGIN` means the
/// next reader must run the page-in conversion before trusting the
/// bytes; `DISCARD` means evict on unpin regardless of recency.
#[derive(Copy, Clone, Default, Debug)]
pub struct BhFlags {
    pub dirty: bool,
    pub locked: bool,
    pub trash: bool,
    pub callpgin: bool,
    pub sync: bool,
    pub discard: bool,
}

/// An in-cache wrapper around one [`Page`]. The per-BH I/O mutex the
/// design calls for is realized here as the `Mutex` that guards the
/// whole `BufferHeader` (see [`crate::buffer_pool::CacheRegion`]):
/// holding that lock across a disk read/write is exactly "holding the
/// I/O mutex", and it is never acquired while a bucket mutex is held.
pub struct BufferHeader {
    pub key: PageKey,
    pub ref_count: u32,
    pub ref_sync_count: u32,
    pub priority: u64,
    pub flags: BhFlags,
    pub page: Page,
}

impl BufferHeader {
    pub fn new(key: PageKey, page: Page, priority: u64) -> Self {
        Self {
            key,
            ref_count: 0,
            ref_sync_count: 0,
            priority,
            flags: BhFlags::default(),
            page,
        }
    }

    pub fn evictable(&self) -> bool {
        self.ref_count == 0
    }
}
