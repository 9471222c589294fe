use std::path::PathBuf;

use crate::{fileid::FileId, io::SmallFile, page::PageNo};

/// `MPoolFile` flags. `temp` files have no stable backing name;
/// `can_mmap` is cleared the moment a file is opened for write, even
/// if existing readers keep using pointers they already obtained.
#[derive(Copy, Clone, Default, Debug)]
pub struct MfpFlags {
    pub temp: bool,
    pub can_mmap: bool,
    pub durable: bool,
    pub no_backing_file: bool,
    pub unlink_on_close: bool,
}

/// Shared descriptor for one backing file, keyed by its 20-byte
/// fileid rather than its path. Two handles opened against the same
/// fileid share one `MPoolFile`; `dead` is sticky once set by
/// [`crate::buffer_pool::BufferPool::nameop`] removing the file —
/// every dirty buffer belonging to it is discarded rather than
/// written back from that point on.
pub struct MPoolFile {
    pub fileid: FileId,
    pub path: PathBuf,
    pub page_size: u32,
    pub last_pgno: PageNo,
    pub orig_last_pgno: PageNo,
    pub ref_count: u32,
    pub block_count: u32,
    pub dead: bool,
    pub flags: MfpFlags,
    pub lsn_offset: i32,
    pub ftype: u32,
    pub file: SmallFile,
}

impl MPoolFile {
    pub fn open(
        path: PathBuf,
        fileid: FileId,
        page_size: u32,
        lsn_offset: i32,
        ftype: u32,
        flags: MfpFlags,
    ) -> Self {
        let file = SmallFile::new(&path);
        let file_len = file.get_size().unwrap_or(0);
        let last_pgno = if page_size == 0 {
            0
        } else {
            (file_len / page_size as u64) as PageNo
        };

        Self {
            fileid,
            path,
            page_size,
            last_pgno,
            orig_last_pgno: last_pgno,
            ref_count: 1,
            block_count: 0,
            dead: false,
            flags,
            lsn_offset,
            ftype,
            file,
        }
    }

    pub fn page_offset(&self, pgno: PageNo) -> u64 {
        pgno as u64 * self.page_size as u64
    }

    pub fn mmap_eligible(&self, threshold_bytes: u64) -> bool {
        !self.flags.temp
            && !self.dead
            && self.last_pgno as u64 * self.page_size as u64 <= threshold_bytes
    }
}
