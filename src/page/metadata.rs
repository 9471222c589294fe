//! Page 0 of every file: `{header, magic, version, pagesize,
//! encrypt_alg, flags, fileid, lsn_offset, root_pgno, freelist_head,
//! key_count, record_count}`. Layout is fixed so it stays bit-exact
//! across versions of this crate.

use std::convert::TryInto;

use crate::{
    fileid::{FileId, FILEID_BYTES},
    page::{Page, PageHeader, PageNo, PageType, PAGE_HEADER_BYTES},
};

pub const BTREE_MAGIC: u32 = 0x00_05_31_62; // arbitrary, stable per crate version
pub const METADATA_VERSION: u32 = 1;

pub struct MetadataPage {
    pub magic: u32,
    pub version: u32,
    pub pagesize: u32,
    pub encrypt_alg: u8,
    pub flags: u32,
    pub fileid: FileId,
    pub lsn_offset: i32,
    pub root_pgno: PageNo,
    pub freelist_head: PageNo,
    pub key_count: u64,
    pub record_count: u64,
}

impl MetadataPage {
    pub fn new(fileid: FileId, pagesize: u32, root_pgno: PageNo) -> Self {
        Self {
            magic: BTREE_MAGIC,
            version: METADATA_VERSION,
            pagesize,
            encrypt_alg: 0,
            flags: 0,
            fileid,
            lsn_offset: Self::LSN_FIELD_OFFSET,
            root_pgno,
            freelist_head: 0,
            key_count: 0,
            record_count: 0,
        }
    }

    /// Offset, within the page, of the header's `lsn` field. The
    /// buffer pool reads the 8 bytes at `fileid -> lsn_offset` to
    /// decide what it must force the log to before writing this page
    /// back; for the metadata page that's simply its own header LSN.
    pub const LSN_FIELD_OFFSET: i32 = 18;

    pub fn to_page(&self) -> Page {
        let mut page = Page::new_empty(0, PageType::Metadata, self.pagesize as usize);
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.pagesize.to_le_bytes());
        buf.push(self.encrypt_alg);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(self.fileid.as_bytes());
        buf.extend_from_slice(&self.lsn_offset.to_le_bytes());
        buf.extend_from_slice(&self.root_pgno.to_le_bytes());
        buf.extend_from_slice(&self.freelist_head.to_le_bytes());
        buf.extend_from_slice(&self.key_count.to_le_bytes());
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        page.bytes[PAGE_HEADER_BYTES..PAGE_HEADER_BYTES + buf.len()].copy_from_slice(&buf);
        page
    }

    pub fn from_page(page: &Page) -> Self {
        let buf = &page.bytes[PAGE_HEADER_BYTES..];
        let mut fileid_bytes = [0u8; FILEID_BYTES];
        fileid_bytes.copy_from_slice(&buf[17..17 + FILEID_BYTES]);

        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            pagesize: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            encrypt_alg: buf[12],
            flags: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            fileid: FileId(fileid_bytes),
            lsn_offset: i32::from_le_bytes(
                buf[17 + FILEID_BYTES..21 + FILEID_BYTES].try_into().unwrap(),
            ),
            root_pgno: u32::from_le_bytes(
                buf[21 + FILEID_BYTES..25 + FILEID_BYTES].try_into().unwrap(),
            ),
            freelist_head: u32::from_le_bytes(
                buf[25 + FILEID_BYTES..29 + FILEID_BYTES].try_into().unwrap(),
            ),
            key_count: u64::from_le_bytes(
                buf[29 + FILEID_BYTES..37 + FILEID_BYTES].try_into().unwrap(),
            ),
            record_count: u64::from_le_bytes(
                buf[37 + FILEID_BYTES..45 + FILEID_BYTES].try_into().unwrap(),
            ),
        }
    }

    pub fn header(page: &Page) -> PageHeader {
        page.header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_page_round_trip() {
        let fileid = FileId::generate();
        let meta = MetadataPage::new(fileid, 4096, 1);
        let page = meta.to_page();
        let decoded = MetadataPage::from_page(&page);
        assert_eq!(decoded.fileid, meta.fileid);
        assert_eq!(decoded.pagesize, 4096);
        assert_eq!(decoded.root_pgno, 1);
        assert_eq!(decoded.magic, BTREE_MAGIC);
    }
}
