//! On-disk page format: a fixed-size byte block with a 26-byte header,
//! an ascending index array at the low end, and a heap of
//! variable-length items packed down from the high end. A slotted
//! layout generalized from typed tuples to raw key/data byte slices
//! per the page shapes in this engine's B-tree/Recno/overflow/metadata
//! variants.

pub mod btree;
pub mod metadata;

use std::convert::TryInto;

use crate::{
    io::{Decodeable, Encodeable},
    lsn::Lsn,
};

pub type PageNo = u32;

pub const INVALID_PGNO: PageNo = 0;
pub const PAGE_HEADER_BYTES: usize = 26;
pub const INDEX_ENTRY_BYTES: usize = 2;

/// Page type tag, stored as the single byte `header.page_type`. The
/// hash and queue access methods are out of scope for this crate, but
/// their tags are kept here so a page of unknown type fails loudly
/// instead of being silently misread.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageType {
    LeafBtree,
    LeafDuplicate,
    LeafRecno,
    InternalBtree,
    InternalRecno,
    Overflow,
    Metadata,
    QueueData,
    QueueMetadata,
    Invalid,
}

impl PageType {
    pub fn to_u8(&self) -> u8 {
        match self {
            PageType::LeafBtree => 0,
            PageType::LeafDuplicate => 1,
            PageType::LeafRecno => 2,
            PageType::InternalBtree => 3,
            PageType::InternalRecno => 4,
            PageType::Overflow => 5,
            PageType::Metadata => 6,
            PageType::QueueData => 7,
            PageType::QueueMetadata => 8,
            PageType::Invalid => 255,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => PageType::LeafBtree,
            1 => PageType::LeafDuplicate,
            2 => PageType::LeafRecno,
            3 => PageType::InternalBtree,
            4 => PageType::InternalRecno,
            5 => PageType::Overflow,
            6 => PageType::Metadata,
            7 => PageType::QueueData,
            8 => PageType::QueueMetadata,
            _ => PageType::Invalid,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            PageType::LeafBtree | PageType::LeafDuplicate | PageType::LeafRecno
        )
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, PageType::InternalBtree | PageType::InternalRecno)
    }
}

/// `{pgno, prev_pgno, next_pgno, entries, hoffset, level, type, lsn}`,
/// 26 bytes, little-endian, written as it appears in memory.
#[derive(Copy, Clone, Debug)]
pub struct PageHeader {
    pub pgno: PageNo,
    pub prev_pgno: PageNo,
    pub next_pgno: PageNo,
    pub entries: u16,
    pub hoffset: u16,
    pub level: u8,
    pub page_type: PageType,
    pub lsn: Lsn,
}

impl PageHeader {
    pub fn new(pgno: PageNo, page_type: PageType, page_size: usize) -> Self {
        Self {
            pgno,
            prev_pgno: INVALID_PGNO,
            next_pgno: INVALID_PGNO,
            entries: 0,
            hoffset: page_size as u16,
            level: 0,
            page_type,
            lsn: Lsn::ZERO,
        }
    }

    pub fn encode(&self) -> [u8; PAGE_HEADER_BYTES] {
        let mut buf = [0u8; PAGE_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.pgno.to_le_bytes());
        buf[4..8].copy_from_slice(&self.prev_pgno.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next_pgno.to_le_bytes());
        buf[12..14].copy_from_slice(&self.entries.to_le_bytes());
        buf[14..16].copy_from_slice(&self.hoffset.to_le_bytes());
        buf[16] = self.level;
        buf[17] = self.page_type.to_u8();
        buf[18..22].copy_from_slice(&self.lsn.file.to_le_bytes());
        buf[22..26].copy_from_slice(&self.lsn.offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= PAGE_HEADER_BYTES, "page header truncated");
        Self {
            pgno: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            prev_pgno: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            next_pgno: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            entries: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            hoffset: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
            level: buf[16],
            page_type: PageType::from_u8(buf[17]),
            lsn: Lsn::new(
                u32::from_le_bytes(buf[18..22].try_into().unwrap()),
                u32::from_le_bytes(buf[22..26].try_into().unwrap()),
            ),
        }
    }
}

/// A raw, fixed-size page buffer with a slotted layout: the header,
/// then an ascending index array (one `u16` offset per item) growing
/// from the low end, then an item heap packed down from `hoffset`.
/// An "arena + indices" shape: nothing in a page ever holds a pointer,
/// only a `pgno` or an offset into its own bytes.
#[derive(Clone)]
pub struct Page {
    pub bytes: Vec<u8>,
}

impl Page {
    pub fn new_empty(pgno: PageNo, page_type: PageType, page_size: usize) -> Self {
        let header = PageHeader::new(pgno, page_type, page_size);
        let mut bytes = vec![0u8; page_size];
        bytes[0..PAGE_HEADER_BYTES].copy_from_slice(&header.encode());
        Self { bytes }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn page_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn header(&self) -> PageHeader {
        PageHeader::decode(&self.bytes)
    }

    pub fn set_header(&mut self, header: &PageHeader) {
        self.bytes[0..PAGE_HEADER_BYTES].copy_from_slice(&header.encode());
    }

    pub fn pgno(&self) -> PageNo {
        self.header().pgno
    }

    pub fn lsn(&self) -> Lsn {
        self.header().lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        let mut h = self.header();
        h.lsn = lsn;
        self.set_header(&h);
    }

    fn index_array_offset(&self, slot: u16) -> usize {
        PAGE_HEADER_BYTES + (slot as usize) * INDEX_ENTRY_BYTES
    }

    fn read_index(&self, slot: u16) -> u16 {
        let off = self.index_array_offset(slot);
        u16::from_le_bytes(self.bytes[off..off + 2].try_into().unwrap())
    }

    fn write_index(&mut self, slot: u16, offset: u16) {
        let off = self.index_array_offset(slot);
        self.bytes[off..off + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Bytes of free space between the end of the index array and the
    /// start of the item heap.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        let index_end = PAGE_HEADER_BYTES + (header.entries as usize) * INDEX_ENTRY_BYTES;
        (header.hoffset as usize).saturating_sub(index_end)
    }

    pub fn entries(&self) -> u16 {
        self.header().entries
    }

    /// Read the item stored at the given slot.
    pub fn item(&self, slot: u16) -> &[u8] {
        let header = self.header();
        let start = self.read_index(slot) as usize;
        let end = if slot == 0 {
            self.page_size()
        } else {
            self.read_index(slot - 1) as usize
        };
        let _ = header;
        &self.bytes[start..end]
    }

    /// Insert a new item at `slot`, shifting every later index entry
    /// up by one. Returns false if there isn't room (caller triggers
    /// the split loop in that case).
    pub fn insert_item(&mut self, slot: u16, item: &[u8]) -> bool {
        let needed = item.len() + INDEX_ENTRY_BYTES;
        if needed > self.free_space() {
            return false;
        }

        let mut header = self.header();
        let new_hoffset = header.hoffset as usize - item.len();
        self.bytes[new_hoffset..new_hoffset + item.len()].copy_from_slice(item);

        // Shift index entries at and after `slot` up by one slot.
        for s in (slot..header.entries).rev() {
            let v = self.read_index(s);
            self.write_index(s + 1, v);
        }
        self.write_index(slot, new_hoffset as u16);

        header.entries += 1;
        header.hoffset = new_hoffset as u16;
        self.set_header(&header);
        true
    }

    /// Physically remove the item at `slot`. This does not reclaim
    /// the vacated heap bytes (they become part of `free_space` only
    /// after a compaction pass); callers needing dense packing should
    /// rebuild the page from its surviving items, which is what the
    /// split/reverse-split code below does for the pages it rewrites.
    pub fn remove_item(&mut self, slot: u16) {
        let mut header = self.header();
        for s in slot..header.entries - 1 {
            let v = self.read_index(s + 1);
            self.write_index(s, v);
        }
        header.entries -= 1;
        self.set_header(&header);
    }

    pub fn items(&self) -> Vec<Vec<u8>> {
        (0..self.entries()).map(|s| self.item(s).to_vec()).collect()
    }
}

pub use metadata::MetadataPage;
