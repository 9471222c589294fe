//! Item shapes carried inside leaf and internal B-tree pages: a
//! slotted-page entry/cell encoding generalized from fixed-width
//! integer tuples to arbitrary key/data byte strings per this engine's
//! generic ordered store.

use std::convert::TryInto;

use crate::page::PageNo;

/// Roughly ¼ page: payloads at or above this size are replaced on-page
/// by an [`OverflowRef`] and chained across overflow pages instead.
pub fn overflow_threshold(page_size: usize) -> usize {
    page_size / 4
}

/// On-page stand-in for a key or data item that does not fit: `{type,
/// tlen, first_pgno}`.
#[derive(Copy, Clone, Debug)]
pub struct OverflowRef {
    pub tlen: u32,
    pub first_pgno: PageNo,
}

const OVERFLOW_REF_TAG: u8 = 0xff;

impl OverflowRef {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(OVERFLOW_REF_TAG);
        buf.extend_from_slice(&self.tlen.to_le_bytes());
        buf.extend_from_slice(&self.first_pgno.to_le_bytes());
        buf
    }

    pub fn try_decode(buf: &[u8]) -> Option<Self> {
        if buf.first() != Some(&OVERFLOW_REF_TAG) || buf.len() < 9 {
            return None;
        }
        Some(Self {
            tlen: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            first_pgno: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
        })
    }
}

/// A single item on a leaf page: one logical `(key, data)` record.
///
/// The on-disk format this crate targets shares a duplicate set's key
/// physically across slots via the `inp[]` indirection described in
/// the design (`inp[i] == inp[i-P_INDX]`). This implementation instead
/// gives every slot its own key copy, trading the space savings of
/// that trick for a much simpler slotted-page implementation; every
/// observable invariant (duplicates sharing one logical key, ordering,
/// split behavior) still holds. See `DESIGN.md` for the tradeoff.
#[derive(Clone, Debug)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    /// Logical delete marker (§3 "Cursor" / §4.2 "del"): physical
    /// removal is deferred to cursor movement or close.
    pub deleted: bool,
}

impl LeafEntry {
    pub fn new(key: Vec<u8>, data: Vec<u8>) -> Self {
        Self { key, data, deleted: false }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.key.len() + self.data.len());
        buf.push(self.deleted as u8);
        buf.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let deleted = buf[0] == 1;
        let klen = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        let dlen = u16::from_le_bytes(buf[3..5].try_into().unwrap()) as usize;
        let key = buf[5..5 + klen].to_vec();
        let data = buf[5 + klen..5 + klen + dlen].to_vec();
        Self { key, data, deleted }
    }
}

/// Tag byte distinguishing an inline data payload from the two
/// off-page forms: an [`OverflowRef`] (data too large for the page) or
/// a `DUPLICATE` reference (the data slot is the head of an off-page
/// duplicate chain, see `crate::btree::dup`).
pub const DUPLICATE_REF_TAG: u8 = 0xfe;

pub fn encode_dup_ref(first_pgno: PageNo) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(DUPLICATE_REF_TAG);
    buf.extend_from_slice(&first_pgno.to_le_bytes());
    buf
}

pub fn try_decode_dup_ref(buf: &[u8]) -> Option<PageNo> {
    if buf.first() != Some(&DUPLICATE_REF_TAG) || buf.len() < 5 {
        return None;
    }
    Some(u32::from_le_bytes(buf[1..5].try_into().unwrap()))
}

/// A single entry on an internal page: `{child_pgno, nrecs?, key}`.
/// The leftmost entry's key is a placeholder and is never compared.
#[derive(Clone, Debug)]
pub struct InternalEntry {
    pub child_pgno: PageNo,
    pub nrecs: Option<u32>,
    pub key: Vec<u8>,
}

impl InternalEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.key.len());
        buf.extend_from_slice(&self.child_pgno.to_le_bytes());
        buf.push(self.nrecs.is_some() as u8);
        buf.extend_from_slice(&self.nrecs.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let child_pgno = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let has_nrecs = buf[4] == 1;
        let nrecs_val = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let klen = u16::from_le_bytes(buf[9..11].try_into().unwrap()) as usize;
        let key = buf[11..11 + klen].to_vec();
        Self {
            child_pgno,
            nrecs: if has_nrecs { Some(nrecs_val) } else { None },
            key,
        }
    }
}

/// Longest common prefix length, used to truncate a promoted
/// separator key down to the shortest prefix that still distinguishes
/// it from the last key of the left sibling.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Truncate `separator` to one byte past its common prefix with
/// `left_last_key`, never shrinking below one byte so the result
/// still compares correctly. Overflow keys and the leftmost separator
/// on a level are never truncated by callers of this function.
pub fn truncate_separator(separator: &[u8], left_last_key: &[u8]) -> Vec<u8> {
    let shared = common_prefix_len(separator, left_last_key);
    let keep = (shared + 1).min(separator.len());
    separator[..keep].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_entry_round_trip() {
        let e = LeafEntry::new(b"k032".to_vec(), vec![7u8; 12]);
        let decoded = LeafEntry::decode(&e.encode());
        assert_eq!(decoded.key, e.key);
        assert_eq!(decoded.data, e.data);
    }

    #[test]
    fn test_internal_entry_round_trip() {
        let e = InternalEntry {
            child_pgno: 42,
            nrecs: Some(17),
            key: b"k032".to_vec(),
        };
        let decoded = InternalEntry::decode(&e.encode());
        assert_eq!(decoded.child_pgno, 42);
        assert_eq!(decoded.nrecs, Some(17));
        assert_eq!(decoded.key, e.key);
    }

    #[test]
    fn test_truncate_separator_keeps_one_distinguishing_byte() {
        let truncated = truncate_separator(b"k0321", b"k0319");
        assert_eq!(truncated, b"k0321".to_vec());
    }
}
