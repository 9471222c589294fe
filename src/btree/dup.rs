//! Off-page duplicates (OPD): the subtree a duplicate set migrates to
//! once it no longer fits in the master leaf's on-page budget (§4.2
//! "Duplicate"). Modeled as a chain of dedicated `LeafDuplicate` pages
//! rather than a full recursive B-tree — each page holds a sorted run
//! of data items and the chain as a whole is globally sorted, so
//! `count`/iteration only ever walk it once, forward. A real nested
//! subtree would also support descending search, which no caller here
//! needs since a master leaf only ever holds a `DupRef` to the first
//! page — see `DESIGN.md` for why this trade was made.

use std::cmp::Ordering;

use crate::{
    btree::comparator::Comparator,
    buffer_pool::{BufferPool, GetFlags, GetPgno, PutFlags},
    error::SmallError,
    fileid::FileId,
    page::{Page, PageNo, PageType},
    types::SmallResult,
};

use super::alloc::{alloc_page, free_page};

fn load_items(bp: &BufferPool, fileid: FileId, pgno: PageNo) -> Result<(Page, Vec<Vec<u8>>), SmallError> {
    let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
    let page = pin.with_page(|p| p.clone());
    let items = page.items();
    Ok((page, items))
}

fn store_items(bp: &BufferPool, fileid: FileId, pgno: PageNo, next_pgno: PageNo, items: &[Vec<u8>]) -> SmallResult {
    let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
    let page_size = pin.with_page(|p| p.page_size());
    let mut fresh = Page::new_empty(pgno, PageType::LeafDuplicate, page_size);
    for item in items {
        if !fresh.insert_item(fresh.entries(), item) {
            return Err(SmallError::new("duplicate page overflow: item too large to fit alone"));
        }
    }
    let mut header = fresh.header();
    header.next_pgno = next_pgno;
    fresh.set_header(&header);
    pin.with_page_mut(|p| *p = fresh);
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() })
}

/// Insert `data` into the duplicate chain headed by `first_pgno`,
/// creating the chain if it is `None`. Returns the (possibly new)
/// head pgno. Splits the tail page in half when it no longer fits.
pub fn insert(
    bp: &BufferPool,
    fileid: FileId,
    page_size: usize,
    first_pgno: Option<PageNo>,
    data: &[u8],
    comparator: &Comparator,
) -> Result<PageNo, SmallError> {
    let head = match first_pgno {
        Some(pgno) => pgno,
        None => {
            let pin = alloc_page(bp, fileid, PageType::LeafDuplicate, page_size)?;
            pin.key.pgno
        }
    };

    let mut pgno = head;
    loop {
        let (page, mut items) = load_items(bp, fileid, pgno)?;
        let header = page.header();

        let insert_at = items
            .iter()
            .position(|i| comparator(data, i) != Ordering::Greater)
            .unwrap_or(items.len());

        // Only the right place in the chain accepts the insert: if
        // there is a next page and the item belongs after everything
        // here, move on rather than appending out of order.
        if insert_at == items.len() && header.next_pgno != 0 {
            pgno = header.next_pgno;
            continue;
        }

        items.insert(insert_at, data.to_vec());
        let needed: usize = items.iter().map(|i| i.len() + 2).sum();
        if needed + 26 <= page_size {
            store_items(bp, fileid, pgno, header.next_pgno, &items)?;
            return Ok(head);
        }

        // Split the overflowing page: left half stays, right half
        // moves to a fresh page spliced into the chain.
        let mid = items.len() / 2;
        let (left, right) = items.split_at(mid);
        let new_pin = alloc_page(bp, fileid, PageType::LeafDuplicate, page_size)?;
        let new_pgno = new_pin.key.pgno;
        store_items(bp, fileid, new_pgno, header.next_pgno, right)?;
        store_items(bp, fileid, pgno, new_pgno, left)?;
        return Ok(head);
    }
}

/// Number of items in the duplicate chain.
pub fn count(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> Result<usize, SmallError> {
    let mut total = 0;
    let mut pgno = first_pgno;
    while pgno != 0 {
        let (page, items) = load_items(bp, fileid, pgno)?;
        total += items.len();
        pgno = page.header().next_pgno;
    }
    Ok(total)
}

/// All items in the duplicate chain, in comparator order.
pub fn iter_all(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> Result<Vec<Vec<u8>>, SmallError> {
    let mut all = Vec::new();
    let mut pgno = first_pgno;
    while pgno != 0 {
        let (page, items) = load_items(bp, fileid, pgno)?;
        all.extend(items);
        pgno = page.header().next_pgno;
    }
    Ok(all)
}

/// Free every page in the chain: OPD trees are removed wholesale when
/// empty rather than reverse-split like ordinary leaves (§4.2).
pub fn free_chain(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> SmallResult {
    let mut pgno = first_pgno;
    while pgno != 0 {
        let (page, _) = load_items(bp, fileid, pgno)?;
        let next = page.header().next_pgno;
        free_page(bp, fileid, pgno)?;
        pgno = next;
    }
    Ok(())
}

/// Remove the first item equal to `data`. Returns `true` if removed
/// and `false` if the chain is left empty (caller should then drop the
/// master leaf's `DupRef` and free the chain with [`free_chain`]).
pub fn remove(
    bp: &BufferPool,
    fileid: FileId,
    first_pgno: PageNo,
    data: &[u8],
) -> Result<bool, SmallError> {
    let mut pgno = first_pgno;
    while pgno != 0 {
        let (page, mut items) = load_items(bp, fileid, pgno)?;
        let header = page.header();
        if let Some(idx) = items.iter().position(|i| i == data) {
            items.remove(idx);
            store_items(bp, fileid, pgno, header.next_pgno, &items)?;
            return Ok(true);
        }
        pgno = header.next_pgno;
    }
    Ok(false)
}

pub fn is_empty(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> Result<bool, SmallError> {
    Ok(count(bp, fileid, first_pgno)? == 0)
}

/// Number of pages in the duplicate chain (§11 supplement).
pub fn page_count(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> Result<u32, SmallError> {
    let mut n = 0u32;
    let mut pgno = first_pgno;
    while pgno != 0 {
        n += 1;
        let (page, _) = load_items(bp, fileid, pgno)?;
        pgno = page.header().next_pgno;
    }
    Ok(n)
}
