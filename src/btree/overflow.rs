//! Overflow pages: a key or data item at or above `overflow_threshold`
//! (§4.2 "Page shapes") is replaced on-page by an [`OverflowRef`] and
//! its payload chained across dedicated `Overflow`-typed pages, linked
//! through the ordinary page-header `next_pgno` field.

use crate::{
    btree::alloc::{alloc_page, free_page},
    buffer_pool::{BufferPool, GetFlags, GetPgno, PutFlags},
    error::SmallError,
    fileid::FileId,
    page::{btree::OverflowRef, PageNo, PageType, PAGE_HEADER_BYTES},
    types::SmallResult,
};

pub fn write_chain(
    bp: &BufferPool,
    fileid: FileId,
    page_size: usize,
    payload: &[u8],
) -> Result<OverflowRef, SmallError> {
    let chunk_size = page_size - PAGE_HEADER_BYTES;
    let num_chunks = if payload.is_empty() { 1 } else { (payload.len() + chunk_size - 1) / chunk_size };

    let mut pins = Vec::with_capacity(num_chunks);
    for _ in 0..num_chunks {
        pins.push(alloc_page(bp, fileid, PageType::Overflow, page_size)?);
    }

    for i in 0..pins.len() {
        let start = i * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let chunk = &payload[start..end];
        let next = if i + 1 < pins.len() { pins[i + 1].key.pgno } else { 0 };

        pins[i].with_page_mut(|p| {
            let mut header = p.header();
            header.next_pgno = next;
            p.set_header(&header);
            p.bytes[PAGE_HEADER_BYTES..PAGE_HEADER_BYTES + chunk.len()].copy_from_slice(chunk);
        });
        bp.put(&pins[i], PutFlags { dirty: true, ..Default::default() })?;
    }

    Ok(OverflowRef { tlen: payload.len() as u32, first_pgno: pins[0].key.pgno })
}

pub fn read_chain(bp: &BufferPool, fileid: FileId, overflow: &OverflowRef) -> Result<Vec<u8>, SmallError> {
    let mut out = Vec::with_capacity(overflow.tlen as usize);
    let mut pgno = overflow.first_pgno;
    while pgno != 0 && out.len() < overflow.tlen as usize {
        let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        let (next, body) = pin.with_page(|p| (p.header().next_pgno, p.bytes[PAGE_HEADER_BYTES..].to_vec()));
        let remaining = overflow.tlen as usize - out.len();
        out.extend_from_slice(&body[..remaining.min(body.len())]);
        pgno = next;
    }
    Ok(out)
}

pub fn free_chain(bp: &BufferPool, fileid: FileId, first_pgno: PageNo) -> SmallResult {
    let mut pgno = first_pgno;
    while pgno != 0 {
        let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
        let next = pin.with_page(|p| p.header().next_pgno);
        free_page(bp, fileid, pgno)?;
        pgno = next;
    }
    Ok(())
}
