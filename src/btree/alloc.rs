//! Page allocation and freeing for a single B-tree file, per §4.1
//! "Allocation/freelist": the creator side checks the metadata page's
//! freelist head under a write lock, popping it if non-empty or
//! extending the file (`get(NEW)`) otherwise; freeing prepends to the
//! same head and marks the freed page's type `INVALID`.

use crate::{
    buffer_pool::{BufferPool, GetFlags, GetPgno, PagePin, PutFlags},
    error::SmallError,
    fileid::FileId,
    page::{metadata::MetadataPage, Page, PageHeader, PageNo, PageType, PAGE_HEADER_BYTES},
    types::SmallResult,
};

fn read_metadata(bp: &BufferPool, fileid: FileId) -> Result<(PagePin, MetadataPage), SmallError> {
    let pin = bp.get(fileid, GetPgno::Exact(0), GetFlags::default())?;
    let meta = pin.with_page(MetadataPage::from_page);
    Ok((pin, meta))
}

fn write_metadata(bp: &BufferPool, pin: &PagePin, meta: &MetadataPage) -> SmallResult {
    pin.with_page_mut(|page| *page = meta.to_page());
    bp.put(pin, PutFlags { dirty: true, ..Default::default() })
}

/// Pop the freelist head if non-empty, otherwise extend the file by
/// one page. Returns a freshly pinned, zeroed page of `page_type`.
pub fn alloc_page(
    bp: &BufferPool,
    fileid: FileId,
    page_type: PageType,
    page_size: usize,
) -> Result<PagePin, SmallError> {
    let (meta_pin, mut meta) = read_metadata(bp, fileid)?;

    if meta.freelist_head != 0 {
        let head = meta.freelist_head;
        let head_pin = bp.get(fileid, GetPgno::Exact(head), GetFlags::default())?;
        let next = head_pin.with_page(|p| p.header().next_pgno);
        meta.freelist_head = next;
        write_metadata(bp, &meta_pin, &meta)?;

        head_pin.with_page_mut(|p| {
            *p = Page::new_empty(head, page_type, page_size);
        });
        bp.put(&head_pin, PutFlags { dirty: true, ..Default::default() })?;
        return Ok(head_pin);
    }

    let pin = bp.get(fileid, GetPgno::New, GetFlags { create: true, ..Default::default() })?;
    let pgno = pin.key.pgno;
    pin.with_page_mut(|p| *p = Page::new_empty(pgno, page_type, page_size));
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() })?;
    Ok(pin)
}

/// Prepend `pgno` to the freelist head and mark its type `INVALID`.
pub fn free_page(bp: &BufferPool, fileid: FileId, pgno: PageNo) -> SmallResult {
    let (meta_pin, mut meta) = read_metadata(bp, fileid)?;
    let old_head = meta.freelist_head;

    let pin = bp.get(fileid, GetPgno::Exact(pgno), GetFlags::default())?;
    pin.with_page_mut(|p| {
        let mut header = PageHeader::new(pgno, PageType::Invalid, p.page_size());
        header.next_pgno = old_head;
        p.bytes[0..PAGE_HEADER_BYTES].copy_from_slice(&header.encode());
    });
    bp.put(&pin, PutFlags { dirty: true, ..Default::default() })?;

    meta.freelist_head = pgno;
    write_metadata(bp, &meta_pin, &meta)
}
