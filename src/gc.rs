//! Component E — the garbage collector.
//!
//! Grounded on `examples/original_source/lib/eddy-private.h`'s `EdPgGc` /
//! `EdPgGcList` and `lib/idx.c`'s GC enqueue/release: a page holding an
//! ordered bag of variable-length lists `{xid, npages, pages[npages]}`
//! packed back-to-back, with `head`/`tail` byte offsets into the data
//! region and `nskip` letting a partially-drained head list advance
//! without being rewritten.

use crate::error::{EddyError, Result};
use crate::page;

/// On-disk list header preceding `npages` page numbers.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ListHeader {
    pub xid: u64,
    pub npages: u32,
    pub _pad: u32,
}

/// A GC page's mutable view: header, `next` chain pointer, `head`/`tail`
/// byte offsets into the data region, `nskip` pages already released from
/// the list at `head`, and the raw data bytes holding packed lists.
pub struct GcPage<'a> {
    header: &'a mut page::PageHeader,
    next: &'a mut u32,
    head: &'a mut u32,
    tail: &'a mut u32,
    nskip: &'a mut u32,
    data: &'a mut [u8],
}

impl<'a> GcPage<'a> {
    /// # Safety
    /// Caller must hold the allocator/GC write lock; `bytes` must be
    /// exactly one page and not aliased elsewhere.
    pub unsafe fn from_bytes(bytes: &'a mut [u8]) -> Self {
        let (head_bytes, rest) = bytes.split_at_mut(std::mem::size_of::<page::PageHeader>());
        let header = bytemuck::from_bytes_mut(head_bytes);
        let (next_bytes, rest) = rest.split_at_mut(4);
        let next = bytemuck::from_bytes_mut(next_bytes);
        let (head_off, rest) = rest.split_at_mut(4);
        let head = bytemuck::from_bytes_mut(head_off);
        let (tail_off, rest) = rest.split_at_mut(4);
        let tail = bytemuck::from_bytes_mut(tail_off);
        let (nskip_bytes, data) = rest.split_at_mut(4);
        let nskip = bytemuck::from_bytes_mut(nskip_bytes);
        GcPage {
            header,
            next,
            head,
            tail,
            nskip,
            data,
        }
    }

    pub fn init(&mut self, page_no: u32, next: u32) {
        self.header.page_number = page_no;
        self.header.page_type = page::GC;
        *self.next = next;
        *self.head = 0;
        *self.tail = 0;
        *self.nskip = 0;
    }

    pub fn next(&self) -> u32 {
        *self.next
    }

    pub fn set_next(&mut self, next: u32) {
        *self.next = next;
    }

    pub fn is_empty(&self) -> bool {
        *self.head == *self.tail
    }

    /// Count the lists currently packed into this page, without releasing
    /// any of them. Used for stat snapshots.
    pub fn list_count(&self) -> usize {
        let mut off = *self.head;
        let mut n = 0;
        while off < *self.tail {
            let h = self.list_header_at(off);
            off += Self::list_byte_len(h.npages);
            n += 1;
        }
        n
    }

    fn list_header_at(&self, off: u32) -> ListHeader {
        let start = off as usize;
        let end = start + std::mem::size_of::<ListHeader>();
        *bytemuck::from_bytes(&self.data[start..end])
    }

    fn list_pages_at(&self, off: u32, npages: u32) -> &[u32] {
        let start = off as usize + std::mem::size_of::<ListHeader>();
        let end = start + npages as usize * 4;
        bytemuck::cast_slice(&self.data[start..end])
    }

    fn list_byte_len(npages: u32) -> u32 {
        std::mem::size_of::<ListHeader>() as u32 + npages * 4
    }

    /// Room remaining (in bytes) past the current tail list.
    pub fn remaining(&self) -> usize {
        self.data.len() - *self.tail as usize
    }

    /// Whether the tail list, if any, carries `xid` and can be extended in
    /// place by appending `pages` after it (requires the pages to be the
    /// very last bytes written, since lists are immutable once followed by
    /// another list).
    pub fn tail_xid(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        // Walk from head to find the start offset of the tail list; the
        // list layout has no back-pointers, so we scan forward once.
        // nskip only trims already-released pages off the head list's
        // count, it never moves its start offset.
        let mut off = *self.head;
        let mut last_off = off;
        loop {
            let h = self.list_header_at(off);
            let len = Self::list_byte_len(h.npages);
            if off + len >= *self.tail {
                last_off = off;
                break;
            }
            off += len;
        }
        Some(self.list_header_at(last_off).xid)
    }

    /// Append `pages` as a new list with `xid`, or extend the tail list in
    /// place if it already carries the same `xid` and this page has
    /// physical room. Returns `Err(OutOfPages)` if this page has no room at
    /// all (caller must allocate a fresh GC page and link it).
    pub fn enqueue(&mut self, xid: u64, pages: &[u32]) -> Result<()> {
        if let Some(tail_xid) = self.tail_xid() {
            if tail_xid == xid {
                // Extend in place: bump npages on the tail list's header and
                // append the new page numbers right after its current ones.
                let mut off = *self.head;
                loop {
                    let h = self.list_header_at(off);
                    let len = Self::list_byte_len(h.npages);
                    if off + len >= *self.tail {
                        let needed = pages.len() as u32 * 4;
                        if self.remaining() < needed as usize {
                            return Err(EddyError::OutOfPages);
                        }
                        let new_npages = h.npages + pages.len() as u32;
                        let hdr_bytes = ListHeader {
                            xid,
                            npages: new_npages,
                            _pad: 0,
                        };
                        let hstart = off as usize;
                        self.data[hstart..hstart + std::mem::size_of::<ListHeader>()]
                            .copy_from_slice(bytemuck::bytes_of(&hdr_bytes));
                        let pstart = *self.tail as usize;
                        let pbytes: &[u8] = bytemuck::cast_slice(pages);
                        self.data[pstart..pstart + pbytes.len()].copy_from_slice(pbytes);
                        *self.tail += needed;
                        return Ok(());
                    }
                    off += len;
                }
            }
        }
        let needed = Self::list_byte_len(pages.len() as u32) as usize;
        if self.remaining() < needed {
            return Err(EddyError::OutOfPages);
        }
        let hdr = ListHeader {
            xid,
            npages: pages.len() as u32,
            _pad: 0,
        };
        let start = *self.tail as usize;
        self.data[start..start + std::mem::size_of::<ListHeader>()]
            .copy_from_slice(bytemuck::bytes_of(&hdr));
        let pstart = start + std::mem::size_of::<ListHeader>();
        let pbytes: &[u8] = bytemuck::cast_slice(pages);
        self.data[pstart..pstart + pbytes.len()].copy_from_slice(pbytes);
        *self.tail += needed as u32;
        Ok(())
    }

    /// Pop the head list if its xid is `< xmin`, returning its pages (minus
    /// any already skipped via `nskip`). Advances `head`/`nskip`. Returns
    /// `None` if the head list's xid is not yet reclaimable or the page is
    /// empty.
    pub fn try_release_head(&mut self, xmin: u64) -> Option<Vec<u32>> {
        if self.is_empty() {
            return None;
        }
        let h = self.list_header_at(*self.head);
        if h.xid >= xmin {
            return None;
        }
        let all_pages = self.list_pages_at(*self.head, h.npages);
        let pages = all_pages[*self.nskip as usize..].to_vec();
        *self.head += Self::list_byte_len(h.npages);
        *self.nskip = 0;
        Some(pages)
    }
}

/// Release lists whose xid is `< xmin`, up to `limit` lists, returning the
/// freed page numbers. `advance_page` is called when the current GC page is
/// fully drained, yielding the next page number in the chain (or `NONE`);
/// the caller is responsible for freeing a page once it has been fully
/// consumed and for reinitializing `page` to view the next one.
pub fn run<'a>(
    mut page: GcPage<'a>,
    xmin: u64,
    limit: usize,
) -> (Vec<u32>, usize, bool) {
    let mut freed = Vec::new();
    let mut n = 0;
    while n < limit {
        match page.try_release_head(xmin) {
            Some(mut pages) => {
                freed.append(&mut pages);
                n += 1;
            }
            None => break,
        }
    }
    let page_drained = page.is_empty();
    (freed, n, page_drained)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_page(buf: &mut [u8]) -> GcPage<'_> {
        let mut p = unsafe { GcPage::from_bytes(buf) };
        p.init(0, page::NONE);
        p
    }

    #[test]
    fn enqueue_same_xid_extends_in_place() {
        let mut buf = vec![0u8; 512];
        let mut p = new_page(&mut buf);
        p.enqueue(5, &[1, 2]).unwrap();
        p.enqueue(5, &[3]).unwrap();
        let h = p.list_header_at(*p.head);
        assert_eq!(h.xid, 5);
        assert_eq!(h.npages, 3);
    }

    #[test]
    fn enqueue_new_xid_appends_new_list() {
        let mut buf = vec![0u8; 512];
        let mut p = new_page(&mut buf);
        p.enqueue(5, &[1, 2]).unwrap();
        p.enqueue(6, &[3]).unwrap();
        let released = p.try_release_head(6);
        assert_eq!(released, Some(vec![1, 2]));
        let released2 = p.try_release_head(7);
        assert_eq!(released2, Some(vec![3]));
        assert!(p.is_empty());
    }

    #[test]
    fn release_respects_xmin() {
        let mut buf = vec![0u8; 512];
        let mut p = new_page(&mut buf);
        p.enqueue(10, &[1]).unwrap();
        assert_eq!(p.try_release_head(10), None);
        assert_eq!(p.try_release_head(11), Some(vec![1]));
    }
}
