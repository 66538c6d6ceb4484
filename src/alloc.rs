//! Component D — the page allocator.
//!
//! Grounded on `examples/original_source/lib/pg.c`'s `ed_alloc`/`ed_free`
//! (the integrated allocator; the spec explicitly excludes the standalone
//! `pgalloc.c` allocator from scope) and on the header layout in
//! `eddy-private.h` (`tail = {start, count}`, free list of `FRHD`/`FRCH`
//! pages).
//!
//! The tail fast path is lock-free: `Tail` is a packed `{start: u32, count:
//! u32}` behind an `AtomicU64`, compare-and-swapped the way the reference
//! decrements `count` under a CAS loop rather than the write lock.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::error::{EddyError, Result};
use crate::page;

/// Page batch size the allocator grows the file by when both the tail and
/// free list are exhausted.
pub const ALLOC_COUNT: u32 = 16;

/// Page numbers a single free-list page can hold, sized to fill a page
/// after its header, `next` chain pointer, and `count` field.
pub fn pages_per_free_page(page_size: usize) -> usize {
    let overhead = std::mem::size_of::<page::PageHeader>() + std::mem::size_of::<u32>() * 2;
    (page_size - overhead) / std::mem::size_of::<u32>()
}

/// `{start, count}` unformatted page run, read/written via a single atomic
/// word so the tail fast path needs no lock.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Tail {
    pub start: u32,
    pub count: u32,
}

impl Tail {
    fn pack(self) -> u64 {
        (self.start as u64) | ((self.count as u64) << 32)
    }

    fn unpack(bits: u64) -> Self {
        Tail {
            start: bits as u32,
            count: (bits >> 32) as u32,
        }
    }
}

/// Atomic view over the header's `tail` field. Lives directly on the
/// mapped header page, so CAS operations here are visible to every process
/// with the header mapped.
#[repr(transparent)]
pub struct AtomicTail(AtomicU64);

impl AtomicTail {
    pub fn load(&self) -> Tail {
        Tail::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, tail: Tail) {
        self.0.store(tail.pack(), Ordering::Release);
    }

    /// Try to hand out `n` pages from the tail's fast path. Returns the
    /// first page number of the run on success, clamping `n` down to
    /// whatever is actually left if the tail has fewer than requested.
    ///
    /// Returns `Ok(None)` (not an error) when the tail is empty, so callers
    /// fall through to the free-list slow path.
    pub fn try_take(&self, n: u32) -> Option<(u32, u32)> {
        loop {
            let bits = self.0.load(Ordering::Acquire);
            let cur = Tail::unpack(bits);
            if cur.count == 0 {
                return None;
            }
            let take = n.min(cur.count);
            let next = Tail {
                start: cur.start + take,
                count: cur.count - take,
            };
            if self
                .0
                .compare_exchange_weak(bits, next.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::trace!("tail fast path: took {take} pages at {}", cur.start);
                return Some((cur.start, take));
            }
        }
    }
}

/// A free-list page: `FREE_HEAD` for the chain's head, `FREE_CHILD` for
/// every other page in it. Holds up to [`pages_per_free_page`] page numbers,
/// plus the page number of the next free-list page in the chain (`NONE` at
/// the tail of the chain).
pub struct FreeListPage<'a> {
    header: &'a mut page::PageHeader,
    next: &'a mut u32,
    count: &'a mut u32,
    slots: &'a mut [u32],
}

impl<'a> FreeListPage<'a> {
    /// View raw page bytes as a free-list page. `bytes` must be exactly one
    /// page.
    ///
    /// # Safety
    /// Caller must hold the allocator's write lock; no other view of these
    /// bytes may be live.
    pub unsafe fn from_bytes(bytes: &'a mut [u8], page_size: usize) -> Self {
        let cap = pages_per_free_page(page_size);
        let (head, rest) = bytes.split_at_mut(std::mem::size_of::<page::PageHeader>());
        let header = bytemuck::from_bytes_mut(head);
        let (next_bytes, rest) = rest.split_at_mut(4);
        let next = bytemuck::from_bytes_mut(next_bytes);
        let (count_bytes, rest) = rest.split_at_mut(4);
        let count: &mut u32 = bytemuck::from_bytes_mut(count_bytes);
        let slots: &mut [u32] = bytemuck::cast_slice_mut(&mut rest[..cap * 4]);
        FreeListPage {
            header,
            next,
            count,
            slots,
        }
    }

    pub fn init(&mut self, page_no: u32, page_type: u32, next: u32) {
        self.header.page_number = page_no;
        self.header.page_type = page_type;
        *self.next = next;
        *self.count = 0;
    }

    pub fn page_type(&self) -> u32 {
        self.header.page_type
    }

    pub fn next(&self) -> u32 {
        *self.next
    }

    pub fn set_next(&mut self, next: u32) {
        *self.next = next;
    }

    pub fn len(&self) -> usize {
        *self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        *self.count == 0
    }

    pub fn is_full(&self) -> bool {
        *self.count as usize == self.slots.len()
    }

    pub fn push(&mut self, page_no: u32) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[*self.count as usize] = page_no;
        *self.count += 1;
        true
    }

    /// Pop up to `max` pages from the tail of this page's array, returning
    /// them as a descending run where possible so multi-page allocations
    /// get run-contiguous slices (§4.D slow path).
    pub fn pop_many(&mut self, max: u32) -> Vec<u32> {
        let take = (*self.count as usize).min(max as usize);
        let start = *self.count as usize - take;
        let out: Vec<u32> = self.slots[start..*self.count as usize].to_vec();
        *self.count -= take as u32;
        out
    }
}

/// The allocator's view of free-list + tail state needed to serve requests.
/// Embedding code (the index/transaction layer) supplies page mapping and
/// header access; this type only encodes the policy.
pub struct Allocator {
    page_size: usize,
}

impl Allocator {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Tail fast path: attempt to serve `n` pages without the write lock.
    /// Returns `None` if the tail is currently empty.
    pub fn alloc_from_tail(&self, tail: &AtomicTail, n: u32) -> Option<(u32, u32)> {
        tail.try_take(n)
    }

    /// Compute the new tail after growing the backing file by one
    /// `ALLOC_COUNT` batch starting at `file_pages` (the file's current page
    /// count).
    pub fn grow_batch(&self, file_pages: u32) -> Result<Tail> {
        let start = file_pages;
        let count = ALLOC_COUNT;
        if start.checked_add(count).is_none() {
            return Err(EddyError::OutOfPages);
        }
        log::debug!("growing file by {count} pages starting at {start}");
        Ok(Tail { start, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_cas_hands_out_and_clamps() {
        let tail = AtomicTail(AtomicU64::new(Tail { start: 10, count: 3 }.pack()));
        let (start, n) = tail.try_take(5).unwrap();
        assert_eq!((start, n), (10, 3));
        assert!(tail.try_take(1).is_none());
    }

    #[test]
    fn tail_cas_partial_take_leaves_remainder() {
        let tail = AtomicTail(AtomicU64::new(Tail { start: 0, count: 10 }.pack()));
        let (start, n) = tail.try_take(4).unwrap();
        assert_eq!((start, n), (0, 4));
        let rest = tail.load();
        assert_eq!(rest, Tail { start: 4, count: 6 });
    }

    impl PartialEq for Tail {
        fn eq(&self, other: &Self) -> bool {
            self.start == other.start && self.count == other.count
        }
    }
    impl Eq for Tail {}

    #[test]
    fn free_list_page_push_pop_roundtrip() {
        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        let mut fl = unsafe { FreeListPage::from_bytes(&mut buf, page_size) };
        fl.init(5, page::FREE_HEAD, page::NONE);
        for p in 0..10u32 {
            assert!(fl.push(p));
        }
        assert_eq!(fl.len(), 10);
        let popped = fl.pop_many(4);
        assert_eq!(popped, vec![6, 7, 8, 9]);
        assert_eq!(fl.len(), 6);
    }

    #[test]
    fn grow_batch_uses_alloc_count() {
        let a = Allocator::new(4096);
        let tail = a.grow_batch(100).unwrap();
        assert_eq!(tail, Tail { start: 100, count: ALLOC_COUNT });
    }
}
