//! On-page layout for BRANCH, LEAF, and OVERFLOW nodes.
//!
//! Grounded on `examples/original_source/lib/eddy-private.h`'s `EdBpt`
//! (`{xid, next, nkeys}` node header, branch data laid out as
//! `P[0] K[0] P[1] K[1] … K[n-1] P[n]`) and on the unaligned-64-bit-read
//! design note: branch keys are fetched byte-wise rather than through a
//! `&u64` reference, since their offsets are not 8-byte aligned.
//!
//! Views are generic over `AsRef<[u8]>` / `AsMut<[u8]>` rather than over a
//! lifetime-bound `&mut [u8]`, so the same type serves read-only access
//! (borrowing `&[u8]`) and read-write access (borrowing `&mut [u8]`)
//! without an unsound cast between them.

use bytemuck::{Pod, Zeroable};

use crate::page::{self, PageHeader};

/// Node header following every BRANCH/LEAF/OVERFLOW page's `PageHeader`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct NodeHeader {
    pub xid: u64,
    pub next: u32,
    pub nkeys: u32,
}

pub const NODE_HEADER_OFFSET: usize = std::mem::size_of::<PageHeader>();
pub const DATA_OFFSET: usize = NODE_HEADER_OFFSET + std::mem::size_of::<NodeHeader>();

/// Number of `(P, K)` pairs that fit in one branch page's data region,
/// i.e. the branch order minus one.
pub fn branch_capacity(page_size: usize) -> usize {
    (page_size - DATA_OFFSET - 4) / BRANCH_STRIDE
}

/// Number of fixed-size entries that fit in one leaf/overflow page.
pub fn leaf_capacity(page_size: usize, entry_size: usize) -> usize {
    (page_size - DATA_OFFSET) / entry_size
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(bytes[off..off + 4].try_into().unwrap())
}
fn write_u32(bytes: &mut [u8], off: usize, v: u32) {
    bytes[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}
fn read_u64(bytes: &[u8], off: usize) -> u64 {
    // Deliberately byte-wise: branch key offsets are not 8-byte aligned.
    u64::from_ne_bytes(bytes[off..off + 8].try_into().unwrap())
}
fn write_u64(bytes: &mut [u8], off: usize, v: u64) {
    bytes[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

/// Read-only view common to every node kind.
pub struct NodeView<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> NodeView<B> {
    pub fn new(bytes: B) -> Self {
        NodeView { bytes }
    }

    pub fn header(&self) -> PageHeader {
        *bytemuck::from_bytes(&self.bytes.as_ref()[..NODE_HEADER_OFFSET])
    }

    pub fn node_header(&self) -> NodeHeader {
        *bytemuck::from_bytes(&self.bytes.as_ref()[NODE_HEADER_OFFSET..DATA_OFFSET])
    }

    pub fn page_type(&self) -> u32 {
        self.header().page_type
    }

    pub fn nkeys(&self) -> u32 {
        self.node_header().nkeys
    }

    pub fn next(&self) -> u32 {
        self.node_header().next
    }

    pub fn xid(&self) -> u64 {
        self.node_header().xid
    }
}

/// Byte stride of one branch `(P, K)` pair.
const BRANCH_STRIDE: usize = 4 + 8;

/// Branch page view: `P[0] K[0] P[1] K[1] … K[n-1] P[n]`.
pub struct BranchView<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> BranchView<B> {
    pub fn new(bytes: B) -> Self {
        BranchView { bytes }
    }

    pub fn nkeys(&self) -> u32 {
        read_u32(self.bytes.as_ref(), NODE_HEADER_OFFSET + 12)
    }

    pub fn ptr(&self, i: usize) -> u32 {
        read_u32(self.bytes.as_ref(), DATA_OFFSET + i * BRANCH_STRIDE)
    }

    pub fn key(&self, i: usize) -> u64 {
        read_u64(self.bytes.as_ref(), DATA_OFFSET + i * BRANCH_STRIDE + 4)
    }

    /// Find the child index to descend into for `search_key`: the last `i`
    /// such that `key(i) <= search_key`, or 0. Linear scan, per spec's
    /// "either admissible" note.
    pub fn child_for(&self, search_key: u64) -> usize {
        let n = self.nkeys() as usize;
        let mut idx = 0;
        for i in 0..n {
            if self.key(i) <= search_key {
                idx = i + 1;
            } else {
                break;
            }
        }
        idx
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BranchView<B> {
    pub fn init(&mut self, page_no: u32, xid: u64) {
        let hdr = PageHeader {
            page_number: page_no,
            page_type: page::BRANCH,
        };
        self.bytes.as_mut()[..NODE_HEADER_OFFSET].copy_from_slice(bytemuck::bytes_of(&hdr));
        let nh = NodeHeader {
            xid,
            next: page::NONE,
            nkeys: 0,
        };
        self.bytes.as_mut()[NODE_HEADER_OFFSET..DATA_OFFSET]
            .copy_from_slice(bytemuck::bytes_of(&nh));
    }

    pub(crate) fn set_nkeys(&mut self, n: u32) {
        write_u32(self.bytes.as_mut(), NODE_HEADER_OFFSET + 12, n);
    }

    pub fn set_ptr(&mut self, i: usize, p: u32) {
        write_u32(self.bytes.as_mut(), DATA_OFFSET + i * BRANCH_STRIDE, p);
    }

    pub fn set_key(&mut self, i: usize, k: u64) {
        write_u64(self.bytes.as_mut(), DATA_OFFSET + i * BRANCH_STRIDE + 4, k);
    }

    /// Insert a new `(separator, right_child)` pair after child index
    /// `at`, shifting subsequent pairs right. Caller ensures capacity.
    pub fn insert_separator(&mut self, at: usize, separator: u64, right_child: u32) {
        let n = self.nkeys() as usize;
        let mut i = n;
        while i > at {
            let k = self.key(i - 1);
            let p = self.ptr(i);
            self.set_key(i, k);
            self.set_ptr(i + 1, p);
            i -= 1;
        }
        self.set_key(at, separator);
        self.set_ptr(at + 1, right_child);
        self.set_nkeys(n as u32 + 1);
    }

    pub fn set_root(&mut self, left: u32, separator: u64, right: u32) {
        self.set_ptr(0, left);
        self.set_key(0, separator);
        self.set_ptr(1, right);
        self.set_nkeys(1);
    }
}

/// Leaf/overflow page view over fixed-size entries whose first 8 bytes are
/// the key.
pub struct LeafView<B> {
    bytes: B,
    entry_size: usize,
}

impl<B: AsRef<[u8]>> LeafView<B> {
    pub fn new(bytes: B, entry_size: usize) -> Self {
        LeafView { bytes, entry_size }
    }

    pub fn nkeys(&self) -> u32 {
        read_u32(self.bytes.as_ref(), NODE_HEADER_OFFSET + 12)
    }

    pub fn next(&self) -> u32 {
        read_u32(self.bytes.as_ref(), NODE_HEADER_OFFSET + 8)
    }

    pub fn entry_key(&self, i: usize) -> u64 {
        read_u64(self.bytes.as_ref(), DATA_OFFSET + i * self.entry_size)
    }

    pub fn entry(&self, i: usize) -> &[u8] {
        let off = DATA_OFFSET + i * self.entry_size;
        &self.bytes.as_ref()[off..off + self.entry_size]
    }

    /// Binary search for the first entry with `key >= search_key`.
    pub fn lower_bound(&self, search_key: u64) -> usize {
        let n = self.nkeys() as usize;
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_key(mid) < search_key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Length of the run of entries equal to `entry_key(start)`, starting
    /// at `start`.
    pub fn run_len(&self, start: usize) -> usize {
        let n = self.nkeys() as usize;
        if start >= n {
            return 0;
        }
        let key = self.entry_key(start);
        let mut i = start;
        while i < n && self.entry_key(i) == key {
            i += 1;
        }
        i - start
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> LeafView<B> {
    pub fn init(&mut self, page_no: u32, xid: u64, page_type: u32) {
        let hdr = PageHeader {
            page_number: page_no,
            page_type,
        };
        self.bytes.as_mut()[..NODE_HEADER_OFFSET].copy_from_slice(bytemuck::bytes_of(&hdr));
        let nh = NodeHeader {
            xid,
            next: page::NONE,
            nkeys: 0,
        };
        self.bytes.as_mut()[NODE_HEADER_OFFSET..DATA_OFFSET]
            .copy_from_slice(bytemuck::bytes_of(&nh));
    }

    pub(crate) fn set_nkeys(&mut self, n: u32) {
        write_u32(self.bytes.as_mut(), NODE_HEADER_OFFSET + 12, n);
    }

    pub fn set_next(&mut self, next: u32) {
        write_u32(self.bytes.as_mut(), NODE_HEADER_OFFSET + 8, next);
    }

    pub fn entry_mut(&mut self, i: usize) -> &mut [u8] {
        let off = DATA_OFFSET + i * self.entry_size;
        &mut self.bytes.as_mut()[off..off + self.entry_size]
    }

    /// Insert `entry` (exactly `entry_size` bytes) at index `at`, shifting
    /// later entries right by one slot. Caller ensures capacity.
    pub fn insert_at(&mut self, at: usize, entry: &[u8]) {
        let n = self.nkeys() as usize;
        let sz = self.entry_size;
        let bytes = self.bytes.as_mut();
        for i in (at..n).rev() {
            let (src_off, dst_off) = (DATA_OFFSET + i * sz, DATA_OFFSET + (i + 1) * sz);
            bytes.copy_within(src_off..src_off + sz, dst_off);
        }
        let off = DATA_OFFSET + at * sz;
        bytes[off..off + sz].copy_from_slice(entry);
        self.set_nkeys(n as u32 + 1);
    }

    /// Remove the entry at index `at`, shifting later entries left.
    pub fn delete_at(&mut self, at: usize) {
        let n = self.nkeys() as usize;
        let sz = self.entry_size;
        let bytes = self.bytes.as_mut();
        for i in at..n - 1 {
            let (src_off, dst_off) = (DATA_OFFSET + (i + 1) * sz, DATA_OFFSET + i * sz);
            bytes.copy_within(src_off..src_off + sz, dst_off);
        }
        self.set_nkeys(n as u32 - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_insert_and_lower_bound() {
        let mut buf = vec![0u8; 256];
        let mut leaf = LeafView::new(&mut buf[..], 16);
        leaf.init(1, 5, page::LEAF);
        leaf.insert_at(0, &[10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        leaf.insert_at(1, &[20, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        leaf.insert_at(1, &[15, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(LeafView::nkeys(&leaf), 3);
        assert_eq!(leaf.entry_key(0), 10);
        assert_eq!(leaf.entry_key(1), 15);
        assert_eq!(leaf.entry_key(2), 20);
        assert_eq!(leaf.lower_bound(15), 1);
        assert_eq!(leaf.lower_bound(16), 2);
    }

    #[test]
    fn branch_insert_separator_shifts_right() {
        let mut buf = vec![0u8; 256];
        let mut branch = BranchView::new(&mut buf[..]);
        branch.init(1, 1);
        branch.set_root(100, 50, 200);
        branch.insert_separator(1, 80, 300);
        assert_eq!(BranchView::nkeys(&branch), 2);
        assert_eq!(branch.ptr(0), 100);
        assert_eq!(branch.key(0), 50);
        assert_eq!(branch.ptr(1), 200);
        assert_eq!(branch.key(1), 80);
        assert_eq!(branch.ptr(2), 300);
        assert_eq!(branch.child_for(40), 0);
        assert_eq!(branch.child_for(60), 1);
        assert_eq!(branch.child_for(90), 2);
    }
}
