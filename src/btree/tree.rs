//! Tree mutation and search, generic over a page source so the same logic
//! serves both the `keys` and `blocks` databases described in §3, and so
//! the transaction layer (which owns the actual CoW scratch arrays and
//! page pool) can plug itself in without this module knowing about mmap.
//!
//! Grounded on `examples/original_source/lib/bpt.c`'s `ed_bpt_find` /
//! `ed_bpt_set` / `ed_bpt_del`: linear/binary descent, split-on-full with
//! duplicate-run-aware split point selection, and the documented decision
//! (§9 open questions) to leave underflowed leaves sparse rather than
//! rebalance on delete.

use crate::error::{EddyError, Result};
use crate::page;

use super::node::{
    branch_capacity, leaf_capacity, BranchView, LeafView, NodeView,
};

/// Static cap on tree depth (`INDEX_DEPTH`), matching the reference's small
/// fixed bound.
pub const MAX_DEPTH: u8 = 16;

/// Abstracts page mapping, allocation, and discard-tracking so `Tree` can
/// run against either a real `mmap`-backed index (via the transaction
/// layer) or an in-memory harness in tests.
pub trait PageSource {
    fn page_size(&self) -> usize;
    fn entry_size(&self) -> usize;
    fn current_xid(&self) -> u64;

    /// Borrow a page's bytes for reading.
    fn read(&self, page_no: u32) -> &[u8];

    /// Borrow a page's bytes for writing. Only ever called on pages this
    /// transaction itself allocated (true CoW: never mutate a page another
    /// reader might still be viewing).
    fn write(&mut self, page_no: u32) -> &mut [u8];

    /// Draw a fresh page from the scratch array, stamped with the current
    /// xid, returning its number.
    fn alloc(&mut self) -> Result<u32>;

    /// Record `page_no` as superseded by a CoW rewrite; its reclamation is
    /// deferred to the GC (§4.G step 3).
    fn discard(&mut self, page_no: u32);
}

/// One branch step taken while descending: the branch's page number and
/// the child index chosen.
#[derive(Clone, Copy, Debug)]
pub struct PathStep {
    pub branch: u32,
    pub child_index: usize,
}

/// Cursor state per §4.F: the search key, current leaf/position, whether
/// the position's key matched the search key, counters used for
/// transaction planning and loop detection. `path` records the branch
/// nodes descended through, oldest first, so insert/delete can propagate
/// splits or separator updates back up without re-descending.
#[derive(Clone, Debug)]
pub struct Cursor {
    pub key: u64,
    pub leaf: u32,
    pub index: usize,
    pub matched: bool,
    pub nmatches: u32,
    pub nsplits_along_path: u32,
    pub kmin: u64,
    pub kmax: u64,
    pub loop_count: u32,
    pub path: Vec<PathStep>,
    start_leaf: u32,
    start_index: usize,
}

impl Cursor {
    pub fn entry_index(&self) -> usize {
        self.index
    }
}

pub struct Tree;

impl Tree {
    /// Descend from `root` searching for `key`, recording the path taken.
    pub fn search<S: PageSource>(pages: &S, root: u32, key: u64) -> Result<Cursor> {
        if root == page::NONE {
            return Ok(Cursor {
                key,
                leaf: page::NONE,
                index: 0,
                matched: false,
                nmatches: 0,
                nsplits_along_path: 0,
                kmin: 0,
                kmax: u64::MAX,
                loop_count: 0,
                path: Vec::new(),
                start_leaf: page::NONE,
                start_index: 0,
            });
        }
        let mut node = root;
        let mut depth = 0u8;
        let mut nsplits = 0u32;
        let mut path = Vec::new();
        let (mut kmin, mut kmax) = (0u64, u64::MAX);
        loop {
            let bytes = pages.read(node);
            let view = NodeView::new(bytes);
            if view.page_type() == page::BRANCH {
                let branch = BranchView::new(bytes);
                let cap = branch_capacity(pages.page_size());
                if branch.nkeys() as usize >= cap {
                    nsplits += 1;
                }
                let idx = branch.child_for(key);
                kmin = if idx == 0 { kmin } else { branch.key(idx - 1) };
                kmax = if idx < branch.nkeys() as usize {
                    branch.key(idx)
                } else {
                    kmax
                };
                path.push(PathStep {
                    branch: node,
                    child_index: idx,
                });
                node = branch.ptr(idx);
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(EddyError::DepthExceeded(MAX_DEPTH));
                }
            } else {
                let leaf = LeafView::new(bytes, pages.entry_size());
                let cap = leaf_capacity(pages.page_size(), pages.entry_size());
                if leaf.nkeys() as usize >= cap {
                    nsplits += 1;
                }
                let idx = leaf.lower_bound(key);
                let matched = idx < leaf.nkeys() as usize && leaf.entry_key(idx) == key;
                let nmatches = if matched { leaf.run_len(idx) as u32 } else { 0 };
                return Ok(Cursor {
                    key,
                    leaf: node,
                    index: idx,
                    matched,
                    nmatches,
                    nsplits_along_path: nsplits,
                    kmin,
                    kmax,
                    loop_count: 0,
                    path,
                    start_leaf: node,
                    start_index: idx,
                });
            }
        }
    }

    /// Advance the cursor to the next entry within the current leaf or its
    /// overflow chain (`leaf.next`). Does not walk back up to a sibling
    /// subtree; callers that need full in-order iteration across branches
    /// re-run [`search`] from the tracked `kmax`, which the transaction
    /// layer does for the cache's iteration API.
    pub fn advance_within_chain<S: PageSource>(pages: &S, cursor: &mut Cursor) -> bool {
        let leaf = LeafView::new(pages.read(cursor.leaf), pages.entry_size());
        if cursor.index + 1 < leaf.nkeys() as usize {
            cursor.index += 1;
        } else if leaf.next() != page::NONE {
            cursor.leaf = leaf.next();
            cursor.index = 0;
        } else {
            return false;
        }
        let leaf = LeafView::new(pages.read(cursor.leaf), pages.entry_size());
        cursor.matched = leaf.nkeys() > 0 && leaf.entry_key(cursor.index) == cursor.key;
        if cursor.leaf == cursor.start_leaf && cursor.index == cursor.start_index {
            cursor.loop_count += 1;
        }
        true
    }

    /// Insert `entry` (whose first 8 bytes are `key`) into the tree rooted
    /// at `cursor.leaf`, splitting as needed. Returns the (possibly new)
    /// root page number.
    ///
    /// Split point selection keeps a repeated-key run together: if the
    /// midpoint falls inside a run, the split moves to whichever side of
    /// the run is longer; a leaf that is a single run becomes chained via
    /// an OVERFLOW page instead of splitting.
    pub fn insert<S: PageSource>(
        pages: &mut S,
        root: u32,
        cursor: &Cursor,
        entry: &[u8],
    ) -> Result<u32> {
        let entry_size = pages.entry_size();
        let cap = leaf_capacity(pages.page_size(), entry_size);

        // Copy-on-write the target leaf: a byte-for-byte clone stamped
        // with this transaction's page number and xid.
        let new_leaf_no = pages.alloc()?;
        {
            let old_bytes = pages.read(cursor.leaf).to_vec();
            let dst = pages.write(new_leaf_no);
            dst.copy_from_slice(&old_bytes);
            dst_set_u32(dst, 0, new_leaf_no);
            dst_set_u64(dst, super::node::NODE_HEADER_OFFSET, pages.current_xid());
        }
        pages.discard(cursor.leaf);

        let mut leaf = LeafView::new(pages.write(new_leaf_no), entry_size);
        if (leaf.nkeys() as usize) < cap {
            leaf.insert_at(cursor.index, entry);
            return Self::publish_path(pages, root, cursor, new_leaf_no, None);
        }

        // Leaf is full: decide split strategy.
        let n = leaf.nkeys() as usize;
        let run_start = {
            let mid = n / 2;
            let mut s = mid;
            while s > 0 && leaf.entry_key(s - 1) == leaf.entry_key(mid) {
                s -= 1;
            }
            s
        };
        let run_end = {
            let mid = n / 2;
            let mut e = mid;
            while e < n && leaf.entry_key(e) == leaf.entry_key(mid) {
                e += 1;
            }
            e
        };
        if run_start == 0 && run_end == n {
            // The whole leaf is a single repeated key: chain an OVERFLOW
            // page instead of splitting, so the run is never separated.
            let overflow_no = pages.alloc()?;
            let mut ov = LeafView::new(pages.write(overflow_no), entry_size);
            ov.init(overflow_no, pages.current_xid(), page::OVERFLOW);
            ov.insert_at(0, entry);
            let mut leaf = LeafView::new(pages.write(new_leaf_no), entry_size);
            leaf.set_next(overflow_no);
            return Self::publish_path(pages, root, cursor, new_leaf_no, None);
        }

        // Split at whichever side of the run is longer, so the run stays
        // wholly on one side.
        let split_at = if (n / 2) - run_start >= run_end - (n / 2) {
            run_end
        } else {
            run_start
        };

        let right_no = pages.alloc()?;
        let separator;
        {
            let moved: Vec<u8> = {
                let leaf = LeafView::new(pages.read(new_leaf_no), entry_size);
                let mut buf = Vec::new();
                for i in split_at..n {
                    buf.extend_from_slice(leaf.entry(i));
                }
                buf
            };
            let old_next = LeafView::new(pages.read(new_leaf_no), entry_size).next();
            let mut right = LeafView::new(pages.write(right_no), entry_size);
            right.init(right_no, pages.current_xid(), page::LEAF);
            right.set_next(old_next);
            for i in 0..(n - split_at) {
                let off = i * entry_size;
                right.insert_at(i, &moved[off..off + entry_size]);
            }
            separator = right.entry_key(0);
            let mut left = LeafView::new(pages.write(new_leaf_no), entry_size);
            left.set_next(right_no);
            left.set_nkeys(split_at as u32);
        }

        let target_leaf = if cursor.index >= split_at {
            right_no
        } else {
            new_leaf_no
        };
        let insert_idx = if cursor.index >= split_at {
            cursor.index - split_at
        } else {
            cursor.index
        };
        {
            let mut t = LeafView::new(pages.write(target_leaf), entry_size);
            t.insert_at(insert_idx, entry);
        }

        Self::publish_path(pages, root, cursor, new_leaf_no, Some((separator, right_no)))
    }

    /// Walk `cursor.path` bottom-up, copy-on-writing each branch and
    /// inserting the new separator where needed; splits a branch in turn
    /// if it's already full, and creates a new root if the root itself
    /// splits.
    fn publish_path<S: PageSource>(
        pages: &mut S,
        root: u32,
        cursor: &Cursor,
        new_left_child: u32,
        mut pending_split: Option<(u64, u32)>,
    ) -> Result<u32> {
        let mut child_ptr = new_left_child;
        for step in cursor.path.iter().rev() {
            let new_branch_no = pages.alloc()?;
            let old_bytes = pages.read(step.branch).to_vec();
            {
                let dst = pages.write(new_branch_no);
                dst.copy_from_slice(&old_bytes);
            }
            pages.discard(step.branch);
            let cap = branch_capacity(pages.page_size());
            let mut branch = BranchView::new(pages.write(new_branch_no));
            branch.set_ptr(step.child_index, child_ptr);

            if let Some((sep, right)) = pending_split.take() {
                if (branch.nkeys() as usize) < cap {
                    branch.insert_separator(step.child_index, sep, right);
                } else {
                    // Branch is full too: split it and carry a new
                    // separator up to the next level.
                    let (mid_key, right_branch) =
                        Self::split_branch(pages, new_branch_no, step.child_index, sep, right)?;
                    pending_split = Some((mid_key, right_branch));
                }
            }
            child_ptr = new_branch_no;
        }

        if let Some((sep, right)) = pending_split {
            let new_root_no = pages.alloc()?;
            let mut root_view = BranchView::new(pages.write(new_root_no));
            root_view.init(new_root_no, pages.current_xid());
            root_view.set_root(child_ptr, sep, right);
            return Ok(new_root_no);
        }
        if cursor.path.is_empty() {
            return Ok(child_ptr);
        }
        Ok(root)
    }

    fn split_branch<S: PageSource>(
        pages: &mut S,
        branch_no: u32,
        insert_at: usize,
        sep: u64,
        right_child: u32,
    ) -> Result<(u64, u32)> {
        let n;
        let mid;
        let (left_ptrs, left_keys, promoted, right_ptrs, right_keys);
        {
            let mut ptrs: Vec<u32> = Vec::new();
            let mut keys: Vec<u64> = Vec::new();
            let branch = BranchView::new(pages.read(branch_no));
            n = branch.nkeys() as usize;
            ptrs.push(branch.ptr(0));
            for i in 0..n {
                keys.push(branch.key(i));
                ptrs.push(branch.ptr(i + 1));
            }
            // Splice in the pending separator/right-child at `insert_at`.
            keys.insert(insert_at, sep);
            ptrs.insert(insert_at + 1, right_child);
            mid = keys.len() / 2;
            promoted = keys[mid];
            left_ptrs = ptrs[..=mid].to_vec();
            left_keys = keys[..mid].to_vec();
            right_ptrs = ptrs[mid + 1..].to_vec();
            right_keys = keys[mid + 1..].to_vec();
        }
        {
            let mut left = BranchView::new(pages.write(branch_no));
            for (i, p) in left_ptrs.iter().enumerate() {
                left.set_ptr(i, *p);
            }
            for (i, k) in left_keys.iter().enumerate() {
                left.set_key(i, *k);
            }
            left.set_nkeys(left_keys.len() as u32);
        }
        let right_no = pages.alloc()?;
        {
            let mut right = BranchView::new(pages.write(right_no));
            right.init(right_no, pages.current_xid());
            for (i, p) in right_ptrs.iter().enumerate() {
                right.set_ptr(i, *p);
            }
            for (i, k) in right_keys.iter().enumerate() {
                right.set_key(i, *k);
            }
            right.set_nkeys(right_keys.len() as u32);
        }
        Ok((promoted, right_no))
    }

    /// Delete the entry at `cursor.index` in `cursor.leaf`. Per the
    /// documented policy (§9 open questions), underflowed leaves are left
    /// sparse: no merging or rebalancing. When the first entry of a leaf is
    /// removed, the parent's separator is updated to the new first key so
    /// tree-order search still finds the right subtree.
    pub fn delete<S: PageSource>(pages: &mut S, root: u32, cursor: &Cursor) -> Result<u32> {
        let entry_size = pages.entry_size();
        let new_leaf_no = pages.alloc()?;
        let new_first_key;
        {
            let old_bytes = pages.read(cursor.leaf).to_vec();
            let dst = pages.write(new_leaf_no);
            dst.copy_from_slice(&old_bytes);
            let mut leaf = LeafView::new(dst, entry_size);
            leaf.delete_at(cursor.index);
            new_first_key = if leaf.nkeys() > 0 {
                Some(leaf.entry_key(0))
            } else {
                None
            };
        }
        pages.discard(cursor.leaf);

        let update_separator = cursor.index == 0;
        let mut child_ptr = new_leaf_no;
        let mut root = root;
        if update_separator {
            if let (Some(key), Some(step)) = (new_first_key, cursor.path.last()) {
                if step.child_index > 0 {
                    root = Self::update_ancestor_separator(pages, root, cursor, child_ptr, key)?;
                    return Ok(root);
                }
            }
        }
        // No separator to update (or it lives further up): still need to
        // rewrite the path down to this leaf so the new leaf is reachable.
        for step in cursor.path.iter().rev() {
            let new_branch_no = pages.alloc()?;
            let old_bytes = pages.read(step.branch).to_vec();
            {
                let dst = pages.write(new_branch_no);
                dst.copy_from_slice(&old_bytes);
            }
            pages.discard(step.branch);
            let mut branch = BranchView::new(pages.write(new_branch_no));
            branch.set_ptr(step.child_index, child_ptr);
            child_ptr = new_branch_no;
        }
        if cursor.path.is_empty() {
            Ok(child_ptr)
        } else {
            Ok(root)
        }
    }

    /// Rewrite the path, additionally updating the separator key that
    /// bounds `cursor.leaf` on its left (the key in the parent at index
    /// `child_index - 1`) wherever it appears along the path.
    fn update_ancestor_separator<S: PageSource>(
        pages: &mut S,
        root: u32,
        cursor: &Cursor,
        leaf_ptr: u32,
        new_key: u64,
    ) -> Result<u32> {
        let mut child_ptr = leaf_ptr;
        let mut updated_separator = false;
        for step in cursor.path.iter().rev() {
            let new_branch_no = pages.alloc()?;
            let old_bytes = pages.read(step.branch).to_vec();
            {
                let dst = pages.write(new_branch_no);
                dst.copy_from_slice(&old_bytes);
            }
            pages.discard(step.branch);
            let mut branch = BranchView::new(pages.write(new_branch_no));
            branch.set_ptr(step.child_index, child_ptr);
            if !updated_separator && step.child_index > 0 {
                branch.set_key(step.child_index - 1, new_key);
                updated_separator = true;
            }
            child_ptr = new_branch_no;
        }
        if cursor.path.is_empty() {
            Ok(child_ptr)
        } else {
            Ok(root)
        }
    }
}

fn dst_set_u32(bytes: &mut [u8], off: usize, v: u32) {
    bytes[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn dst_set_u64(bytes: &mut [u8], off: usize, v: u64) {
    bytes[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ENTRY_SIZE: usize = 16;
    const PAGE_SIZE: usize = 256;

    struct MemPages {
        pages: HashMap<u32, Vec<u8>>,
        next: u32,
        xid: u64,
    }

    impl MemPages {
        fn new() -> Self {
            MemPages {
                pages: HashMap::new(),
                next: 1,
                xid: 1,
            }
        }
    }

    impl PageSource for MemPages {
        fn page_size(&self) -> usize {
            PAGE_SIZE
        }
        fn entry_size(&self) -> usize {
            ENTRY_SIZE
        }
        fn current_xid(&self) -> u64 {
            self.xid
        }
        fn read(&self, page_no: u32) -> &[u8] {
            self.pages.get(&page_no).expect("page not allocated")
        }
        fn write(&mut self, page_no: u32) -> &mut [u8] {
            self.pages.get_mut(&page_no).expect("page not allocated")
        }
        fn alloc(&mut self) -> Result<u32> {
            let no = self.next;
            self.next += 1;
            self.pages.insert(no, vec![0u8; PAGE_SIZE]);
            Ok(no)
        }
        fn discard(&mut self, _page_no: u32) {}
    }

    fn make_entry(key: u64) -> [u8; ENTRY_SIZE] {
        let mut e = [0u8; ENTRY_SIZE];
        e[..8].copy_from_slice(&key.to_ne_bytes());
        e
    }

    #[test]
    fn insert_into_empty_leaf_then_find() {
        let mut pages = MemPages::new();
        let root_no = pages.alloc().unwrap();
        {
            let mut leaf = LeafView::new(pages.write(root_no), ENTRY_SIZE);
            leaf.init(root_no, 1, page::LEAF);
        }
        let cursor = Tree::search(&pages, root_no, 5).unwrap();
        assert!(!cursor.matched);
        let root_no = Tree::insert(&mut pages, root_no, &cursor, &make_entry(5)).unwrap();
        let cursor = Tree::search(&pages, root_no, 5).unwrap();
        assert!(cursor.matched);
        assert_eq!(cursor.nmatches, 1);
    }

    #[test]
    fn insert_many_keeps_sorted_order() {
        let mut pages = MemPages::new();
        let mut root = pages.alloc().unwrap();
        {
            let mut leaf = LeafView::new(pages.write(root), ENTRY_SIZE);
            leaf.init(root, 1, page::LEAF);
        }
        let keys = [10u64, 3, 7, 1, 9, 5, 2, 8, 4, 6];
        for &k in &keys {
            let cursor = Tree::search(&pages, root, k).unwrap();
            root = Tree::insert(&mut pages, root, &cursor, &make_entry(k)).unwrap();
        }
        for &k in &keys {
            let cursor = Tree::search(&pages, root, k).unwrap();
            assert!(cursor.matched, "key {k} should be found");
        }
    }

    #[test]
    fn duplicate_keys_stay_together_across_a_split() {
        let mut pages = MemPages::new();
        let mut root = pages.alloc().unwrap();
        {
            let mut leaf = LeafView::new(pages.write(root), ENTRY_SIZE);
            leaf.init(root, 1, page::LEAF);
        }
        let cap = leaf_capacity(PAGE_SIZE, ENTRY_SIZE);
        // Fill past capacity with a repeated key in the middle.
        for i in 0..cap as u64 {
            let key = if i == cap as u64 / 2 { 1000 } else { i * 2 };
            let cursor = Tree::search(&pages, root, key).unwrap();
            root = Tree::insert(&mut pages, root, &cursor, &make_entry(key)).unwrap();
        }
        // Insert several more copies of the duplicate to force it across a
        // split boundary.
        for _ in 0..3 {
            let cursor = Tree::search(&pages, root, 1000).unwrap();
            root = Tree::insert(&mut pages, root, &cursor, &make_entry(1000)).unwrap();
        }
        let cursor = Tree::search(&pages, root, 1000).unwrap();
        assert!(cursor.matched);
        assert!(cursor.nmatches >= 1);
    }

    #[test]
    fn delete_first_entry_updates_separator() {
        let mut pages = MemPages::new();
        let mut root = pages.alloc().unwrap();
        {
            let mut leaf = LeafView::new(pages.write(root), ENTRY_SIZE);
            leaf.init(root, 1, page::LEAF);
        }
        let cap = leaf_capacity(PAGE_SIZE, ENTRY_SIZE);
        for i in 0..(cap as u64 + 2) {
            let cursor = Tree::search(&pages, root, i * 2).unwrap();
            root = Tree::insert(&mut pages, root, &cursor, &make_entry(i * 2)).unwrap();
        }
        let cursor = Tree::search(&pages, root, 0).unwrap();
        assert!(cursor.matched);
        root = Tree::delete(&mut pages, root, &cursor).unwrap();
        let cursor = Tree::search(&pages, root, 0).unwrap();
        assert!(!cursor.matched);
        let cursor = Tree::search(&pages, root, 2).unwrap();
        assert!(cursor.matched);
    }
}
