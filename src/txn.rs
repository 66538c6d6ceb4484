//! Component G — the transaction layer.
//!
//! Grounded on `examples/original_source/lib/txn.c`'s `EdTxn` (open/commit/
//! close, the `pg[]` scratch array sized to `nsplits`, the node-wrapper
//! arena) and on the teacher's own read/write transaction split in
//! `src/lib.rs` (`ReadTxn`/`WriteTxn` checked out of a shared core under a
//! mutex) — generalized here to a *process*-level writer/reader split since
//! eddy's concurrency boundary is the OS file lock, not an in-process
//! mutex.
//!
//! A transaction never touches the mmap directly: it goes through
//! [`crate::btree::tree::PageSource`] so the same `Tree` algorithm exercised
//! in `btree::tree`'s own unit tests runs here against real pages, lazily
//! mapped one at a time the way [`crate::page::LoadSlot`] maps a single
//! page on demand.

use std::cell::RefCell;
use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::btree::tree::{Cursor, PageSource, Tree};
use crate::conn::ConnSlot;
use crate::error::{EddyError, Result};
use crate::gc::GcPage;
use crate::index::Index;
use crate::lock::Mode;
use crate::page;

/// Number of trees an index maintains: `keys` (hash -> object position) and
/// `blocks` (slab position -> object), per §3.
pub const N_DB: usize = 2;
pub const DB_KEYS: usize = 0;
pub const DB_BLOCKS: usize = 1;

/// Key-tree entry: `{hash, block_no, block_count, expiry}`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct KeyEntry {
    pub hash: u64,
    pub block_no: u64,
    pub block_count: u32,
    pub expiry: u32,
}

/// Block-tree entry: `{block_no, block_count, _pad, xid}`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BlockEntry {
    pub block_no: u64,
    pub block_count: u32,
    pub _pad: u32,
    pub xid: u64,
}

pub fn entry_size(db: usize) -> usize {
    match db {
        DB_KEYS => std::mem::size_of::<KeyEntry>(),
        DB_BLOCKS => std::mem::size_of::<BlockEntry>(),
        _ => unreachable!("only {N_DB} databases exist"),
    }
}

/// Bound on total newly-allocated pages a single transaction may draw.
/// The reference sizes its scratch array to `nsplits` summed across
/// databases as it goes; we size it up front to the worst case (every
/// level of every tree splitting) since pages are mapped lazily anyway and
/// the over-allocation only costs a `Vec` capacity bump.
fn scratch_budget() -> usize {
    2 * crate::btree::tree::MAX_DEPTH as usize * N_DB
}

/// A page mapped into this transaction, tagged with whether this
/// transaction itself allocated it (and so may freely rewrite it) or only
/// mapped it to read a committed generation some other reader might still
/// observe.
struct Slot {
    mapping: page::Mapping,
    written: bool,
}

impl Slot {
    fn bytes(&self) -> &[u8] {
        self.mapping.as_bytes()
    }
}

/// An open transaction against an [`Index`]: either a reader holding a
/// shared lock and a frozen root snapshot, or a writer holding the
/// exclusive lock and staging new ones.
pub struct Txn<'idx> {
    index: &'idx Index,
    read_only: bool,
    closed: bool,
    /// Root page per db: the snapshot observed at `open` for a reader, or
    /// the currently-staged root (updated after every `insert`/`delete`)
    /// for a writer.
    roots: [u32; N_DB],
    pages: RefCell<HashMap<u32, Box<Slot>>>,
    /// Pages newly drawn from the allocator this transaction — candidates
    /// for `pending[]` on commit, or for return-to-free-list on abort.
    drawn: Vec<u32>,
    /// Old page numbers superseded by a CoW rewrite, queued for GC on
    /// commit with this transaction's xid.
    discarded: Vec<u32>,
}

impl<'idx> Txn<'idx> {
    /// Open a transaction. `flags` may include [`crate::config::flags::RDONLY`]
    /// and [`crate::config::flags::NOBLOCK`].
    pub(crate) fn open(index: &'idx Index, flags: u32) -> Result<Self> {
        use crate::config::flags;
        let read_only = flags & flags::RDONLY != 0;
        let lock_flags = if flags & flags::NOBLOCK != 0 {
            crate::lock::flags::NOBLOCK
        } else {
            0
        };
        let mode = if read_only { Mode::Shared } else { Mode::Exclusive };
        index.lock().lock(index.file(), mode, lock_flags)?;

        let xid = index.current_xid();
        let roots = index.roots();

        if read_only {
            index.record_active_xid(xid);
        } else {
            let xmin = index.compute_xmin();
            log::debug!("write transaction opened at xid={xid}, xmin={xmin}");
            // Bounded GC step: release whatever is immediately reclaimable
            // before this transaction draws any new pages, so a long-lived
            // index doesn't grow the file when reclaimable pages already
            // cover the need.
            index.run_gc_step(xmin, 4);
        }

        Ok(Txn {
            index,
            read_only,
            closed: false,
            roots,
            pages: RefCell::new(HashMap::new()),
            drawn: Vec::new(),
            discarded: Vec::new(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(EddyError::TxnClosed);
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root(&self, db: usize) -> u32 {
        self.roots[db]
    }

    /// A view over this transaction restricted to one database's page
    /// source, for passing to [`Tree`].
    pub fn db(&mut self, db: usize) -> DbPages<'_, 'idx> {
        DbPages { txn: self, db }
    }

    pub fn find(&mut self, db: usize, key: u64) -> Result<Cursor> {
        self.check_open()?;
        let root = self.roots[db];
        let view = self.db(db);
        Tree::search(&view, root, key)
    }

    pub fn insert(&mut self, db: usize, cursor: &Cursor, entry: &[u8]) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(EddyError::ReadOnly);
        }
        if cursor.matched && cursor.key != key_of(entry) {
            return Err(EddyError::KeyMismatch);
        }
        let root = self.roots[db];
        let new_root = {
            let mut view = self.db(db);
            Tree::insert(&mut view, root, cursor, entry)?
        };
        self.roots[db] = new_root;
        Ok(())
    }

    /// The fixed-size entry bytes at an arbitrary `(leaf, index)`, or `None`
    /// if `index` is past the leaf's last key. Unlike [`Self::entry_bytes`]
    /// this doesn't require the position to be a search match, so callers
    /// can inspect the insertion point a non-matching search landed on.
    pub fn entry_at(&self, db: usize, leaf: u32, index: usize) -> Option<&[u8]> {
        if leaf == page::NONE {
            return None;
        }
        let bytes = self.page_bytes(leaf);
        let view = crate::btree::node::LeafView::new(bytes, entry_size(db));
        if index < view.nkeys() as usize {
            Some(view.entry(index))
        } else {
            None
        }
    }

    /// The fixed-size entry bytes the cursor currently points at, if it's
    /// sitting on a match. The cache layer (component I) uses this to read
    /// key/block entries without reaching into the page format itself.
    pub fn entry_bytes(&self, db: usize, cursor: &Cursor) -> Option<&[u8]> {
        if !cursor.matched {
            return None;
        }
        self.entry_at(db, cursor.leaf, cursor.index)
    }

    /// `(nkeys, next)` for a leaf page, used to walk the whole tree in
    /// order (§4.I iterate) by re-descending from `kmax` once a leaf's
    /// overflow chain is exhausted, per `btree::tree`'s own design note.
    pub fn leaf_view_info(&self, db: usize, leaf: u32) -> (u32, u32) {
        let bytes = self.page_bytes(leaf);
        let view = crate::btree::node::LeafView::new(bytes, entry_size(db));
        (view.nkeys(), view.next())
    }

    /// Advance `cursor` to the next entry in same-key iteration order
    /// (within-leaf, then the overflow chain). See
    /// [`crate::btree::tree::Tree::advance_within_chain`].
    pub fn advance(&mut self, db: usize, cursor: &mut Cursor) -> bool {
        let view = self.db(db);
        crate::btree::tree::Tree::advance_within_chain(&view, cursor)
    }

    pub fn delete(&mut self, db: usize, cursor: &Cursor) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(EddyError::ReadOnly);
        }
        let root = self.roots[db];
        let new_root = {
            let mut view = self.db(db);
            Tree::delete(&mut view, root, cursor)?
        };
        self.roots[db] = new_root;
        Ok(())
    }

    /// Ensure `page_no` is mapped as a read-only slot if this is the first
    /// touch. Boxing each slot keeps its mmap handle at a stable heap
    /// address across `HashMap` rehashes, which is what lets
    /// [`page_bytes`](Self::page_bytes) hand out a reference whose
    /// lifetime outlives the short-lived `RefCell` borrow used to look it
    /// up.
    fn ensure_mapped(&self, page_no: u32) -> Result<()> {
        if !self.pages.borrow().contains_key(&page_no) {
            let mapping = page::map(self.index.file(), page_no, 1, self.index.page_size())?;
            self.pages.borrow_mut().insert(
                page_no,
                Box::new(Slot {
                    mapping,
                    written: false,
                }),
            );
        }
        Ok(())
    }

    /// Read a page's bytes, mapping it on first touch.
    fn page_bytes(&self, page_no: u32) -> &[u8] {
        self.ensure_mapped(page_no)
            .expect("mapping an index page failed");
        let guard = self.pages.borrow();
        let slot: &Slot = guard.get(&page_no).expect("just inserted");
        let ptr: *const Slot = slot;
        // SAFETY: slots are append-only for the life of the transaction and
        // heap-boxed, so the referent does not move or get freed while
        // `self` is borrowed, even though the `Ref` guard itself is
        // dropped at the end of this function.
        unsafe { (*ptr).bytes() }
    }

    /// Mutable access to a page this transaction itself allocated.
    fn page_bytes_mut(&self, page_no: u32) -> &mut [u8] {
        let guard = self.pages.borrow();
        let slot: &Slot = guard.get(&page_no).expect("page not mapped");
        if !slot.written {
            panic!("write() called on a page this transaction did not allocate");
        }
        let ptr: *const Slot = slot;
        // SAFETY: see `page_bytes`; additionally, only pages this
        // transaction itself drew are ever marked `written`, and CoW
        // guarantees no other transaction or reader holds a reference into
        // a page before it is published.
        unsafe { (*ptr).mapping.as_bytes_mut() }
    }

    fn promote_and_zero(&self, page_no: u32) {
        let mut guard = self.pages.borrow_mut();
        let slot = guard.get_mut(&page_no).expect("just allocated");
        slot.written = true;
        unsafe { slot.mapping.as_bytes_mut().fill(0) };
    }

    /// Commit this transaction: record `pending[]`, swap roots atomically,
    /// increment `xid`, enqueue discards into GC, optionally `msync`, and
    /// release the write lock. Returns the newly committed xid.
    pub fn commit(mut self, flags: u32) -> Result<u64> {
        use crate::config::flags;
        self.check_open()?;
        if self.read_only {
            return Err(EddyError::ReadOnly);
        }

        self.index.record_pending(&self.drawn)?;
        let committed_xid = self.index.publish_roots(self.roots);

        if !self.discarded.is_empty() {
            self.index.enqueue_gc(committed_xid, &self.discarded)?;
        }
        self.index.clear_pending();

        if flags & flags::NOSYNC == 0 {
            for slot in self.pages.borrow().values() {
                if slot.written {
                    slot.mapping.flush()?;
                }
            }
        }

        self.closed = true;
        self.index.lock().unlock(self.index.file(), 0)?;
        log::debug!("transaction committed at xid={committed_xid}");
        Ok(committed_xid)
    }

    /// Abort a write transaction (returning drawn-but-unpublished pages to
    /// the free list) or finish a read transaction (clearing
    /// `active_xid`), then release the lock. A second call is a no-op,
    /// matching the reference's idempotent `close`.
    pub fn close(mut self) {
        self.close_mut();
    }

    fn close_mut(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.read_only {
            self.index.clear_active_xid();
        } else if !self.drawn.is_empty() {
            log::warn!(
                "aborting write transaction: returning {} drawn pages to the free list",
                self.drawn.len()
            );
            self.index.free_pages(&self.drawn);
            self.index.clear_pending();
        }
        let _ = self.index.lock().unlock(self.index.file(), 0);
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        self.close_mut();
    }
}

fn key_of(entry: &[u8]) -> u64 {
    u64::from_ne_bytes(entry[..8].try_into().unwrap())
}

/// A [`PageSource`] over one of a transaction's two databases. Holds no
/// state of its own beyond which db it is; all page bookkeeping lives on
/// the parent [`Txn`] so pages allocated while mutating the keys tree are
/// immediately visible to the blocks tree in the same transaction.
pub struct DbPages<'t, 'idx> {
    txn: &'t mut Txn<'idx>,
    db: usize,
}

impl PageSource for DbPages<'_, '_> {
    fn page_size(&self) -> usize {
        self.txn.index.page_size()
    }

    fn entry_size(&self) -> usize {
        entry_size(self.db)
    }

    fn current_xid(&self) -> u64 {
        self.txn.index.current_xid() + 1
    }

    fn read(&self, page_no: u32) -> &[u8] {
        self.txn.page_bytes(page_no)
    }

    fn write(&mut self, page_no: u32) -> &mut [u8] {
        self.txn.page_bytes_mut(page_no)
    }

    fn alloc(&mut self) -> Result<u32> {
        if self.txn.drawn.len() >= scratch_budget() {
            return Err(EddyError::OutOfPages);
        }
        let page_no = self.txn.index.alloc_page()?;
        self.txn.ensure_mapped(page_no)?;
        self.txn.promote_and_zero(page_no);
        self.txn.drawn.push(page_no);
        Ok(page_no)
    }

    fn discard(&mut self, page_no: u32) {
        self.txn.discarded.push(page_no);
    }
}

/// A bounded GC sweep run from a transaction-less context (e.g. the
/// opener, before any writer has touched the index). Exposed so
/// [`Index::open`] can drain an obviously-stale backlog without spinning
/// up a full write transaction.
pub fn run_gc_once(page: GcPage<'_>, xmin: u64, limit: usize) -> (Vec<u32>, usize, bool) {
    crate::gc::run(page, xmin, limit)
}

/// Scan the connection table for a writer's `xmin`: the lowest
/// `active_xid` across all slots that are actually reading, or the current
/// xid if nobody is.
pub fn compute_xmin(slots: &[ConnSlot], current_xid: u64) -> u64 {
    slots
        .iter()
        .filter(|s| s.active_xid != 0)
        .map(|s| s.active_xid)
        .min()
        .unwrap_or(current_xid)
}
