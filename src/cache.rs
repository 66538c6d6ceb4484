//! Component I — the object cache API, a thin layer over the transaction.
//!
//! Grounded on `examples/original_source/lib/cache.c`'s `ed_cache_open`/
//! `ed_open`/`ed_create` (hash the key, search the keys tree, map the slab
//! region) and on §4.I's more complete `reserve` algorithm, which the C
//! source itself only stubs out (`ENOTSUP`). The byte-range lock primitive
//! is [`crate::lock::ByteRangeLock`], the same type the index header and
//! connection slots already use (component B); here it guards a dynamic
//! slab block range instead of a fixed header field, so the cache keeps a
//! small table of one lock per distinct range rather than one fixed
//! instance.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};

use crate::config::{flags, OpenOptions};
use crate::error::{EddyError, Result};
use crate::hash;
use crate::index::Index;
use crate::lock::{ByteRangeLock, Mode};
use crate::time::{self, EdTime};
use crate::txn::{BlockEntry, Cursor, KeyEntry, DB_BLOCKS, DB_KEYS};

/// Cap on stored key length. The reference bounds this by the slab path
/// buffer's neighbor fields; picked here to keep a key plus its object
/// header comfortably inside one page for small objects.
pub const MAX_KEY_LEN: usize = 1024;

/// Alignment boundary between an object's key and its metadata, matching
/// the reference's "padding to max alignment" (`max_align_t` is 16 on every
/// platform this crate targets).
const MAX_ALIGN: usize = 16;

const OBJECT_VERSION: u16 = 1;

/// First-page header of a slab object (§3): `{version, flags, tag,
/// created_time, xid, keylen, metalen, datalen, keyhash, metacrc,
/// datacrc}`. Fields are ordered by descending alignment so the `Pod`
/// derive sees no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ObjectHeader {
    pub xid: u64,
    pub datalen: u64,
    pub keyhash: u64,
    pub tag: u64,
    pub metalen: u32,
    pub metacrc: u32,
    pub datacrc: u32,
    pub created_time: u32,
    pub keylen: u16,
    pub version: u16,
    pub flags: u16,
    pub _pad: u16,
}

pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// The slab byte layout an object's key/meta/data lengths resolve to.
struct Footprint {
    key_offset: usize,
    meta_offset: usize,
    data_offset: usize,
    block_count: u64,
}

fn compute_footprint(keylen: usize, metalen: usize, datalen: u64, block_size: usize) -> Footprint {
    let key_offset = OBJECT_HEADER_SIZE;
    let key_end = key_offset + keylen + 1; // NUL terminator
    let meta_offset = align_up(key_end, MAX_ALIGN);
    let meta_end = meta_offset + metalen;
    let data_offset = align_up(meta_end, block_size);
    let total_len = data_offset as u64 + datalen;
    let block_count = (total_len + block_size as u64 - 1) / block_size as u64;
    Footprint {
        key_offset,
        meta_offset,
        data_offset,
        block_count: block_count.max(1),
    }
}

/// An embedded, persistent, fixed-capacity object cache: an [`Index`] (the
/// keys/blocks b+trees and connection table) plus a table of in-process
/// slab byte-range locks.
pub struct Cache {
    index: Index,
    /// A private duplicate of the slab file descriptor, handed out to
    /// [`Object`]/[`Reservation`] values so they can release their
    /// byte-range lock on drop without borrowing back from `Cache`.
    /// fcntl record locks are per-process-per-inode, so unlocking through
    /// this fd releases the same range `Index` locked through its own.
    slab_file: Arc<File>,
    slab_locks: Mutex<HashMap<(u64, u64), Arc<ByteRangeLock>>>,
}

impl Cache {
    pub fn open(opts: OpenOptions) -> Result<Self> {
        let index = Index::open(&opts)?;
        let slab_file = Arc::new(index.slab_file().try_clone().map_err(EddyError::Open)?);
        Ok(Cache {
            index,
            slab_file,
            slab_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// A point-in-time health snapshot (§4.H `Stat`).
    pub fn stat(&self) -> Result<crate::index::Stat> {
        self.index.stat()
    }

    /// Scan reachability from the roots and return any leaked pages to the
    /// free list (§5 crash recovery, the "died after root-swap, before GC
    /// enqueue" case).
    pub fn repair_leaks(&self) -> Result<crate::index::Stat> {
        self.index.repair_leaks()
    }

    fn slab_lock(&self, start: u64, len: u64) -> Arc<ByteRangeLock> {
        let mut table = self.slab_locks.lock().unwrap();
        table
            .entry((start, len))
            .or_insert_with(|| Arc::new(ByteRangeLock::new(start, len)))
            .clone()
    }

    fn block_range(&self, block_no: u64, block_count: u64) -> (u64, u64) {
        let bs = self.index.slab_block_size() as u64;
        (block_no * bs, block_count * bs)
    }

    fn map_blocks(&self, block_no: u64, block_count: u64) -> Result<memmap2::MmapRaw> {
        let (offset, len) = self.block_range(block_no, block_count);
        memmap2::MmapOptions::new()
            .offset(offset)
            .len(len as usize)
            .map_raw(self.index.slab_file())
            .map_err(|e| EddyError::AllocFailed {
                requested: len as usize,
                source: e,
            })
    }

    fn read_header_at(&self, block_no: u64) -> Result<ObjectHeader> {
        let mapping = self.map_blocks(block_no, 1)?;
        let bytes = unsafe { std::slice::from_raw_parts(mapping.as_ptr(), OBJECT_HEADER_SIZE) };
        Ok(*bytemuck::from_bytes(bytes))
    }

    fn read_key_at(&self, block_no: u64, header: &ObjectHeader) -> Result<Vec<u8>> {
        let span = OBJECT_HEADER_SIZE + header.keylen as usize;
        let block_count = ((span + self.index.slab_block_size() as usize - 1)
            / self.index.slab_block_size() as usize)
            .max(1) as u64;
        let mapping = self.map_blocks(block_no, block_count)?;
        let bytes = unsafe { std::slice::from_raw_parts(mapping.as_ptr(), span) };
        Ok(bytes[OBJECT_HEADER_SIZE..span].to_vec())
    }

    fn object_key_equals(&self, block_no: u64, key: &[u8]) -> Result<bool> {
        let header = self.read_header_at(block_no)?;
        if header.keylen as usize != key.len() {
            return Ok(false);
        }
        Ok(self.read_key_at(block_no, &header)? == key)
    }

    /// Hash `key`, open a read-only transaction, and walk same-hash
    /// collisions in the keys tree looking for an exact, unexpired match
    /// (§4.I `Get`).
    pub fn get(&self, key: &[u8]) -> Result<Option<Object>> {
        if key.len() > MAX_KEY_LEN {
            return Err(EddyError::KeyTooLong(key.len(), MAX_KEY_LEN));
        }
        let seed = self.index.seed();
        let epoch = self.index.epoch();
        let keyhash = hash::hash_key(key, seed);
        let now = time::now_unix();

        let mut txn = self.index.begin(flags::RDONLY)?;
        let mut cursor = txn.find(DB_KEYS, keyhash)?;

        loop {
            if !cursor.matched {
                return Ok(None);
            }
            let entry: KeyEntry = *bytemuck::from_bytes(
                txn.entry_bytes(DB_KEYS, &cursor).expect("matched cursor has an entry"),
            );
            if entry.hash != keyhash {
                return Ok(None);
            }
            if entry.expiry != crate::time::TIME_INF
                && time::expired_at(epoch, entry.expiry, now)
            {
                if !txn.advance(DB_KEYS, &mut cursor) {
                    return Ok(None);
                }
                continue;
            }

            let (start, len) = self.block_range(entry.block_no, entry.block_count as u64);
            let range_lock = self.slab_lock(start, len);
            if range_lock
                .lock(self.index.slab_file(), Mode::Shared, crate::lock::flags::NOBLOCK)
                .is_err()
            {
                if !txn.advance(DB_KEYS, &mut cursor) {
                    return Ok(None);
                }
                continue;
            }

            let header = match self.read_header_at(entry.block_no) {
                Ok(h) => h,
                Err(e) => {
                    let _ = range_lock.unlock(self.index.slab_file(), 0);
                    return Err(e);
                }
            };
            let key_bytes = match self.read_key_at(entry.block_no, &header) {
                Ok(k) => k,
                Err(e) => {
                    let _ = range_lock.unlock(self.index.slab_file(), 0);
                    return Err(e);
                }
            };
            if header.keylen as usize == key.len() && key_bytes == key {
                let mapping = self.map_blocks(entry.block_no, entry.block_count as u64)?;
                return Ok(Some(Object {
                    mapping,
                    header,
                    range_lock,
                    file: self.slab_file.clone(),
                    block_size: self.index.slab_block_size(),
                }));
            }
            let _ = range_lock.unlock(self.index.slab_file(), 0);
            if !txn.advance(DB_KEYS, &mut cursor) {
                return Ok(None);
            }
        }
    }

    /// Compute `key`'s footprint, claim slab blocks starting from the
    /// write cursor (wrapping and skipping past contended or colliding
    /// ranges), evict whatever it overlaps, and publish a fresh key/block
    /// entry pair (§4.I `Reserve`).
    pub fn reserve(
        &self,
        key: &[u8],
        meta: &[u8],
        datalen: u64,
        ttl: Option<u64>,
    ) -> Result<Reservation> {
        if key.len() > MAX_KEY_LEN {
            return Err(EddyError::KeyTooLong(key.len(), MAX_KEY_LEN));
        }
        let block_size = self.index.slab_block_size() as usize;
        let footprint = compute_footprint(key.len(), meta.len(), datalen, block_size);
        let slab_block_count = self.index.slab_block_count();
        if footprint.block_count > slab_block_count {
            return Err(EddyError::ObjectTooLarge(footprint.block_count, slab_block_count));
        }

        let mut txn = self.index.begin(0)?;
        let seed = self.index.seed();
        let epoch = self.index.epoch();
        let keyhash = hash::hash_key(key, seed);

        let mut pos = self.index.slab_pos();
        let range_lock;
        loop {
            if pos + footprint.block_count > slab_block_count {
                pos = 0;
            }
            let (start, len) = self.block_range(pos, footprint.block_count);
            let lock = self.slab_lock(start, len);
            match lock.lock(self.index.slab_file(), Mode::Exclusive, crate::lock::flags::NOBLOCK) {
                Ok(()) => {
                    range_lock = lock;
                    break;
                }
                Err(e) if e.would_block() => {
                    pos = self.next_candidate_pos(&mut txn, pos)?;
                    continue;
                }
                Err(e) => {
                    txn.close();
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.evict_overlap(&mut txn, pos, footprint.block_count) {
            let _ = range_lock.unlock(self.index.slab_file(), 0);
            txn.close();
            return Err(e);
        }
        if let Err(e) = self.evict_same_key(&mut txn, keyhash, key) {
            let _ = range_lock.unlock(self.index.slab_file(), 0);
            txn.close();
            return Err(e);
        }

        let expiry = time::expiry_at(epoch, ttl, time::now_unix());
        let key_entry = KeyEntry {
            hash: keyhash,
            block_no: pos,
            block_count: footprint.block_count as u32,
            expiry,
        };
        let block_entry = BlockEntry {
            block_no: pos,
            block_count: footprint.block_count as u32,
            _pad: 0,
            xid: 0,
        };

        let kcursor = match txn.find(DB_KEYS, keyhash) {
            Ok(c) => c,
            Err(e) => {
                let _ = range_lock.unlock(self.index.slab_file(), 0);
                txn.close();
                return Err(e);
            }
        };
        if let Err(e) = txn.insert(DB_KEYS, &kcursor, bytemuck::bytes_of(&key_entry)) {
            let _ = range_lock.unlock(self.index.slab_file(), 0);
            txn.close();
            return Err(e);
        }
        let bcursor = match txn.find(DB_BLOCKS, pos) {
            Ok(c) => c,
            Err(e) => {
                let _ = range_lock.unlock(self.index.slab_file(), 0);
                txn.close();
                return Err(e);
            }
        };
        if let Err(e) = txn.insert(DB_BLOCKS, &bcursor, bytemuck::bytes_of(&block_entry)) {
            let _ = range_lock.unlock(self.index.slab_file(), 0);
            txn.close();
            return Err(e);
        }

        self.index.set_slab_pos(pos + footprint.block_count);
        let committed_xid = match txn.commit(0) {
            Ok(xid) => xid,
            Err(e) => {
                let _ = range_lock.unlock(self.index.slab_file(), 0);
                return Err(e);
            }
        };

        let mapping = match self.map_blocks(pos, footprint.block_count) {
            Ok(m) => m,
            Err(e) => {
                let _ = range_lock.unlock(self.index.slab_file(), 0);
                return Err(e);
            }
        };

        let header = ObjectHeader {
            xid: committed_xid,
            datalen,
            keyhash,
            tag: 0,
            metalen: meta.len() as u32,
            metacrc: if meta.is_empty() { 0 } else { hash::crc32c(0, meta) },
            datacrc: 0,
            created_time: time::from_unix(epoch, time::now_unix()),
            keylen: key.len() as u16,
            version: OBJECT_VERSION,
            flags: 0,
            _pad: 0,
        };
        let bytes = unsafe { std::slice::from_raw_parts_mut(mapping.as_mut_ptr(), mapping.len()) };
        bytes[..OBJECT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        bytes[footprint.key_offset..footprint.key_offset + key.len()].copy_from_slice(key);
        bytes[footprint.key_offset + key.len()] = 0;
        if !meta.is_empty() {
            bytes[footprint.meta_offset..footprint.meta_offset + meta.len()].copy_from_slice(meta);
        }

        Ok(Reservation {
            mapping,
            header,
            range_lock,
            file: self.slab_file.clone(),
            data_offset: footprint.data_offset,
            block_no: pos,
        })
    }

    /// Write `data` (must be exactly `datalen` bytes, as given to
    /// [`Self::reserve`]) into a reservation's data region and finalize its
    /// checksum.
    pub fn write(&self, obj: &mut Reservation, data: &[u8]) -> Result<()> {
        if data.len() as u64 != obj.header.datalen {
            return Err(EddyError::Invariant("write() data length does not match reserved datalen"));
        }
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(obj.mapping.as_mut_ptr(), obj.mapping.len()) };
        bytes[obj.data_offset..obj.data_offset + data.len()].copy_from_slice(data);
        obj.header.datacrc = if data.is_empty() { 0 } else { hash::crc32c(0, data) };
        bytes[..OBJECT_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&obj.header));
        obj.mapping.flush().map_err(EddyError::Sync)?;
        Ok(())
    }

    /// Release a reservation's exclusive slab lock. Idempotent with
    /// dropping the value; the explicit form exists so callers can observe
    /// the unlock's `Result`.
    pub fn close(&self, obj: Reservation) -> Result<()> {
        obj.range_lock.unlock(&obj.file, 0)
    }

    /// Replace a live entry's expiry without touching its data, by
    /// deleting and reinserting the key entry with the same hash and
    /// position.
    pub fn update_ttl(&self, key: &[u8], ttl: Option<u64>) -> Result<bool> {
        if key.len() > MAX_KEY_LEN {
            return Err(EddyError::KeyTooLong(key.len(), MAX_KEY_LEN));
        }
        let seed = self.index.seed();
        let epoch = self.index.epoch();
        let keyhash = hash::hash_key(key, seed);

        let mut txn = self.index.begin(0)?;
        let mut cursor = txn.find(DB_KEYS, keyhash)?;
        loop {
            if !cursor.matched {
                txn.close();
                return Ok(false);
            }
            let entry: KeyEntry = *bytemuck::from_bytes(
                txn.entry_bytes(DB_KEYS, &cursor).expect("matched cursor has an entry"),
            );
            if entry.hash != keyhash {
                txn.close();
                return Ok(false);
            }
            if self.object_key_equals(entry.block_no, key)? {
                let mut updated = entry;
                updated.expiry = time::expiry_at(epoch, ttl, time::now_unix());
                txn.delete(DB_KEYS, &cursor)?;
                let insert_cursor = txn.find(DB_KEYS, keyhash)?;
                txn.insert(DB_KEYS, &insert_cursor, bytemuck::bytes_of(&updated))?;
                txn.commit(0)?;
                return Ok(true);
            }
            if !txn.advance(DB_KEYS, &mut cursor) {
                txn.close();
                return Ok(false);
            }
        }
    }

    /// Walk every live key entry in hash order. Within a leaf's overflow
    /// chain this just follows `next`; once that's exhausted it re-descends
    /// from the leaf's upper key bound, since [`crate::btree::tree::Tree`]
    /// doesn't itself track parent links for ascent (see that module's
    /// iteration note).
    pub fn iterate(&self) -> Result<Iter<'_>> {
        let mut txn = self.index.begin(flags::RDONLY)?;
        let root = txn.root(DB_KEYS);
        if root == crate::page::NONE {
            return Ok(Iter {
                txn,
                leaf: crate::page::NONE,
                index: 0,
                kmax: 0,
                done: true,
            });
        }
        let cursor = txn.find(DB_KEYS, 0)?;
        Ok(Iter {
            txn,
            leaf: cursor.leaf,
            index: cursor.index,
            kmax: cursor.kmax,
            done: false,
        })
    }

    fn next_candidate_pos(&self, txn: &mut crate::txn::Txn<'_>, pos: u64) -> Result<u64> {
        let cursor = txn.find(DB_BLOCKS, pos)?;
        if cursor.matched {
            let e: BlockEntry =
                *bytemuck::from_bytes(txn.entry_bytes(DB_BLOCKS, &cursor).expect("matched"));
            return Ok(e.block_no + e.block_count as u64);
        }
        if let Some(bytes) = txn.entry_at(DB_BLOCKS, cursor.leaf, cursor.index) {
            let e: BlockEntry = *bytemuck::from_bytes(bytes);
            if e.block_no > pos {
                return Ok(e.block_no);
            }
        }
        Ok(pos + 1)
    }

    fn evict_block(&self, txn: &mut crate::txn::Txn<'_>, be: BlockEntry) -> Result<()> {
        let old_header = self.read_header_at(be.block_no)?;
        let mut kcursor = txn.find(DB_KEYS, old_header.keyhash)?;
        loop {
            if !kcursor.matched {
                break;
            }
            let ke: KeyEntry = *bytemuck::from_bytes(
                txn.entry_bytes(DB_KEYS, &kcursor).expect("matched cursor has an entry"),
            );
            if ke.hash != old_header.keyhash {
                break;
            }
            if ke.block_no == be.block_no {
                txn.delete(DB_KEYS, &kcursor)?;
                break;
            }
            if !txn.advance(DB_KEYS, &mut kcursor) {
                break;
            }
        }
        let bcursor = txn.find(DB_BLOCKS, be.block_no)?;
        if bcursor.matched {
            txn.delete(DB_BLOCKS, &bcursor)?;
        }
        Ok(())
    }

    /// Evict every block-tree entry whose footprint overlaps
    /// `[pos, pos+block_count)`, including one that starts before `pos` but
    /// extends into it.
    fn evict_overlap(&self, txn: &mut crate::txn::Txn<'_>, pos: u64, block_count: u64) -> Result<()> {
        let mut cursor = txn.find(DB_BLOCKS, pos)?;
        if cursor.index > 0 {
            if let Some(bytes) = txn.entry_at(DB_BLOCKS, cursor.leaf, cursor.index - 1) {
                let be: BlockEntry = *bytemuck::from_bytes(bytes);
                if be.block_no + be.block_count as u64 > pos {
                    self.evict_block(txn, be)?;
                    cursor = txn.find(DB_BLOCKS, pos)?;
                }
            }
        }
        loop {
            let Some(bytes) = txn.entry_at(DB_BLOCKS, cursor.leaf, cursor.index) else {
                break;
            };
            let be: BlockEntry = *bytemuck::from_bytes(bytes);
            if be.block_no >= pos + block_count {
                break;
            }
            self.evict_block(txn, be)?;
            cursor = txn.find(DB_BLOCKS, pos)?;
        }
        Ok(())
    }

    /// Drop any existing entry with the same hash *and* identical key bytes
    /// (a direct overwrite of the same key, rather than an overlap
    /// eviction).
    fn evict_same_key(&self, txn: &mut crate::txn::Txn<'_>, keyhash: u64, key: &[u8]) -> Result<()> {
        let mut cursor = txn.find(DB_KEYS, keyhash)?;
        loop {
            if !cursor.matched {
                return Ok(());
            }
            let ke: KeyEntry = *bytemuck::from_bytes(
                txn.entry_bytes(DB_KEYS, &cursor).expect("matched cursor has an entry"),
            );
            if ke.hash != keyhash {
                return Ok(());
            }
            if self.object_key_equals(ke.block_no, key)? {
                let bcursor = txn.find(DB_BLOCKS, ke.block_no)?;
                if bcursor.matched {
                    txn.delete(DB_BLOCKS, &bcursor)?;
                }
                txn.delete(DB_KEYS, &cursor)?;
                return Ok(());
            }
            if !txn.advance(DB_KEYS, &mut cursor) {
                return Ok(());
            }
        }
    }
}

/// A live, mapped object returned by [`Cache::get`]. Its slab byte range
/// stays shared-locked for the life of this value; dropping it releases
/// the lock (the testable "lock pairing" property in §8).
pub struct Object {
    mapping: memmap2::MmapRaw,
    header: ObjectHeader,
    range_lock: Arc<ByteRangeLock>,
    file: Arc<File>,
    block_size: u32,
}

impl Object {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        let data_offset = self.data_offset();
        let bytes = self.bytes();
        &bytes[data_offset..data_offset + self.header.datalen as usize]
    }

    pub fn metadata(&self) -> &[u8] {
        let meta_offset = align_up(OBJECT_HEADER_SIZE + self.header.keylen as usize + 1, MAX_ALIGN);
        &self.bytes()[meta_offset..meta_offset + self.header.metalen as usize]
    }

    fn data_offset(&self) -> usize {
        let meta_offset = align_up(OBJECT_HEADER_SIZE + self.header.keylen as usize + 1, MAX_ALIGN);
        let meta_end = meta_offset + self.header.metalen as usize;
        align_up(meta_end, self.block_size as usize)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mapping.as_ptr(), self.mapping.len()) }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // Best effort: nothing left to report a failure to here, and the
        // fcntl range is released by the OS at process exit regardless.
        let _ = self.range_lock.unlock(&self.file, 0);
    }
}

/// A just-reserved, exclusively-locked object awaiting [`Cache::write`].
pub struct Reservation {
    mapping: memmap2::MmapRaw,
    header: ObjectHeader,
    range_lock: Arc<ByteRangeLock>,
    file: Arc<File>,
    data_offset: usize,
    block_no: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let _ = self.range_lock.unlock(&self.file, 0);
    }
}

impl Reservation {
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn block_no(&self) -> u64 {
        self.block_no
    }
}

/// Iterator over every live key entry, in ascending hash order (§4.I
/// `iterate`).
pub struct Iter<'c> {
    txn: crate::txn::Txn<'c>,
    leaf: u32,
    index: usize,
    kmax: u64,
    done: bool,
}

impl Iterator for Iter<'_> {
    type Item = Result<KeyEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let (nkeys, next) = self.txn.leaf_view_info(DB_KEYS, self.leaf);
            if self.index < nkeys as usize {
                let bytes = self
                    .txn
                    .entry_at(DB_KEYS, self.leaf, self.index)
                    .expect("index checked against nkeys");
                let entry: KeyEntry = *bytemuck::from_bytes(bytes);
                self.index += 1;
                return Some(Ok(entry));
            }
            if next != crate::page::NONE {
                self.leaf = next;
                self.index = 0;
                continue;
            }
            if self.kmax == u64::MAX {
                self.done = true;
                return None;
            }
            let root = self.txn.root(DB_KEYS);
            let cursor: Cursor = match crate::btree::tree::Tree::search(
                &self.txn.db(DB_KEYS),
                root,
                self.kmax,
            ) {
                Ok(c) => c,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if cursor.leaf == self.leaf && cursor.index == self.index {
                self.done = true;
                return None;
            }
            self.leaf = cursor.leaf;
            self.index = cursor.index;
            self.kmax = cursor.kmax;
        }
    }
}

/// The object header's own epoch-relative timestamp accessors, for callers
/// that want a UNIX time rather than the raw [`EdTime`].
impl ObjectHeader {
    pub fn ttl(&self, epoch: u64, at: u64) -> Option<i64> {
        time::ttl_at(epoch, self.created_time as EdTime, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::flags;

    fn open_test_cache(dir: &tempfile::TempDir, slab_size: u64) -> Cache {
        let path = dir.path().join("test.index");
        OpenOptions::new(&path)
            .slab_size(slab_size)
            .flags(flags::CREATE)
            .open()
            .unwrap()
    }

    #[test]
    fn reserve_write_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 1 << 20);

        let mut obj = cache.reserve(b"hello", b"meta", 5, None).unwrap();
        cache.write(&mut obj, b"world").unwrap();
        cache.close(obj).unwrap();

        let got = cache.get(b"hello").unwrap().expect("key should be present");
        assert_eq!(got.data(), b"world");
        assert_eq!(got.metadata(), b"meta");
        assert_eq!(got.header().datalen, 5);
    }

    #[test]
    fn get_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 1 << 20);
        assert!(cache.get(b"nope").unwrap().is_none());
    }

    #[test]
    fn reserve_overwrites_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 1 << 20);

        let mut first = cache.reserve(b"k", b"", 3, None).unwrap();
        cache.write(&mut first, b"one").unwrap();
        cache.close(first).unwrap();

        let mut second = cache.reserve(b"k", b"", 3, None).unwrap();
        cache.write(&mut second, b"two").unwrap();
        cache.close(second).unwrap();

        let got = cache.get(b"k").unwrap().expect("key should be present");
        assert_eq!(got.data(), b"two");
    }

    #[test]
    fn update_ttl_changes_expiry_without_touching_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 1 << 20);

        let mut obj = cache.reserve(b"k", b"", 1, Some(3600)).unwrap();
        cache.write(&mut obj, b"x").unwrap();
        cache.close(obj).unwrap();

        assert!(cache.update_ttl(b"k", Some(7200)).unwrap());
        let got = cache.get(b"k").unwrap().expect("key should still be present");
        assert_eq!(got.data(), b"x");
        assert!(!cache.update_ttl(b"missing", Some(1)).unwrap());
    }

    #[test]
    fn iterate_sees_every_reserved_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 1 << 20);

        for i in 0u8..8 {
            let key = [b'k', i];
            let mut obj = cache.reserve(&key, b"", 1, None).unwrap();
            cache.write(&mut obj, b"x").unwrap();
            cache.close(obj).unwrap();
        }

        let entries: Vec<_> = cache.iterate().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries.len(), 8);
    }

    #[test]
    fn object_too_large_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_test_cache(&dir, 64 * 1024);
        let err = cache.reserve(b"k", b"", 10 * 1024 * 1024, None).unwrap_err();
        assert!(matches!(err, EddyError::ObjectTooLarge(_, _)));
    }

    #[test]
    fn compute_footprint_places_data_on_a_block_boundary() {
        let fp = compute_footprint(5, 4, 100, 4096);
        assert_eq!(fp.data_offset % 4096, 0);
        assert!(fp.meta_offset >= OBJECT_HEADER_SIZE + 5 + 1);
    }
}
