//! Component C — the connection table.
//!
//! Grounded on `examples/original_source/lib/eddy-private.h`'s `EdConn` and
//! `lib/idx.c`'s slot-claim scan: a flexible array of per-process slots
//! living right after the index header, each claimed by an exclusive
//! byte-range file lock over that slot's bytes.

use bytemuck::{Pod, Zeroable};

use crate::lock::{self, ByteRangeLock, Mode};
use crate::error::{EddyError, Result};

/// Maximum pending allocations a single slot can track before commit,
/// matching the reference's `pending[11]`.
pub const PENDING_MAX: usize = 11;

/// A writer won't consider a reader "possibly still reading" a GC list once
/// its xid falls this far behind the current one.
pub const XID_STALE_WINDOW: u64 = 16;

/// Heartbeat age (seconds) past which a slot is considered abandonable,
/// subject to also satisfying the xid staleness test.
pub const HEARTBEAT_STALE_SECS: u64 = 10;

/// On-disk connection slot, `{pid, heartbeat_time, active_xid, npending,
/// pending[11]}`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ConnSlot {
    pub pid: u32,
    pub heartbeat_time: u64,
    pub active_xid: u64,
    pub npending: u32,
    pub pending: [u32; PENDING_MAX],
}

impl ConnSlot {
    pub const EMPTY: ConnSlot = ConnSlot {
        pid: 0,
        heartbeat_time: 0,
        active_xid: 0,
        npending: 0,
        pending: [crate::page::NONE; PENDING_MAX],
    };

    pub fn is_unused(&self) -> bool {
        self.pid == 0
    }

    /// Whether this slot's reader cannot possibly still be mid-read given
    /// the writer's current `xmin`.
    pub fn is_reclaimable(&self, xmin: u64) -> bool {
        self.is_unused() || (self.active_xid != 0 && self.active_xid < xmin)
    }

    pub fn pending_slice(&self) -> &[u32] {
        &self.pending[..self.npending as usize]
    }

    pub fn push_pending(&mut self, page: u32) -> Result<()> {
        if self.npending as usize >= PENDING_MAX {
            return Err(EddyError::Invariant("connection pending list full"));
        }
        self.pending[self.npending as usize] = page;
        self.npending += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = ConnSlot::EMPTY;
    }
}

/// Byte offset and length of slot `index` within the index file, counting
/// from the start of the connection-table region.
pub fn slot_byte_range(base_offset: u64, index: usize) -> (u64, u64) {
    let size = std::mem::size_of::<ConnSlot>() as u64;
    (base_offset + index as u64 * size, size)
}

/// A claimed connection slot: an index into the table plus the file lock
/// that proves ownership.
pub struct Claim {
    pub index: usize,
    lock: ByteRangeLock,
}

impl Claim {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn release(&self, file: &std::fs::File) -> Result<()> {
        self.lock.unlock(file, lock::flags::NOTLCK)
    }
}

/// Scan `slots` (read under the caller's exclusive open-region lock) for one
/// this process may claim: unused, or whose reader cannot still be mid-read
/// relative to `xmin`. Attempts the byte-range lock non-blocking, since a
/// slot that looks stale but is still held by a live process must be
/// skipped rather than waited on.
pub fn claim_slot(
    file: &std::fs::File,
    slots: &[ConnSlot],
    base_offset: u64,
    xmin: u64,
) -> Result<Claim> {
    for (index, slot) in slots.iter().enumerate() {
        if !slot.is_reclaimable(xmin) {
            continue;
        }
        let (start, len) = slot_byte_range(base_offset, index);
        let lock = ByteRangeLock::new(start, len);
        match lock.lock(file, Mode::Exclusive, lock::flags::NOBLOCK) {
            Ok(()) => return Ok(Claim { index, lock }),
            Err(e) if e.would_block() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(EddyError::NoSlot)
}

/// Detect slots whose holder is provably gone: heartbeat older than
/// [`HEARTBEAT_STALE_SECS`] *and* xid older than `xmin`. Returns the page
/// numbers from `pending[]` to be returned to the free list, having zeroed
/// the slot in `slots` in place. Caller must hold the slot's exclusive file
/// lock (proven by a successful non-blocking attempt) before calling this.
pub fn reclaim_if_stale(
    slot: &mut ConnSlot,
    now: u64,
    xmin: u64,
) -> Option<[u32; PENDING_MAX]> {
    if slot.is_unused() {
        return None;
    }
    let heartbeat_stale = now.saturating_sub(slot.heartbeat_time) > HEARTBEAT_STALE_SECS;
    let xid_stale = slot.active_xid == 0 || slot.active_xid < xmin;
    if !(heartbeat_stale && xid_stale) {
        return None;
    }
    let mut pending = [crate::page::NONE; PENDING_MAX];
    pending[..slot.npending as usize].copy_from_slice(slot.pending_slice());
    log::warn!(
        "reclaiming stale connection slot pid={} xid={} npending={}",
        slot.pid,
        slot.active_xid,
        slot.npending
    );
    slot.clear();
    Some(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_slot_is_reclaimable() {
        let slot = ConnSlot::EMPTY;
        assert!(slot.is_reclaimable(1000));
    }

    #[test]
    fn active_reader_within_window_is_not_reclaimable() {
        let mut slot = ConnSlot::EMPTY;
        slot.pid = 42;
        slot.active_xid = 50;
        assert!(!slot.is_reclaimable(10));
    }

    #[test]
    fn pending_push_and_clear() {
        let mut slot = ConnSlot::EMPTY;
        slot.pid = 1;
        for i in 0..PENDING_MAX as u32 {
            slot.push_pending(i).unwrap();
        }
        assert!(slot.push_pending(99).is_err());
        assert_eq!(slot.pending_slice().len(), PENDING_MAX);
        slot.clear();
        assert!(slot.is_unused());
        assert_eq!(slot.npending, 0);
    }

    #[test]
    fn stale_detection_requires_both_conditions() {
        let mut slot = ConnSlot::EMPTY;
        slot.pid = 7;
        slot.heartbeat_time = 0;
        slot.active_xid = 5;
        // heartbeat stale, but xid still within window relative to xmin
        assert!(reclaim_if_stale(&mut slot, 100, 1).is_none());
        // both stale
        let reclaimed = reclaim_if_stale(&mut slot, 100, 10);
        assert!(reclaimed.is_some());
        assert!(slot.is_unused());
    }
}
