//! Component A — file-backed page pool.
//!
//! Grounded on `examples/original_source/lib/pg.c`'s `ed_pg_map`/`ed_pg_unmap`/
//! `ed_pg_load`/`ed_pg_unload`, reshaped into RAII types the way the teacher
//! wraps raw mappings in `storage.rs`'s `StorageInner` (one `MmapRaw` per
//! mapped range, never one giant mapping sliced up — each allocation truly
//! is its own `mmap()` call, matching the reference implementation).

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use memmap2::MmapRaw;

use crate::error::{EddyError, Result};

/// Sentinel page number meaning "no page" (`ED_PG_NONE`).
pub const NONE: u32 = u32::MAX;
/// Largest usable page number.
pub const MAX: u32 = u32::MAX - 1;

/// Every page on disk begins with this header.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Zeroable, bytemuck::Pod, PartialEq, Eq)]
pub struct PageHeader {
    pub page_number: u32,
    pub page_type: u32,
}

pub const BRANCH: u32 = u32::from_be_bytes(*b"BRCH");
pub const LEAF: u32 = u32::from_be_bytes(*b"LEAF");
pub const OVERFLOW: u32 = u32::from_be_bytes(*b"OVFL");
pub const GC: u32 = u32::from_be_bytes(*b"GC\0\0");
pub const FREE_HEAD: u32 = u32::from_be_bytes(*b"FRHD");
pub const FREE_CHILD: u32 = u32::from_be_bytes(*b"FRCH");
pub const INDEX: u32 = u32::from_be_bytes(*b"EDIX");

/// A live mapping of `count` contiguous pages, unmapped on drop.
///
/// Holds the page number it was mapped at so the debug tracker (see
/// [`DEBUG_TRACKER`]) can match the unmap against the map.
pub struct Mapping {
    map: MmapRaw,
    page_no: u32,
    count: u32,
}

impl Mapping {
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), self.map.len()) }
    }

    /// # Safety
    /// The caller must not produce aliasing mutable references; callers are
    /// expected to hold the index's write lock when mutating.
    pub unsafe fn as_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.map.len())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(EddyError::Sync)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if std::env::var_os("EDDY_MMAP_DEBUG").is_some() {
            untrack(self.map.as_ptr() as usize);
        }
    }
}

/// Map `count` pages starting at `page_no` from `fd`, of `page_size` bytes
/// each.
pub fn map(fd: &File, page_no: u32, count: u32, page_size: usize) -> Result<Mapping> {
    if page_no == NONE {
        return Err(EddyError::InvalidAccess {
            offset: NONE as usize,
            len: count as usize,
        });
    }
    let len = count as usize * page_size;
    let map = MmapRaw::map_raw_with_offset(fd, page_no as u64 * page_size as u64, len).map_err(
        |e| EddyError::AllocFailed {
            requested: len,
            source: e,
        },
    )?;
    if std::env::var_os("EDDY_MMAP_DEBUG").is_some() {
        track(page_no, map.as_ptr() as usize, count);
    }
    Ok(Mapping {
        map,
        page_no,
        count,
    })
}

/// A single-page mapping slot that only remaps when the requested page
/// number differs from the one already cached, mirroring `ed_pg_load`.
#[derive(Default)]
pub struct LoadSlot {
    current: Option<Mapping>,
}

impl LoadSlot {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Load `page_no`, reusing the cached mapping if it's already loaded.
    pub fn load(&mut self, fd: &File, page_no: u32, page_size: usize) -> Result<Option<&Mapping>> {
        let needs_remap = match &self.current {
            Some(m) if m.page_no == page_no => false,
            _ => true,
        };
        if needs_remap {
            self.current = None;
            if page_no != NONE {
                self.current = Some(map(fd, page_no, 1, page_size)?);
            }
        }
        Ok(self.current.as_ref())
    }

    /// Drop the cached mapping, unmapping it immediately.
    pub fn unload(&mut self) {
        self.current = None;
    }
}

// --- Debug leak tracker (component A's "debug variant"), grounded on
// `examples/original_source/lib/pgtrack.cc`. Gated on an environment
// variable rather than a cargo feature + global so tests can toggle it
// per-process without recompiling.

static TRACKED: Mutex<Option<std::collections::BTreeMap<usize, (u32, u32)>>> = Mutex::new(None);

fn track(page_no: u32, addr: usize, count: u32) {
    let mut guard = TRACKED.lock().unwrap();
    let map = guard.get_or_insert_with(Default::default);
    map.insert(addr, (page_no, count));
}

fn untrack(addr: usize) {
    let mut guard = TRACKED.lock().unwrap();
    if let Some(map) = guard.as_mut() {
        if map.remove(&addr).is_none() {
            log::warn!("unmap of untracked mapping at {addr:#x}");
        }
    }
}

/// Returns the number of mappings the debug tracker believes are still
/// live. Intended for tests that want to assert no page mappings leaked.
pub fn debug_leak_count() -> usize {
    TRACKED
        .lock()
        .unwrap()
        .as_ref()
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Reset the debug tracker. Tests should call this between cases.
pub fn debug_reset() {
    *TRACKED.lock().unwrap() = None;
}

pub(crate) trait MmapRawExt {
    fn map_raw_with_offset(file: &File, offset: u64, len: usize) -> std::io::Result<MmapRaw>;
}

impl MmapRawExt for MmapRaw {
    fn map_raw_with_offset(file: &File, offset: u64, len: usize) -> std::io::Result<MmapRaw> {
        let _ = file.as_raw_fd();
        memmap2::MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
    }
}
