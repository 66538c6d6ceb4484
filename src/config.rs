//! Configuration surface for opening a [`crate::Cache`].
//!
//! Grounded on the teacher's own `OpenOptions` builder in its `lib.rs`:
//! a plain builder struct with setter methods returning `&mut Self`,
//! generalized to cover every key in spec §6's configuration table.

use std::path::{Path, PathBuf};

/// Default number of connection slots if unspecified.
pub const DEFAULT_MAX_CONNS: u16 = 32;
/// Hard cap on connection slots (spec §6).
pub const MAX_CONNS_CAP: u16 = 512;

/// Bit flags recognized by [`OpenOptions`], mirroring the C library's
/// `ED_F*` `#define`s rather than reaching for a `bitflags` dependency the
/// teacher doesn't carry.
pub mod flags {
    /// Create the index/slab if missing.
    pub const CREATE: u32 = 1 << 0;
    /// Reinitialize the index/slab even if a valid one exists.
    pub const REPLACE: u32 = 1 << 1;
    /// Pre-size (and pre-fault) the slab file on create.
    pub const ALLOCATE: u32 = 1 << 2;
    /// Compute CRC-32c over object metadata and data.
    pub const CHECKSUM: u32 = 1 << 3;
    /// Fail fast (`WouldBlock`) on lock contention instead of waiting.
    pub const NOBLOCK: u32 = 1 << 4;
    /// Skip `msync`/`fsync` on commit.
    pub const NOSYNC: u32 = 1 << 5;
    /// Emit progress messages (routed through the `log` facade here,
    /// rather than directly to stderr as the C `ed_verbose` macro does).
    pub const VERBOSE: u32 = 1 << 6;
    /// Open the transaction read-only.
    pub const RDONLY: u32 = 1 << 7;
    /// Don't wait for `msync` to complete before returning from commit.
    pub const ASYNC: u32 = 1 << 8;
    /// Reset and reuse a transaction object instead of dropping it.
    pub const RESET: u32 = 1 << 9;
}

/// Builder for opening or creating an Eddy cache.
///
/// ```no_run
/// use eddy::{Cache, config::{OpenOptions, flags}};
///
/// let cache = OpenOptions::new("/tmp/example.index")
///     .slab_size(64 << 20)
///     .flags(flags::CREATE | flags::CHECKSUM)
///     .open()
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub(crate) index_path: PathBuf,
    pub(crate) slab_path: Option<PathBuf>,
    pub(crate) slab_size: Option<u64>,
    pub(crate) max_conns: u16,
    pub(crate) flags: u32,
}

impl OpenOptions {
    /// Start a new builder for the given index file path.
    pub fn new<P: AsRef<Path>>(index_path: P) -> Self {
        Self {
            index_path: index_path.as_ref().to_path_buf(),
            slab_path: None,
            slab_size: None,
            max_conns: DEFAULT_MAX_CONNS,
            flags: 0,
        }
    }

    /// Override the slab file path. Defaults to `{index_path}-slab`.
    pub fn slab_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.slab_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Desired slab size in bytes. Only consulted on create.
    pub fn slab_size(&mut self, size: u64) -> &mut Self {
        self.slab_size = Some(size);
        self
    }

    /// Number of connection slots, capped at [`MAX_CONNS_CAP`].
    pub fn max_conns(&mut self, n: u16) -> &mut Self {
        self.max_conns = n.min(MAX_CONNS_CAP);
        self
    }

    /// Set the open flags directly (see the [`flags`] module).
    pub fn flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    /// OR additional flags into the current set.
    pub fn add_flags(&mut self, flags: u32) -> &mut Self {
        self.flags |= flags;
        self
    }

    pub(crate) fn resolved_slab_path(&self) -> PathBuf {
        match &self.slab_path {
            Some(p) => p.clone(),
            None => {
                let mut s = self.index_path.clone().into_os_string();
                s.push("-slab");
                PathBuf::from(s)
            }
        }
    }

    /// Open the cache with these options.
    pub fn open(&self) -> crate::Result<crate::Cache> {
        crate::Cache::open(self.clone())
    }
}
