use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EddyError>;

/// Header/slab verification failures, raised while opening an index.
///
/// These mirror the `INDEX_*`/`SLAB_*` condition codes from the reference
/// implementation's error taxonomy, kept here as a nested enum rather than
/// bit-packed integers.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum FormatError {
    #[error("index header magic bytes did not match")]
    Magic,
    #[error("index header endian mark did not match the host")]
    Endian,
    #[error("index header byte mark was not 0xfc")]
    Mark,
    #[error("index header version is not supported")]
    Version,
    #[error("index file size was not a multiple of the page size")]
    FileSize,
    #[error("index header's saved flags do not match the requested open flags")]
    Flags,
    #[error("index header's saved page size does not match the host page size")]
    PageSize,
    #[error("index header's allocation batch size does not match")]
    AllocCount,
    #[error("index header's slab inode does not match the opened slab file")]
    Inode,
    #[error("slab file was not a regular file or block device")]
    SlabMode,
    #[error("slab file size was not a multiple of the block size")]
    SlabSize,
    #[error("slab file's block count does not match the index header")]
    SlabBlockCount,
    #[error("root page xxHash checksum did not match its contents")]
    Checksum,
    #[error("both copies of the root failed validation, or both had the same id")]
    DuplicateIds,
}

/// The full error surface of the crate.
///
/// Variants are grouped the way `spec.md` §6 groups its error taxonomy
/// (`SYS`, `CONFIG`, `INDEX`, `KEY`, `SLAB`), even though, unlike the C
/// library this was distilled from, each variant here carries its own
/// payload instead of a packed integer code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EddyError {
    /// Opening, creating, or resizing a backing file failed.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// A blocking lock acquisition was refused because another holder
    /// already owns it and `NOBLOCK` was requested (§7 tier 1, `AGAIN`).
    #[error("operation would block acquiring a lock")]
    WouldBlock,
    /// Acquiring an advisory file lock failed for a reason other than
    /// contention.
    #[error("failed to lock the backing file")]
    Lock(#[source] std::io::Error),
    /// Flushing dirty pages to the backing file failed.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    #[error("can't resize the backing file: have {size:#x} bytes, wanted {requested:#x}")]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    #[error("memory map allocation of {requested:#x} bytes failed")]
    AllocFailed {
        requested: usize,
        source: std::io::Error,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    /// No connection slot was available: every slot is claimed by a live
    /// process (§4.C).
    #[error("no connection slot available")]
    NoSlot,
    /// A process is using an index handle it inherited across a `fork()`.
    #[error("index handle used from a forked process")]
    Forked,
    /// Write attempted on a read-only transaction (`INDEX_RDONLY`).
    #[error("write attempted on a read-only transaction")]
    ReadOnly,
    /// B+tree depth exceeded the static cap (`INDEX_DEPTH`).
    #[error("b+tree depth exceeded the maximum of {0}")]
    DepthExceeded(u8),
    /// `Cursor::set` was called with an entry whose key didn't match the
    /// cursor's search key (`INDEX_KEY_MATCH`).
    #[error("entry key does not match the cursor's search key")]
    KeyMismatch,
    /// A transaction method was called after `commit`/`close`.
    #[error("transaction is already closed")]
    TxnClosed,
    /// Allocator ran out of pre-drawn scratch pages mid-transaction; the
    /// transaction is aborted without publishing (§4.G step 2).
    #[error("transaction ran out of pre-allocated pages")]
    OutOfPages,
    /// A key was too long to store.
    #[error("key length {0} exceeds the maximum of {1}")]
    KeyTooLong(usize, usize),
    /// An object's slab footprint doesn't fit in the slab at all
    /// (`SLAB_BLOCK_COUNT`-adjacent: the object itself is oversized).
    #[error("object footprint of {0} blocks exceeds the slab's block count of {1}")]
    ObjectTooLarge(u64, u64),
    /// Generic data corruption detected while validating a mapped page.
    #[error("page data corruption detected at page {0}")]
    Corruption(u32),
    /// An out-of-range page or block access was attempted.
    #[error("invalid access at offset {offset:#x} with length {len:#x}")]
    InvalidAccess { offset: usize, len: usize },
    /// A CRC-32c or xxHash check failed.
    #[error("checksum mismatch for region of length {0}")]
    ChecksumMismatch(usize),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    /// Internal invariant violation; should never surface to a well-behaved
    /// caller.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

impl EddyError {
    /// Returns `true` if this is the lock-contention condition a caller
    /// using `NOBLOCK` should retry (§7 tier 1).
    pub fn would_block(&self) -> bool {
        matches!(self, EddyError::WouldBlock)
    }
}

impl From<std::io::Error> for EddyError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            EddyError::WouldBlock
        } else {
            EddyError::Open(e)
        }
    }
}
