//! Keyed hashing and checksums.
//!
//! The teacher already reaches for `xxhash-rust`'s `xxh3` to checksum the
//! root page (`src/lib.rs`'s `RootData::store`/`load`); this module reuses
//! the same crate, seeded per-index, to hash object keys for the keys
//! b+tree, and adds `crc32c` for the optional metadata/data checksums
//! (`flags::CHECKSUM`) the way `lib/hash.c`'s `ed_crc32c` does.

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash a key with the index's seed (stored in the header at create time).
pub fn hash_key(key: &[u8], seed: u64) -> u64 {
    xxh3_64_with_seed(key, seed)
}

/// Checksum a root page's bytes (header + tree roots) for the xxHash tail
/// eddy appends, matching the teacher's `RootData::store`.
pub fn xxh3(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// CRC-32c over a byte slice, resuming from a prior checksum or `0`.
pub fn crc32c(prev: u32, data: &[u8]) -> u32 {
    if prev == 0 {
        crc32c::crc32c(data)
    } else {
        crc32c::crc32c_append(prev, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_seed_dependent() {
        let a = hash_key(b"hello", 1);
        let b = hash_key(b"hello", 2);
        assert_ne!(a, b);
        assert_eq!(a, hash_key(b"hello", 1));
    }

    #[test]
    fn crc_matches_oneshot() {
        let data = b"the quick brown fox";
        let one_shot = crc32c::crc32c(data);
        let (a, b) = data.split_at(7);
        let incremental = crc32c(crc32c(0, a), b);
        assert_eq!(one_shot, incremental);
    }
}
