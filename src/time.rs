//! Internal time representation.
//!
//! Grounded on `lib/time.c` in `examples/original_source`: the index
//! stores times as a 32-bit offset from a per-index epoch (`EdTime`) rather
//! than raw UNIX timestamps, so expiries stay representable for the life
//! of the index regardless of when it was created.

use std::time::{SystemTime, UNIX_EPOCH};

/// An expiry/creation timestamp, stored as seconds since the index's epoch.
pub type EdTime = u32;

/// Sentinel meaning "never expires".
pub const TIME_INF: EdTime = u32::MAX;
/// Sentinel meaning "already deleted".
pub const TIME_DELETE: EdTime = 0;
/// Largest representable non-infinite time.
pub const TIME_MAX: EdTime = u32::MAX - 1;

/// Current UNIX time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert a UNIX timestamp to the index's internal epoch-relative time.
pub fn from_unix(epoch: u64, at: u64) -> EdTime {
    at.saturating_sub(epoch).min(TIME_MAX as u64) as EdTime
}

/// Convert an internal time back to a UNIX timestamp.
pub fn to_unix(epoch: u64, at: EdTime) -> u64 {
    epoch + at as u64
}

/// Compute the expiry for a given time-to-live (`None` = infinite) measured
/// from `at`.
pub fn expiry_at(epoch: u64, ttl: Option<u64>, at: u64) -> EdTime {
    match ttl {
        None => TIME_INF,
        Some(ttl) => from_unix(epoch, at.saturating_add(ttl)),
    }
}

/// Remaining time-to-live in seconds for an expiry, measured from `at`.
/// `None` means infinite.
pub fn ttl_at(epoch: u64, exp: EdTime, at: u64) -> Option<i64> {
    if exp == TIME_INF {
        return None;
    }
    let exp_unix = to_unix(epoch, exp);
    Some(exp_unix as i64 - at as i64)
}

/// Whether `exp` has passed as of `at`.
pub fn expired_at(epoch: u64, exp: EdTime, at: u64) -> bool {
    if exp == TIME_INF {
        return false;
    }
    to_unix(epoch, exp) <= at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let epoch = 1_700_000_000u64;
        let at = epoch + 500;
        let exp = expiry_at(epoch, Some(100), at);
        assert!(!expired_at(epoch, exp, at + 99));
        assert!(expired_at(epoch, exp, at + 100));
        assert_eq!(ttl_at(epoch, exp, at), Some(100));
    }

    #[test]
    fn infinite_ttl_never_expires() {
        let epoch = 1_700_000_000u64;
        let exp = expiry_at(epoch, None, epoch);
        assert_eq!(exp, TIME_INF);
        assert!(!expired_at(epoch, exp, u64::MAX));
        assert_eq!(ttl_at(epoch, exp, epoch), None);
    }
}
