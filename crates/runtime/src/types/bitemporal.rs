//! Bitemporal validity intervals.
//!
//! Every persisted node and relationship carries two time dimensions:
//! `vt_*` (validity in the world) and `tt_*` (transaction time in the
//! system), all in epoch milliseconds. Corrections never overwrite a row;
//! they close the open transaction interval and append a new version.

use serde::{Deserialize, Serialize};

/// Sentinel for an unclosed interval end: the last millisecond of year 9999.
pub const OPEN_END_MS: i64 = 253_402_300_799_000;

/// The four-timestamp validity quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitemporal {
    pub vt_start: i64,
    pub vt_end: i64,
    pub tt_start: i64,
    pub tt_end: i64,
}

impl Bitemporal {
    /// A version valid from `now` with both intervals open.
    pub fn open_at(now: i64) -> Self {
        Self {
            vt_start: now,
            vt_end: OPEN_END_MS,
            tt_start: now,
            tt_end: OPEN_END_MS,
        }
    }

    /// Whether this version is visible "as of" wall-clock time `t`.
    pub fn as_of(&self, t: i64) -> bool {
        self.vt_start <= t && t < self.vt_end && self.tt_start <= t && t < self.tt_end
    }

    /// Whether the transaction interval is still open.
    pub fn is_open(&self) -> bool {
        self.tt_end == OPEN_END_MS
    }

    /// Close the transaction interval, retiring this version at `now`.
    pub fn close_tt(&mut self, now: i64) {
        self.tt_end = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_version_is_visible_now_and_later() {
        let b = Bitemporal::open_at(1_000);
        assert!(b.as_of(1_000));
        assert!(b.as_of(999_999));
        assert!(!b.as_of(999));
    }

    #[test]
    fn closed_version_is_invisible_after_close() {
        let mut b = Bitemporal::open_at(1_000);
        b.close_tt(2_000);
        assert!(!b.is_open());
        assert!(b.as_of(1_500));
        assert!(!b.as_of(2_000));
    }

    #[test]
    fn sentinel_is_end_of_9999() {
        let dt = chrono::DateTime::from_timestamp_millis(OPEN_END_MS).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "9999-12-31");
    }
}
