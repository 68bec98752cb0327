//! Clock abstraction and ISO-8601 helpers.
//!
//! All cache and history code takes time as plain Unix seconds so that
//! negative intervals (clock anomalies) stay representable, and reads the
//! current time through the [`Clock`] trait so tests can drive it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Unix time in seconds.
pub type Timestamp = i64;

/// Source of the current wall-clock time.
pub trait Clock {
    /// The current time, in Unix seconds.
    fn now(&self) -> Timestamp;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            // Pre-epoch system clocks are treated as time zero.
            Err(_) => 0,
        }
    }
}

/// A settable clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Create a clock fixed at `now`.
    pub fn at(now: Timestamp) -> Self {
        Self(AtomicI64::new(now))
    }

    /// Move the clock to an absolute time.
    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::Relaxed);
    }

    /// Advance the clock by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::Relaxed)
    }
}

const ISO_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_iso(ts: Timestamp) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.format(ISO_FORMAT).to_string(),
        None => "1970-01-01 00:00:00".to_string(),
    }
}

/// Parse a `YYYY-MM-DD HH:MM:SS` timestamp. Returns `None` on malformed
/// input.
pub fn parse_iso(s: &str) -> Option<Timestamp> {
    NaiveDateTime::parse_from_str(s.trim(), ISO_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Parse an ISO timestamp, rounding any pre-1970 date to time zero instead
/// of failing. Returns `(timestamp, was_bogus)`; malformed input is `None`.
pub fn parse_possibly_bad_iso(s: &str) -> Option<(Timestamp, bool)> {
    let year: i32 = s.get(..4)?.parse().ok()?;
    if year < 1970 {
        return Some((0, true));
    }
    parse_iso(s).map(|ts| (ts, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_round_trip() {
        let ts = 1_700_000_000;
        let s = format_iso(ts);
        assert_eq!(parse_iso(&s), Some(ts));
    }

    #[test]
    fn iso_epoch() {
        assert_eq!(format_iso(0), "1970-01-01 00:00:00");
        assert_eq!(parse_iso("1970-01-01 00:00:00"), Some(0));
    }

    #[test]
    fn bad_iso_rejected() {
        assert_eq!(parse_iso("not a time"), None);
        assert_eq!(parse_possibly_bad_iso("xxxx-01-01 00:00:00"), None);
    }

    #[test]
    fn pre_epoch_rounds_to_zero() {
        assert_eq!(
            parse_possibly_bad_iso("1969-12-31 23:59:59"),
            Some((0, true))
        );
        assert_eq!(
            parse_possibly_bad_iso("2004-08-04 00:48:22"),
            Some((1091580502, false))
        );
    }

    #[test]
    fn manual_clock() {
        let clock = ManualClock::at(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }
}
