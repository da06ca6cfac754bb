// Wall clock for lease timestamps
//
// Lease files are compared across machines, so every timestamp is UTC wall
// time. Timestamps written by one clock are strictly increasing even when the
// system clock stalls or steps backwards, the same guarantee a hybrid logical
// clock gives through its logical counter.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

type TimeSource = Box<dyn Fn() -> Timestamp + Send + Sync>;

/// Source of lease timestamps
pub struct LeaseClock {
    source: TimeSource,
    /// Last stamp handed out, in microseconds since the Unix epoch
    last_stamp_us: AtomicI64,
}

impl LeaseClock {
    /// Clock backed by the system wall clock
    pub fn new() -> Self {
        Self::new_with_clock(Box::new(Utc::now))
    }

    /// Clock backed by a custom time source (used to simulate elapsed time)
    pub fn new_with_clock(source: TimeSource) -> Self {
        Self {
            source,
            last_stamp_us: AtomicI64::new(i64::MIN),
        }
    }

    /// Current time, as reported by the source
    pub fn now(&self) -> Timestamp {
        (self.source)()
    }

    /// Timestamp for a lease write, strictly later than any previous stamp
    pub fn stamp(&self) -> Timestamp {
        let now_us = self.now().timestamp_micros();
        let previous = self
            .last_stamp_us
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_us.max(last.saturating_add(1)))
            })
            .unwrap_or(now_us);
        let issued = now_us.max(previous.saturating_add(1));
        DateTime::from_timestamp_micros(issued).unwrap_or_else(|| self.now())
    }
}

impl Default for LeaseClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LeaseClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseClock")
            .field("last_stamp_us", &self.last_stamp_us.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Render a timestamp the way lease files store it
pub fn format_iso(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_iso(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_stamps_are_strictly_increasing() {
        let fixed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = LeaseClock::new_with_clock(Box::new(move || fixed));

        let first = clock.stamp();
        let second = clock.stamp();
        let third = clock.stamp();

        assert_eq!(first, fixed);
        assert!(second > first);
        assert!(third > second);
        // now() is not bumped, only stamps are
        assert_eq!(clock.now(), fixed);
    }

    #[test]
    fn test_stamp_survives_clock_stepping_back() {
        let micros = Arc::new(AtomicI64::new(1_700_000_000_000_000));
        let source = micros.clone();
        let clock = LeaseClock::new_with_clock(Box::new(move || {
            DateTime::from_timestamp_micros(source.load(Ordering::SeqCst)).unwrap()
        }));

        let before = clock.stamp();
        micros.fetch_sub(5_000_000, Ordering::SeqCst);
        let after = clock.stamp();
        assert!(after > before);
    }

    #[test]
    fn test_iso_round_trip_and_naive_input() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        assert_eq!(parse_iso(&format_iso(&ts)), Some(ts));
        assert_eq!(parse_iso("2024-05-01T12:30:15"), Some(ts));
        assert_eq!(parse_iso("2024-05-01T14:30:15+02:00"), Some(ts));
        assert_eq!(parse_iso("yesterday"), None);
    }
}
