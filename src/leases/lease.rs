// Lease record persisted next to a guarded resource

use crate::clock::{format_iso, parse_iso, Timestamp};
use crate::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Grace period for the shared database lease (60 seconds)
pub const DB_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Grace period for per-file leases (5 minutes)
pub const FILE_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Expected duration of a database operation when the caller has no estimate
pub const DEFAULT_DB_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Expected duration of a file edit when the caller has no estimate
pub const DEFAULT_FILE_LEASE_DURATION: Duration = Duration::from_secs(300);

/// Claim on one shared resource, stored as `<resource>.lock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Opaque id of the owning instance
    #[serde(rename = "holder_device_id")]
    pub holder_id: String,

    /// Human readable name of the owning instance
    #[serde(rename = "holder_nickname", default)]
    pub holder_label: String,

    /// When the current holder first created the lease
    #[serde(rename = "start_time_iso", default, with = "iso_time")]
    pub start_time: Option<Timestamp>,

    /// Holder's estimate of the operation length.
    /// `None` when the file did not carry a usable value.
    #[serde(default, with = "whole_seconds")]
    pub expected_duration_seconds: Option<u64>,

    /// What the holder is doing
    #[serde(rename = "operation_description", default)]
    pub operation_label: String,

    /// Last liveness refresh. `None` when missing or unparsable.
    #[serde(rename = "heartbeat_time_iso", default, with = "iso_time")]
    pub heartbeat_time: Option<Timestamp>,
}

impl LeaseRecord {
    /// Create a fresh lease for `holder`
    pub fn new(
        holder: &DeviceIdentity,
        now: Timestamp,
        expected_duration_seconds: u64,
        operation_label: impl Into<String>,
    ) -> Self {
        Self {
            holder_id: holder.device_id.clone(),
            holder_label: holder.nickname.clone(),
            start_time: Some(now),
            expected_duration_seconds: Some(expected_duration_seconds),
            operation_label: operation_label.into(),
            heartbeat_time: Some(now),
        }
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }

    /// Instant after which the lease is stale.
    ///
    /// A record without a usable duration falls back to `fallback_duration`.
    /// `None` when the heartbeat is unknown, or the duration is unknown and
    /// there is no fallback; such a lease is always stale.
    pub fn expires_at(
        &self,
        grace_period: Duration,
        fallback_duration: Option<Duration>,
    ) -> Option<Timestamp> {
        let heartbeat = self.heartbeat_time?;
        let expected = self
            .expected_duration_seconds
            .or_else(|| fallback_duration.map(|d| d.as_secs()))?;
        let window = i64::try_from(expected)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .zip(chrono::Duration::from_std(grace_period).ok())
            .and_then(|(expected, grace)| expected.checked_add(&grace));

        match window.and_then(|w| heartbeat.checked_add_signed(w)) {
            Some(expiry) => Some(expiry),
            // Windows too large to represent never run out
            None => Some(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Stale iff `now > heartbeat + expected duration + grace period`
    pub fn is_stale_at(
        &self,
        now: Timestamp,
        grace_period: Duration,
        fallback_duration: Option<Duration>,
    ) -> bool {
        match self.expires_at(grace_period, fallback_duration) {
            Some(expiry) => now > expiry,
            None => true,
        }
    }

    /// Time left before the lease goes stale
    pub fn time_remaining(
        &self,
        now: Timestamp,
        grace_period: Duration,
        fallback_duration: Option<Duration>,
    ) -> Option<Duration> {
        let expiry = self.expires_at(grace_period, fallback_duration)?;
        if now >= expiry {
            None
        } else {
            (expiry - now).to_std().ok()
        }
    }

    /// Refresh the liveness timestamp
    pub fn touch(&mut self, now: Timestamp) {
        self.heartbeat_time = Some(now);
    }

    /// Re-confirm a lease the holder already owns
    pub fn reconfirm(
        &mut self,
        now: Timestamp,
        expected_duration_seconds: u64,
        operation_label: &str,
    ) {
        self.touch(now);
        self.expected_duration_seconds = Some(expected_duration_seconds);
        self.operation_label = operation_label.to_string();
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
    }

    /// Holder name for messages, falling back to the id
    pub fn holder_display(&self) -> &str {
        if self.holder_label.trim().is_empty() {
            &self.holder_id
        } else {
            &self.holder_label
        }
    }
}

impl std::fmt::Display for LeaseRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = if self.operation_label.is_empty() {
            "unknown operation"
        } else {
            &self.operation_label
        };
        write!(f, "held by '{}' for '{}'", self.holder_display(), op)?;
        match &self.heartbeat_time {
            Some(ts) => write!(f, " (last heartbeat {})", format_iso(ts)),
            None => write!(f, " (no heartbeat)"),
        }
    }
}

/// Lenient ISO-8601 field: anything that is not a parsable string reads as `None`
mod iso_time {
    use super::{format_iso, parse_iso, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&format_iso(ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(d)?;
        Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(parse_iso))
    }
}

/// Lenient duration field: negative, fractional or non-numeric values read as `None`
mod whole_seconds {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(secs) => s.serialize_u64(*secs),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(d)?;
        Ok(raw.as_ref().and_then(|v| v.as_u64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn holder() -> DeviceIdentity {
        DeviceIdentity::new("dev-1", "Survey Laptop")
    }

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_staleness_boundary() {
        let record = LeaseRecord::new(&holder(), at(0), 30, "Import");
        let grace = Duration::from_secs(60);
        let boundary = at(90);

        assert!(!record.is_stale_at(at(0), grace, None));
        assert!(!record.is_stale_at(boundary, grace, None));
        assert!(record.is_stale_at(boundary + chrono::Duration::microseconds(1), grace, None));
    }

    #[test]
    fn test_missing_heartbeat_is_stale() {
        let mut record = LeaseRecord::new(&holder(), at(0), 30, "Import");
        record.heartbeat_time = None;
        assert!(record.is_stale_at(at(0), DB_GRACE_PERIOD, None));
        // a fallback duration never rescues a missing heartbeat
        assert!(record.is_stale_at(at(0), DB_GRACE_PERIOD, Some(Duration::from_secs(300))));

        let mut record = LeaseRecord::new(&holder(), at(0), 30, "Import");
        record.expected_duration_seconds = None;
        assert!(record.is_stale_at(at(0), DB_GRACE_PERIOD, None));
    }

    #[test]
    fn test_missing_duration_uses_fallback() {
        let mut record = LeaseRecord::new(&holder(), at(0), 30, "Edit");
        record.expected_duration_seconds = None;
        let fallback = Some(DEFAULT_FILE_LEASE_DURATION);

        assert!(!record.is_stale_at(at(5), FILE_GRACE_PERIOD, fallback));
        assert!(!record.is_stale_at(at(600), FILE_GRACE_PERIOD, fallback));
        assert!(record.is_stale_at(at(601), FILE_GRACE_PERIOD, fallback));
        assert_eq!(
            record.time_remaining(at(100), FILE_GRACE_PERIOD, fallback),
            Some(Duration::from_secs(500))
        );
    }

    #[test]
    fn test_huge_duration_never_expires() {
        let record = LeaseRecord::new(&holder(), at(0), u64::MAX, "Forever");
        assert!(!record.is_stale_at(at(10_000_000), FILE_GRACE_PERIOD, None));
    }

    #[test]
    fn test_time_remaining() {
        let record = LeaseRecord::new(&holder(), at(0), 30, "Import");
        let grace = Duration::from_secs(60);
        assert_eq!(record.time_remaining(at(10), grace, None), Some(Duration::from_secs(80)));
        assert_eq!(record.time_remaining(at(90), grace, None), None);
    }

    #[test]
    fn test_reconfirm_updates_in_place() {
        let mut record = LeaseRecord::new(&holder(), at(0), 30, "Import");
        record.reconfirm(at(5), 120, "Export");

        assert_eq!(record.start_time, Some(at(0)));
        assert_eq!(record.heartbeat_time, Some(at(5)));
        assert_eq!(record.expected_duration_seconds, Some(120));
        assert_eq!(record.operation_label, "Export");
    }

    #[test]
    fn test_wire_field_names() {
        let record = LeaseRecord::new(&holder(), at(0), 45, "Import");
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["holder_device_id"], "dev-1");
        assert_eq!(value["holder_nickname"], "Survey Laptop");
        assert_eq!(value["expected_duration_seconds"], 45);
        assert_eq!(value["operation_description"], "Import");
        assert_eq!(value["start_time_iso"], "2023-11-14T22:13:20.000000Z");
        assert_eq!(value["heartbeat_time_iso"], value["start_time_iso"]);
    }

    #[test]
    fn test_lenient_fields() {
        let raw = r#"{
            "holder_device_id": "dev-9",
            "heartbeat_time_iso": "not a time",
            "expected_duration_seconds": -4
        }"#;
        let record: LeaseRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.holder_id, "dev-9");
        assert_eq!(record.holder_label, "");
        assert_eq!(record.heartbeat_time, None);
        assert_eq!(record.expected_duration_seconds, None);
        assert_eq!(record.holder_display(), "dev-9");
    }

    #[test]
    fn test_missing_holder_fails_to_decode() {
        let raw = r#"{"holder_nickname": "ghost"}"#;
        assert!(serde_json::from_str::<LeaseRecord>(raw).is_err());
    }
}
