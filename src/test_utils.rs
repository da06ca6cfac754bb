use crate::clock::{LeaseClock, Timestamp};
use crate::leases::LeaseRecord;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Hand-driven wall clock for simulating elapsed time between instances.
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualTime {
    micros: Arc<AtomicI64>,
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTime {
    /// Starts at 2024-01-01T00:00:00Z
    pub fn new() -> Self {
        Self::starting_at(1_704_067_200_000_000)
    }

    pub fn starting_at(micros: i64) -> Self {
        Self {
            micros: Arc::new(AtomicI64::new(micros)),
        }
    }

    pub fn now(&self) -> Timestamp {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn set(&self, ts: Timestamp) {
        self.micros.store(ts.timestamp_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// A lease clock reading this time
    pub fn clock(&self) -> Arc<LeaseClock> {
        let time = self.clone();
        Arc::new(LeaseClock::new_with_clock(Box::new(move || time.now())))
    }
}

/// Write a lease file directly, as another instance would
pub fn plant_lease(lock_path: &Path, record: &LeaseRecord) {
    let body = serde_json::to_vec_pretty(record).unwrap_or_default();
    plant_raw(lock_path, body);
}

/// Write arbitrary bytes as a lease file
pub fn plant_raw(lock_path: &Path, body: impl AsRef<[u8]>) {
    if let Some(parent) = lock_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(lock_path, body) {
        panic!("failed to plant lease at {}: {}", lock_path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_is_shared() {
        let time = ManualTime::new();
        let clock = time.clock();
        let before = clock.now();
        time.clone().advance(Duration::from_secs(90));
        assert_eq!((clock.now() - before).num_seconds(), 90);
    }
}
