// Per-file leases for a shared output directory
//
// Every file in the directory gets its own `<name>.lock` and its own
// coordinator, so leases on different files never interact.

use super::coordinator::{AcquireOutcome, HeartbeatOutcome, LockCoordinator, ReleaseOutcome};
use super::{FsLeaseStore, LeaseRecord, LeaseStore, DEFAULT_FILE_LEASE_DURATION, FILE_GRACE_PERIOD};
use crate::clock::LeaseClock;
use crate::identity::DeviceIdentity;
use crate::{LockError, Result};
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct FileLockCoordinator {
    dir: PathBuf,
    grace_period: Duration,
    default_duration: Duration,
    identity: DeviceIdentity,
    store: Arc<dyn LeaseStore>,
    clock: Arc<LeaseClock>,
    coordinators: DashMap<String, Arc<LockCoordinator>>,
}

impl FileLockCoordinator {
    /// Coordinator for the files in `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, identity: DeviceIdentity) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            grace_period: FILE_GRACE_PERIOD,
            default_duration: DEFAULT_FILE_LEASE_DURATION,
            identity,
            store: Arc::new(FsLeaseStore::new()),
            clock: Arc::new(LeaseClock::new()),
            coordinators: DashMap::new(),
        })
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self.coordinators.clear();
        self
    }

    /// Duration used when a caller gives none, and assumed for records
    /// that do not carry one
    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self.coordinators.clear();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = store;
        self.coordinators.clear();
        self
    }

    pub fn with_clock(mut self, clock: Arc<LeaseClock>) -> Self {
        self.clock = clock;
        self.coordinators.clear();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// `<dir>/<name>.lock`
    pub fn lock_path(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.dir.join(format!("{}.lock", name)))
    }

    /// The coordinator owning `name`'s lease, tracked until the lease is
    /// released through this coordinator
    pub fn coordinator(&self, name: &str) -> Result<Arc<LockCoordinator>> {
        if let Some(existing) = self.coordinators.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let fresh = self.build(name)?;
        let entry = self.coordinators.entry(name.to_string()).or_insert_with(|| {
            debug!(file = name, path = %fresh.lock_path().display(), "tracking file lease");
            Arc::new(fresh)
        });
        Ok(Arc::clone(entry.value()))
    }

    /// Acquire `name`, using the default duration when none is given
    pub fn acquire(
        &self,
        name: &str,
        expected_duration: Option<Duration>,
        operation: &str,
    ) -> Result<AcquireOutcome> {
        self.coordinator(name)?
            .acquire(expected_duration.unwrap_or(self.default_duration), operation)
    }

    pub fn force_acquire(
        &self,
        name: &str,
        expected_duration: Option<Duration>,
        operation: &str,
    ) -> Result<LeaseRecord> {
        self.coordinator(name)?
            .force_acquire(expected_duration.unwrap_or(self.default_duration), operation)
    }

    pub fn heartbeat(&self, name: &str) -> Result<HeartbeatOutcome> {
        self.lookup(name)?.heartbeat()
    }

    pub fn update(
        &self,
        name: &str,
        expected_duration: Option<Duration>,
        operation: Option<&str>,
    ) -> Result<HeartbeatOutcome> {
        self.lookup(name)?.update(expected_duration, operation)
    }

    /// Release `name` and stop tracking it once the lease is gone
    pub fn release(&self, name: &str) -> Result<ReleaseOutcome> {
        let outcome = self.lookup(name)?.release()?;
        if outcome.is_success() {
            self.coordinators.remove(name);
        }
        Ok(outcome)
    }

    pub fn info(&self, name: &str) -> Result<Option<LeaseRecord>> {
        self.lookup(name)?.info()
    }

    pub fn is_locked(&self, name: &str) -> Result<bool> {
        self.lookup(name)?.is_locked()
    }

    /// Names of the files with a tracked coordinator, sorted
    pub fn tracked_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.coordinators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Tracked coordinator for `name`, or an untracked one for a single call
    fn lookup(&self, name: &str) -> Result<Arc<LockCoordinator>> {
        match self.coordinators.get(name) {
            Some(existing) => Ok(Arc::clone(existing.value())),
            None => Ok(Arc::new(self.build(name)?)),
        }
    }

    fn build(&self, name: &str) -> Result<LockCoordinator> {
        let lock_path = self.lock_path(name)?;
        let coordinator =
            LockCoordinator::new(name, lock_path, self.grace_period, self.identity.clone())
                .with_duration_fallback(Some(self.default_duration))
                .with_store(Arc::clone(&self.store))
                .with_clock(Arc::clone(&self.clock));
        Ok(coordinator)
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LockError::invalid_resource(name, "file name is empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(LockError::invalid_resource(name, "must be a single file name")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::format_iso;
    use crate::test_utils::{plant_raw, ManualTime};
    use tempfile::TempDir;

    fn files(dir: &Path, id: &str, time: &ManualTime) -> FileLockCoordinator {
        FileLockCoordinator::new(dir, DeviceIdentity::new(id, format!("{} laptop", id)))
            .unwrap()
            .with_clock(time.clock())
    }

    #[test]
    fn test_creates_output_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kml").join("out");
        let time = ManualTime::new();
        let c = files(&dir, "dev-1", &time);
        assert!(dir.is_dir());
        assert_eq!(c.lock_path("plot_1.kml").unwrap(), dir.join("plot_1.kml.lock"));
    }

    #[test]
    fn test_rejects_paths() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let c = files(tmp.path(), "dev-1", &time);

        for bad in ["", "  ", "..", ".", "a/b.kml", "../x.kml", "/etc/passwd", "dir\\x.kml"] {
            assert!(
                matches!(c.lock_path(bad), Err(LockError::InvalidResource { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_files_are_independent() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let one = files(tmp.path(), "dev-1", &time);
        let two = files(tmp.path(), "dev-2", &time);

        assert!(matches!(
            one.acquire("a.kml", Some(Duration::from_secs(30)), "Edit a").unwrap(),
            AcquireOutcome::Acquired(_)
        ));
        assert!(matches!(
            two.acquire("b.kml", None, "Edit b").unwrap(),
            AcquireOutcome::Acquired(_)
        ));

        assert!(two.is_locked("a.kml").unwrap());
        assert!(one.is_locked("b.kml").unwrap());
        assert!(!one.is_locked("a.kml").unwrap());

        // a.kml goes stale first; b.kml used the 300s default
        time.advance(Duration::from_secs(30 + 300 + 1));
        assert!(!two.is_locked("a.kml").unwrap());
        assert!(one.is_locked("b.kml").unwrap());

        assert_eq!(one.tracked_files(), vec!["a.kml".to_string()]);
        assert_eq!(one.release("a.kml").unwrap(), ReleaseOutcome::Released);
        assert!(one.tracked_files().is_empty());
        let b = two.info("b.kml").unwrap().unwrap();
        assert_eq!(b.expected_duration_seconds, Some(300));
    }

    #[test]
    fn test_lookups_do_not_grow_tracking() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let c = files(tmp.path(), "dev-1", &time);

        for i in 0..20 {
            let name = format!("plot_{}.kml", i);
            assert!(!c.is_locked(&name).unwrap());
            assert_eq!(c.info(&name).unwrap(), None);
            assert_eq!(c.release(&name).unwrap(), ReleaseOutcome::AlreadyUnlocked);
        }
        assert!(c.tracked_files().is_empty());

        c.acquire("plot_1.kml", None, "Edit").unwrap();
        c.heartbeat("plot_1.kml").unwrap();
        assert_eq!(c.tracked_files(), vec!["plot_1.kml".to_string()]);
        c.release("plot_1.kml").unwrap();
        assert!(c.tracked_files().is_empty());
    }

    #[test]
    fn test_not_owner_release_keeps_tracking() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let one = files(tmp.path(), "dev-1", &time);
        let two = files(tmp.path(), "dev-2", &time);

        one.acquire("a.kml", None, "Edit").unwrap();
        two.force_acquire("a.kml", None, "Takeover").unwrap();
        assert!(matches!(one.release("a.kml").unwrap(), ReleaseOutcome::NotOwner(_)));
        assert_eq!(one.tracked_files(), vec!["a.kml".to_string()]);
    }

    /// Records without a duration fall back to the default file duration
    #[test]
    fn test_missing_duration_uses_default() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let c = files(tmp.path(), "dev-1", &time);
        plant_raw(
            &c.lock_path("plot_9.kml").unwrap(),
            format!(
                r#"{{"holder_device_id": "dev-2", "holder_nickname": "Field tablet",
                    "operation_description": "Edit", "heartbeat_time_iso": "{}"}}"#,
                format_iso(&time.now())
            ),
        );

        time.advance(Duration::from_secs(5));
        assert!(c.is_locked("plot_9.kml").unwrap());
        assert!(matches!(
            c.acquire("plot_9.kml", None, "Edit").unwrap(),
            AcquireOutcome::Busy(ref r) if r.expected_duration_seconds.is_none()
        ));

        // default duration plus grace period
        time.advance(Duration::from_secs(300 + 300 - 5));
        assert!(c.is_locked("plot_9.kml").unwrap());
        time.advance(Duration::from_secs(1));
        assert!(!c.is_locked("plot_9.kml").unwrap());
        assert!(matches!(
            c.acquire("plot_9.kml", None, "Edit").unwrap(),
            AcquireOutcome::StaleDetected(Some(_))
        ));
    }

    #[test]
    fn test_default_duration_applies_to_tracked_coordinators() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let c = files(tmp.path(), "dev-1", &time).with_default_duration(Duration::from_secs(45));
        let tracked = c.coordinator("x.kml").unwrap();
        assert_eq!(tracked.duration_fallback(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_coordinator_is_reused() {
        let tmp = TempDir::new().unwrap();
        let time = ManualTime::new();
        let c = files(tmp.path(), "dev-1", &time);
        let first = c.coordinator("x.kml").unwrap();
        let second = c.coordinator("x.kml").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.grace_period(), FILE_GRACE_PERIOD);
    }
}
