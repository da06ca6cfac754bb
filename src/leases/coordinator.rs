// Lock coordinator - acquire, heartbeat and release of one lease file

use super::{FsLeaseStore, LeaseRecord, LeaseStore, StoredLease};
use crate::clock::LeaseClock;
use crate::identity::DeviceIdentity;
use crate::{LockError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a lost creation race is re-evaluated before giving up
const CREATE_RACE_ATTEMPTS: usize = 3;

/// Result of a normal acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This instance now holds the lease
    Acquired(LeaseRecord),
    /// A fresh lease is held by another instance. Nothing was changed.
    Busy(LeaseRecord),
    /// The existing lease is stale or unreadable. Nothing was changed;
    /// taking over requires `force_acquire`.
    StaleDetected(Option<LeaseRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Updated(LeaseRecord),
    /// Another instance holds the lease now
    NotOwner(LeaseRecord),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner(LeaseRecord),
    AlreadyUnlocked,
}

impl ReleaseOutcome {
    /// `AlreadyUnlocked` counts as success
    pub fn is_success(&self) -> bool {
        !matches!(self, ReleaseOutcome::NotOwner(_))
    }
}

/// Coordinates one named resource through its lock file.
///
/// No lease state is cached between calls; every operation re-reads the
/// file. The last record seen is remembered only so that `release` can
/// still recognise its own lease when the file later becomes unreadable.
#[derive(Debug)]
pub struct LockCoordinator {
    resource: String,
    lock_path: PathBuf,
    grace_period: Duration,
    duration_fallback: Option<Duration>,
    identity: DeviceIdentity,
    store: Arc<dyn LeaseStore>,
    clock: Arc<LeaseClock>,
    last_seen: Mutex<Option<LeaseRecord>>,
}

impl LockCoordinator {
    /// Coordinator for an arbitrary lock file
    pub fn new(
        resource: impl Into<String>,
        lock_path: impl Into<PathBuf>,
        grace_period: Duration,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            resource: resource.into(),
            lock_path: lock_path.into(),
            grace_period,
            duration_fallback: None,
            identity,
            store: Arc::new(FsLeaseStore::new()),
            clock: Arc::new(LeaseClock::new()),
            last_seen: Mutex::new(None),
        }
    }

    /// Coordinator for the shared database at `db_path`.
    /// The lease lives in `<db_path>.lock` next to the database.
    pub fn for_database(
        db_path: &Path,
        grace_period: Duration,
        identity: DeviceIdentity,
    ) -> Result<Self> {
        let lock_path = database_lock_path(db_path)?;
        let resource = db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(resource, lock_path, grace_period, identity))
    }

    /// Expected duration assumed for records that do not carry one.
    /// Without a fallback such records are stale.
    pub fn with_duration_fallback(mut self, fallback: Option<Duration>) -> Self {
        self.duration_fallback = fallback;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<LeaseClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn duration_fallback(&self) -> Option<Duration> {
        self.duration_fallback
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Last record observed by this coordinator, for diagnostics
    pub fn last_seen(&self) -> Option<LeaseRecord> {
        self.last_seen.lock().clone()
    }

    /// Try to take the lease without overriding anyone.
    ///
    /// Re-acquiring a lease this instance already holds refreshes it in
    /// place with the new label and duration.
    pub fn acquire(&self, expected_duration: Duration, operation: &str) -> Result<AcquireOutcome> {
        self.identity.require_complete()?;
        let secs = whole_seconds(expected_duration)?;
        *self.last_seen.lock() = None;

        for _ in 0..CREATE_RACE_ATTEMPTS {
            match self.store.read(&self.lock_path)? {
                StoredLease::NotFound => {
                    let record =
                        LeaseRecord::new(&self.identity, self.clock.stamp(), secs, operation);
                    if self.store.create_new(&self.lock_path, &record)? {
                        info!(
                            resource = %self.resource,
                            holder = %self.identity.nickname,
                            operation,
                            "lease acquired"
                        );
                        self.remember(&record);
                        return Ok(AcquireOutcome::Acquired(record));
                    }
                    debug!(
                        resource = %self.resource,
                        "another instance created the lease first, re-reading"
                    );
                }
                StoredLease::Corrupt(reason) => {
                    warn!(
                        resource = %self.resource,
                        path = %self.lock_path.display(),
                        %reason,
                        "lease file unreadable, treating as stale"
                    );
                    return Ok(AcquireOutcome::StaleDetected(None));
                }
                StoredLease::Found(mut existing) => {
                    self.remember(&existing);

                    if existing.is_held_by(&self.identity.device_id) {
                        debug!(
                            resource = %self.resource,
                            operation,
                            "lease already held by this instance, refreshing"
                        );
                        existing.holder_label = self.identity.nickname.clone();
                        existing.reconfirm(self.clock.stamp(), secs, operation);
                        self.store.write(&self.lock_path, &existing)?;
                        self.remember(&existing);
                        return Ok(AcquireOutcome::Acquired(existing));
                    }

                    if self.is_stale(&existing) {
                        warn!(resource = %self.resource, lease = %existing, "stale lease detected");
                        return Ok(AcquireOutcome::StaleDetected(Some(existing)));
                    }

                    info!(resource = %self.resource, lease = %existing, "lease busy");
                    return Ok(AcquireOutcome::Busy(existing));
                }
            }
        }

        Err(LockError::Other(anyhow::anyhow!(
            "lease for {} changed {} times while acquiring",
            self.resource,
            CREATE_RACE_ATTEMPTS
        )))
    }

    /// Take the lease unconditionally, replacing whatever record exists.
    /// Only call this once staleness has been confirmed.
    pub fn force_acquire(
        &self,
        expected_duration: Duration,
        operation: &str,
    ) -> Result<LeaseRecord> {
        self.identity.require_complete()?;
        let secs = whole_seconds(expected_duration)?;

        match self.store.read(&self.lock_path)? {
            StoredLease::Found(previous) => {
                warn!(resource = %self.resource, displaced = %previous, "overriding lease")
            }
            StoredLease::Corrupt(_) => {
                warn!(resource = %self.resource, "overriding unreadable lease")
            }
            StoredLease::NotFound => {}
        }

        self.store.delete(&self.lock_path)?;
        let record = LeaseRecord::new(&self.identity, self.clock.stamp(), secs, operation);
        self.store.write(&self.lock_path, &record)?;
        self.remember(&record);

        info!(
            resource = %self.resource,
            holder = %self.identity.nickname,
            operation,
            "lease forcibly acquired"
        );
        Ok(record)
    }

    /// Refresh the heartbeat of a lease this instance holds
    pub fn heartbeat(&self) -> Result<HeartbeatOutcome> {
        self.update(None, None)
    }

    /// Refresh the heartbeat, optionally changing the expected duration and label
    pub fn update(
        &self,
        expected_duration: Option<Duration>,
        operation: Option<&str>,
    ) -> Result<HeartbeatOutcome> {
        self.identity.require_complete()?;
        let secs = expected_duration.map(whole_seconds).transpose()?;

        let mut record = match self.store.read(&self.lock_path)? {
            StoredLease::Found(record) => record,
            StoredLease::NotFound => {
                warn!(resource = %self.resource, "heartbeat on missing lease");
                return Ok(HeartbeatOutcome::NotFound);
            }
            StoredLease::Corrupt(reason) => {
                return Err(LockError::Corrupt {
                    path: self.lock_path.clone(),
                    reason,
                })
            }
        };

        if !record.is_held_by(&self.identity.device_id) {
            warn!(
                resource = %self.resource,
                lease = %record,
                "heartbeat denied, lease held by another instance"
            );
            self.remember(&record);
            return Ok(HeartbeatOutcome::NotOwner(record));
        }

        record.touch(self.clock.stamp());
        if let Some(secs) = secs {
            record.expected_duration_seconds = Some(secs);
        }
        if let Some(operation) = operation {
            record.operation_label = operation.to_string();
        }
        self.store.write(&self.lock_path, &record)?;
        self.remember(&record);
        Ok(HeartbeatOutcome::Updated(record))
    }

    /// Give the lease up if this instance still holds it
    pub fn release(&self) -> Result<ReleaseOutcome> {
        self.identity.require_complete()?;

        match self.store.read(&self.lock_path)? {
            StoredLease::NotFound => {
                debug!(resource = %self.resource, "release on missing lease");
                *self.last_seen.lock() = None;
                Ok(ReleaseOutcome::AlreadyUnlocked)
            }
            StoredLease::Found(record) if record.is_held_by(&self.identity.device_id) => {
                self.store.delete(&self.lock_path)?;
                *self.last_seen.lock() = None;
                info!(
                    resource = %self.resource,
                    holder = %self.identity.nickname,
                    "lease released"
                );
                Ok(ReleaseOutcome::Released)
            }
            StoredLease::Found(record) => {
                warn!(
                    resource = %self.resource,
                    lease = %record,
                    "release denied, lease held by another instance"
                );
                self.remember(&record);
                Ok(ReleaseOutcome::NotOwner(record))
            }
            StoredLease::Corrupt(reason) => {
                let owned = self
                    .last_seen
                    .lock()
                    .as_ref()
                    .is_some_and(|r| r.is_held_by(&self.identity.device_id));
                if !owned {
                    warn!(
                        resource = %self.resource,
                        %reason,
                        "lease unreadable, ownership unknown, not releasing"
                    );
                    return Err(LockError::Corrupt {
                        path: self.lock_path.clone(),
                        reason,
                    });
                }
                warn!(
                    resource = %self.resource,
                    %reason,
                    "lease unreadable but last seen as ours, removing"
                );
                self.store.delete(&self.lock_path)?;
                *self.last_seen.lock() = None;
                Ok(ReleaseOutcome::Released)
            }
        }
    }

    /// Current lease, if any. Unreadable records are reported as absent.
    pub fn info(&self) -> Result<Option<LeaseRecord>> {
        match self.store.read(&self.lock_path)? {
            StoredLease::Found(record) => Ok(Some(record)),
            StoredLease::NotFound => Ok(None),
            StoredLease::Corrupt(reason) => {
                warn!(resource = %self.resource, %reason, "lease unreadable");
                Ok(None)
            }
        }
    }

    /// True only for a fresh lease held by another instance
    pub fn is_locked(&self) -> Result<bool> {
        match self.store.read(&self.lock_path)? {
            StoredLease::Found(record) => {
                Ok(!record.is_held_by(&self.identity.device_id) && !self.is_stale(&record))
            }
            StoredLease::NotFound | StoredLease::Corrupt(_) => Ok(false),
        }
    }

    /// Run a coordinator call on tokio's blocking pool.
    ///
    /// Every operation reads and writes the share synchronously; async
    /// callers go through here so a slow mount never holds a runtime worker.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LockCoordinator) -> Result<T> + Send + 'static,
    {
        let coordinator = Arc::clone(self);
        match tokio::task::spawn_blocking(move || call(&coordinator)).await {
            Ok(result) => result,
            Err(e) => Err(LockError::Other(anyhow::anyhow!("lease task failed: {}", e))),
        }
    }

    /// Keep the lease alive from a background task until the returned
    /// handle is dropped or the lease is lost.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> HeartbeatTask {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match coordinator.run_blocking(|c| c.heartbeat()).await {
                    Ok(HeartbeatOutcome::Updated(_)) => {
                        debug!(resource = %coordinator.resource, "heartbeat");
                    }
                    Ok(HeartbeatOutcome::NotOwner(record)) => {
                        warn!(
                            resource = %coordinator.resource,
                            lease = %record,
                            "lease lost, stopping heartbeat"
                        );
                        break;
                    }
                    Ok(HeartbeatOutcome::NotFound) => {
                        warn!(
                            resource = %coordinator.resource,
                            "lease vanished, stopping heartbeat"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            resource = %coordinator.resource,
                            error = %e,
                            "heartbeat failed, stopping"
                        );
                        break;
                    }
                }
            }
        });
        HeartbeatTask { handle }
    }

    fn is_stale(&self, record: &LeaseRecord) -> bool {
        record.is_stale_at(self.clock.now(), self.grace_period, self.duration_fallback)
    }

    fn remember(&self, record: &LeaseRecord) {
        *self.last_seen.lock() = Some(record.clone());
    }
}

/// Background heartbeat; stops when dropped
#[derive(Debug)]
pub struct HeartbeatTask {
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Abort the task now. Dropping the handle has the same effect.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// `<db_dir>/<db_name>.lock`, with `.` standing in for a bare file name
pub fn database_lock_path(db_path: &Path) -> Result<PathBuf> {
    let name = db_path.file_name().filter(|n| !n.is_empty()).ok_or_else(|| {
        LockError::invalid_resource(db_path.display().to_string(), "database path has no file name")
    })?;

    let dir = match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut lock_name = name.to_os_string();
    lock_name.push(".lock");
    Ok(dir.join(lock_name))
}

fn whole_seconds(duration: Duration) -> Result<u64> {
    match duration.as_secs() {
        0 => Err(LockError::InvalidDuration),
        secs => Ok(secs),
    }
}
