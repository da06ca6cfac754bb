//! Lock configuration from a JSON file and `SHARELOCK_*` environment variables.

use crate::leases::{
    DB_GRACE_PERIOD, DEFAULT_DB_LEASE_DURATION, DEFAULT_FILE_LEASE_DURATION, FILE_GRACE_PERIOD,
};
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing and identity settings shared by the database and file coordinators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Grace period added to database leases before they count as stale
    pub db_grace_period_secs: u64,

    /// Grace period added to per-file leases before they count as stale
    pub file_grace_period_secs: u64,

    /// Expected duration of a database operation
    pub db_lock_duration_secs: u64,

    /// Expected duration of a file edit when the caller gives none
    pub file_lock_duration_secs: u64,

    /// Total acquire attempts per guarded operation
    pub max_lock_retries: u32,

    /// Delay between attempts while the lease is busy
    pub retry_delay_ms: u64,

    /// Refresh held leases this often during long operations
    pub heartbeat_interval_secs: Option<u64>,

    /// Where the device identity is stored
    pub identity_path: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            db_grace_period_secs: DB_GRACE_PERIOD.as_secs(),
            file_grace_period_secs: FILE_GRACE_PERIOD.as_secs(),
            db_lock_duration_secs: DEFAULT_DB_LEASE_DURATION.as_secs(),
            file_lock_duration_secs: DEFAULT_FILE_LEASE_DURATION.as_secs(),
            max_lock_retries: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            heartbeat_interval_secs: None,
            identity_path: default_identity_path(),
        }
    }
}

impl LockConfig {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SHARELOCK_DB_GRACE_SECS`: database grace period (default: 60)
    /// - `SHARELOCK_FILE_GRACE_SECS`: per-file grace period (default: 300)
    /// - `SHARELOCK_DB_DURATION_SECS`: database lease duration (default: 60)
    /// - `SHARELOCK_FILE_DURATION_SECS`: per-file lease duration (default: 300)
    /// - `SHARELOCK_MAX_RETRIES`: acquire attempts (default: 5)
    /// - `SHARELOCK_RETRY_DELAY_MS`: delay between attempts (default: 7000)
    /// - `SHARELOCK_HEARTBEAT_SECS`: heartbeat interval (default: none)
    /// - `SHARELOCK_IDENTITY`: identity file (default: ~/.sharelock/identity.json)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_vars(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup`, keyed by the `SHARELOCK_*` names
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = parse_var(&lookup, "SHARELOCK_DB_GRACE_SECS")? {
            self.db_grace_period_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_FILE_GRACE_SECS")? {
            self.file_grace_period_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_DB_DURATION_SECS")? {
            self.db_lock_duration_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_FILE_DURATION_SECS")? {
            self.file_lock_duration_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_MAX_RETRIES")? {
            self.max_lock_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_RETRY_DELAY_MS")? {
            self.retry_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARELOCK_HEARTBEAT_SECS")? {
            self.heartbeat_interval_secs = Some(v).filter(|secs| *secs > 0);
        }
        if let Some(path) = lookup("SHARELOCK_IDENTITY").filter(|p| !p.trim().is_empty()) {
            self.identity_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_lock_retries == 0 {
            return Err(LockError::Config("max_lock_retries must be at least 1".into()));
        }
        if self.db_lock_duration_secs == 0 || self.file_lock_duration_secs == 0 {
            return Err(LockError::Config("lock durations must be at least one second".into()));
        }
        if self.heartbeat_interval_secs == Some(0) {
            return Err(LockError::Config("heartbeat interval must be at least one second".into()));
        }
        Ok(())
    }

    pub fn db_grace_period(&self) -> Duration {
        Duration::from_secs(self.db_grace_period_secs)
    }

    pub fn file_grace_period(&self) -> Duration {
        Duration::from_secs(self.file_grace_period_secs)
    }

    pub fn db_lock_duration(&self) -> Duration {
        Duration::from_secs(self.db_lock_duration_secs)
    }

    pub fn file_lock_duration(&self) -> Duration {
        Duration::from_secs(self.file_lock_duration_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy =
            RetryPolicy::new(self.max_lock_retries, Duration::from_millis(self.retry_delay_ms));
        match self.heartbeat_interval_secs {
            Some(secs) => policy.with_heartbeat(Duration::from_secs(secs)),
            None => policy,
        }
    }
}

/// `$HOME/.sharelock/identity.json`, or relative to the working directory without a home
pub fn default_identity_path() -> PathBuf {
    let base = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".sharelock").join("identity.json")
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LockError::Config(format!("{} has invalid value {:?}", key, raw))),
    }
}
