// Bounded, non-blocking retries around lease-guarded operations
//
// A run acquires the lease, executes the operation once and releases the
// lease again. Busy leases are retried on a timer, stale leases go through
// an override prompt, and everything else ends the run.

pub mod orchestrator;
pub mod prompt;

pub use orchestrator::{RetryHandle, RetryOrchestrator};
pub use prompt::{AcceptOverride, DeclineOverride, OverridePrompt, TerminalPrompt};

use crate::leases::LeaseRecord;
use crate::LockError;
use std::time::Duration;

/// Default number of acquire attempts per run
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(7000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total acquire attempts, including the first
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Refresh the lease this often while the operation runs
    pub heartbeat_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat_interval: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
            heartbeat_interval: None,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

/// Progress of a run, for status bars and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Attempt {
        resource: String,
        attempt: u32,
        max_attempts: u32,
    },
    Busy {
        resource: String,
        holder: LeaseRecord,
        attempts_remaining: u32,
        retry_in: Duration,
    },
    StaleDetected {
        resource: String,
        holder: Option<LeaseRecord>,
    },
    OverrideDeclined {
        resource: String,
    },
    Acquired {
        resource: String,
        forced: bool,
    },
    Released {
        resource: String,
    },
    ReleaseFailed {
        resource: String,
        reason: String,
    },
    Exhausted {
        resource: String,
        attempts: u32,
        holder: Option<LeaseRecord>,
    },
    Failed {
        resource: String,
        reason: String,
    },
    Cancelled {
        resource: String,
    },
}

impl RetryEvent {
    pub fn resource(&self) -> &str {
        match self {
            RetryEvent::Attempt { resource, .. }
            | RetryEvent::Busy { resource, .. }
            | RetryEvent::StaleDetected { resource, .. }
            | RetryEvent::OverrideDeclined { resource }
            | RetryEvent::Acquired { resource, .. }
            | RetryEvent::Released { resource }
            | RetryEvent::ReleaseFailed { resource, .. }
            | RetryEvent::Exhausted { resource, .. }
            | RetryEvent::Failed { resource, .. }
            | RetryEvent::Cancelled { resource } => resource,
        }
    }

    /// One-line message suitable for a status bar
    pub fn status_message(&self) -> String {
        match self {
            RetryEvent::Attempt {
                resource,
                attempt,
                max_attempts,
            } => format!("Locking '{}' (attempt {}/{})", resource, attempt, max_attempts),
            RetryEvent::Busy {
                resource,
                holder,
                attempts_remaining,
                retry_in,
            } => format!(
                "'{}' is locked by '{}' ({}). Retrying in {}s, {} attempt(s) left",
                resource,
                holder.holder_display(),
                holder.operation_label,
                retry_in.as_secs(),
                attempts_remaining
            ),
            RetryEvent::StaleDetected { resource, holder: Some(holder) } => {
                format!("Lock on '{}' looks stale: {}", resource, holder)
            }
            RetryEvent::StaleDetected { resource, holder: None } => {
                format!("Lock on '{}' is unreadable", resource)
            }
            RetryEvent::OverrideDeclined { resource } => {
                format!("Override of '{}' declined", resource)
            }
            RetryEvent::Acquired { resource, forced: true } => {
                format!("Forced lock on '{}'", resource)
            }
            RetryEvent::Acquired { resource, forced: false } => format!("Locked '{}'", resource),
            RetryEvent::Released { resource } => format!("Released '{}'", resource),
            RetryEvent::ReleaseFailed { resource, reason } => {
                format!("Could not release '{}': {}", resource, reason)
            }
            RetryEvent::Exhausted {
                resource,
                attempts,
                holder,
            } => match holder {
                Some(h) => format!(
                    "'{}' is still locked by '{}' after {} attempt(s)",
                    resource,
                    h.holder_display(),
                    attempts
                ),
                None => format!("'{}' is still locked after {} attempt(s)", resource, attempts),
            },
            RetryEvent::Failed { resource, reason } => format!("'{}' failed: {}", resource, reason),
            RetryEvent::Cancelled { resource } => format!("Retries for '{}' cancelled", resource),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome<T> {
    /// The operation ran under the lease. The lease has been released.
    Completed { value: T, forced: bool },
    /// The operation ran and failed or panicked. The lease has been released.
    OperationFailed(anyhow::Error),
    /// Every attempt found the lease busy; the operation never ran
    Exhausted {
        attempts: u32,
        holder: Option<LeaseRecord>,
    },
    /// A stale lease was found and the override was declined
    OverrideDeclined { holder: Option<LeaseRecord> },
    /// Cancelled or superseded while waiting
    Cancelled,
    /// Acquiring the lease failed outright
    LockFailed(LockError),
}

impl<T> RunOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Collapse into a plain result, with an error naming the holder where known
    pub fn into_result(self, operation: &str) -> anyhow::Result<T> {
        match self {
            RunOutcome::Completed { value, .. } => Ok(value),
            RunOutcome::OperationFailed(e) => Err(e.context(format!("{} failed", operation))),
            RunOutcome::Exhausted {
                attempts,
                holder: Some(holder),
            } => Err(anyhow::anyhow!(
                "{}: resource still locked after {} attempt(s), {}",
                operation,
                attempts,
                holder
            )),
            RunOutcome::Exhausted { attempts, holder: None } => Err(anyhow::anyhow!(
                "{}: resource still locked after {} attempt(s)",
                operation,
                attempts
            )),
            RunOutcome::OverrideDeclined { .. } => {
                Err(anyhow::anyhow!("{}: stale lock left in place", operation))
            }
            RunOutcome::Cancelled => Err(anyhow::anyhow!("{}: cancelled", operation)),
            RunOutcome::LockFailed(e) => {
                Err(anyhow::Error::new(e).context(format!("{}: could not lock", operation)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use chrono::Utc;

    #[test]
    fn test_policy_never_zero_attempts() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
        let default = RetryPolicy::default();
        assert_eq!(default.max_attempts, 5);
        assert_eq!(default.retry_delay, Duration::from_secs(7));
    }

    #[test]
    fn test_status_messages() {
        let office = DeviceIdentity::new("dev-2", "Office PC");
        let holder = LeaseRecord::new(&office, Utc::now(), 60, "Import");
        let busy = RetryEvent::Busy {
            resource: "main.db".into(),
            holder,
            attempts_remaining: 4,
            retry_in: Duration::from_secs(7),
        };
        assert_eq!(
            busy.status_message(),
            "'main.db' is locked by 'Office PC' (Import). Retrying in 7s, 4 attempt(s) left"
        );
        assert_eq!(busy.resource(), "main.db");

        let forced = RetryEvent::Acquired {
            resource: "plot.kml".into(),
            forced: true,
        };
        assert_eq!(forced.status_message(), "Forced lock on 'plot.kml'");
    }

    #[test]
    fn test_into_result_names_operation() {
        let outcome: RunOutcome<()> = RunOutcome::Exhausted { attempts: 3, holder: None };
        let err = outcome.into_result("Import").unwrap_err();
        assert!(err.to_string().contains("Import"));
        assert!(err.to_string().contains("3 attempt"));
    }
}
