//! Advisory leases for files shared between application instances.
//!
//! Instances that share a database file or a directory of output files over
//! a network share coordinate through `<resource>.lock` records placed next
//! to the guarded resource. There is no broker: every decision is made by
//! reading the record, and a crashed holder is detected by its heartbeat
//! going stale.
//!
//! - [`leases`]: lease records, their storage and the per-resource
//!   coordinators
//! - [`retry`]: bounded, non-blocking retries around guarded operations

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod leases;
pub mod retry;
pub mod test_utils;

mod cli;
pub use cli::{Cli, Commands, Target};

pub use clock::{LeaseClock, Timestamp};
pub use config::LockConfig;
pub use error::{LockError, Result};
pub use identity::DeviceIdentity;
pub use leases::{
    AcquireOutcome, FileLockCoordinator, HeartbeatOutcome, LeaseRecord, LeaseStore, LockCoordinator,
    ReleaseOutcome,
};
pub use retry::{RetryEvent, RetryOrchestrator, RetryPolicy, RunOutcome};
