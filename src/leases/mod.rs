// Lease management for shared resources
//
// Provides advisory exclusive access to files on a shared filesystem with:
// - One `<resource>.lock` record per guarded resource
// - Heartbeat-based staleness detection with a per-resource grace period
// - Explicit override of stale leases
// - Atomic record replacement and create-exclusive first acquisition

pub mod coordinator;
pub mod files;
pub mod lease;
pub mod store;

pub use coordinator::{
    database_lock_path, AcquireOutcome, HeartbeatOutcome, HeartbeatTask, LockCoordinator,
    ReleaseOutcome,
};
pub use files::FileLockCoordinator;
pub use lease::{
    LeaseRecord, DB_GRACE_PERIOD, DEFAULT_DB_LEASE_DURATION, DEFAULT_FILE_LEASE_DURATION,
    FILE_GRACE_PERIOD,
};
pub use store::{FsLeaseStore, LeaseStore, StoredLease};
