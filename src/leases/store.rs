// Durable storage of one lease record per lock file

use super::LeaseRecord;
use crate::Result;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::debug;

/// What a lock file currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredLease {
    Found(LeaseRecord),
    NotFound,
    /// The file exists but does not decode as a lease record
    Corrupt(String),
}

/// Reads and writes lease records. Implementations must not cache: other
/// instances may change the file between any two calls.
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn read(&self, path: &Path) -> Result<StoredLease>;

    /// Replace the whole record. Readers never observe a partial write.
    fn write(&self, path: &Path, record: &LeaseRecord) -> Result<()>;

    /// Create the record only if none exists.
    /// Returns `false` when another record is already in place.
    fn create_new(&self, path: &Path, record: &LeaseRecord) -> Result<bool>;

    /// Remove the record. Removing a missing record is not an error.
    fn delete(&self, path: &Path) -> Result<()>;
}

/// Lease store on a (possibly network mounted) filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLeaseStore;

impl FsLeaseStore {
    pub fn new() -> Self {
        Self
    }

    /// Serialize into a temp file next to `path`, ready to be renamed into place
    fn stage(path: &Path, record: &LeaseRecord) -> Result<tempfile::NamedTempFile> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let prefix = format!(
            ".{}.",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("lease")
        );
        let mut staged = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(parent)?;

        let body = serde_json::to_vec_pretty(record)?;
        staged.write_all(&body)?;
        staged.as_file().sync_all()?;
        Ok(staged)
    }
}

impl LeaseStore for FsLeaseStore {
    fn exists(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, path: &Path) -> Result<StoredLease> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoredLease::NotFound),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<LeaseRecord>(&raw) {
            Ok(record) => Ok(StoredLease::Found(record)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "lease record does not decode");
                Ok(StoredLease::Corrupt(e.to_string()))
            }
        }
    }

    fn write(&self, path: &Path, record: &LeaseRecord) -> Result<()> {
        let staged = Self::stage(path, record)?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn create_new(&self, path: &Path, record: &LeaseRecord) -> Result<bool> {
        let staged = Self::stage(path, record)?;
        match staged.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(holder: &str) -> LeaseRecord {
        LeaseRecord::new(&DeviceIdentity::new(holder, holder), Utc::now(), 60, "Import")
    }

    #[test]
    fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db.lock");
        let store = FsLeaseStore::new();

        assert!(!store.exists(&path).unwrap());
        assert_eq!(store.read(&path).unwrap(), StoredLease::NotFound);

        let rec = record("dev-1");
        store.write(&path, &rec).unwrap();
        assert!(store.exists(&path).unwrap());
        assert_eq!(store.read(&path).unwrap(), StoredLease::Found(rec));

        store.delete(&path).unwrap();
        assert!(!store.exists(&path).unwrap());
        // deleting twice is fine
        store.delete(&path).unwrap();
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plot_1.kml.lock");
        let store = FsLeaseStore::new();

        store.write(&path, &record("dev-1")).unwrap();
        store.write(&path, &record("dev-2")).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["plot_1.kml.lock".to_string()]);
    }

    #[test]
    fn test_create_new_does_not_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db.lock");
        let store = FsLeaseStore::new();

        assert!(store.create_new(&path, &record("dev-1")).unwrap());
        assert!(!store.create_new(&path, &record("dev-2")).unwrap());

        match store.read(&path).unwrap() {
            StoredLease::Found(rec) => assert_eq!(rec.holder_id, "dev-1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_corrupt_not_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db.lock");
        fs::write(&path, "this is not json").unwrap();

        let store = FsLeaseStore::new();
        assert!(matches!(store.read(&path).unwrap(), StoredLease::Corrupt(_)));

        fs::write(&path, "").unwrap();
        assert!(matches!(store.read(&path).unwrap(), StoredLease::Corrupt(_)));
    }
}
