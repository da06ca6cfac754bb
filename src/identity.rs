//! Identity of the local instance, as recorded in lease files.

use crate::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Stable identity of one application instance.
///
/// `device_id` is opaque and unique per instance; `nickname` is shown to
/// other users when this instance holds a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub nickname: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            nickname: nickname.into(),
        }
    }

    /// Fresh identity with a random device id
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), nickname)
    }

    /// Both the id and the nickname are present
    pub fn is_complete(&self) -> bool {
        !self.device_id.trim().is_empty() && !self.nickname.trim().is_empty()
    }

    /// Load the identity stored at `path`, or create and store a new one.
    ///
    /// A stored identity keeps its device id; the nickname is replaced when a
    /// different non-empty one is given.
    pub fn load_or_create(path: &Path, nickname: &str) -> Result<Self> {
        if path.exists() {
            let raw = fs::read(path)?;
            let mut identity: DeviceIdentity = serde_json::from_slice(&raw)?;
            if identity.device_id.trim().is_empty() {
                return Err(LockError::MissingIdentity);
            }
            if !nickname.trim().is_empty() && identity.nickname != nickname {
                identity.nickname = nickname.to_string();
                identity.save(path)?;
            }
            return Ok(identity);
        }

        let identity = Self::generate(nickname);
        identity.save(path)?;
        info!(device_id = %identity.device_id, path = %path.display(), "created device identity");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub(crate) fn require_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(LockError::MissingIdentity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DeviceIdentity::generate("laptop");
        let b = DeviceIdentity::generate("laptop");
        assert_ne!(a.device_id, b.device_id);
        assert!(a.is_complete());
    }

    #[test]
    fn test_incomplete_identity() {
        assert!(!DeviceIdentity::new("", "desk").is_complete());
        assert!(!DeviceIdentity::new("abc", " ").is_complete());
        assert!(matches!(
            DeviceIdentity::new("", "").require_complete(),
            Err(LockError::MissingIdentity)
        ));
    }

    #[test]
    fn test_load_or_create_keeps_device_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("identity.json");

        let created = DeviceIdentity::load_or_create(&path, "field-laptop").unwrap();
        let loaded = DeviceIdentity::load_or_create(&path, "field-laptop").unwrap();
        assert_eq!(created, loaded);

        let renamed = DeviceIdentity::load_or_create(&path, "office-pc").unwrap();
        assert_eq!(renamed.device_id, created.device_id);
        assert_eq!(renamed.nickname, "office-pc");
    }
}
