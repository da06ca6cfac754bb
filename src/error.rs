use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Local holder identity is missing or incomplete")]
    MissingIdentity,

    #[error("Expected duration must be at least one second")]
    InvalidDuration,

    #[error("Invalid resource {name:?}: {reason}")]
    InvalidResource { name: String, reason: String },

    #[error("Lease record {path:?} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl LockError {
    pub(crate) fn invalid_resource(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
