//! Persistence layer for stackgate.
//!
//! This crate provides the `EnvironmentStore` trait with a file-backed
//! implementation (one checksummed JSON record per environment, written
//! atomically) and an in-memory one, the `StateStore` used by provisioning
//! engines to persist their state between runs, `StoreLayout` for the on-disk
//! directory structure, and an integrity verifier.

pub mod environments;
pub mod integrity;
pub mod layout;
pub mod state;

pub use environments::{EnvironmentStore, FileEnvironmentStore, MemoryEnvironmentStore};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use state::{FileStateStore, MemoryStateStore, StateStore};

use stackgate_schema::EnvironmentId;
use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("environment not found: {0}")]
    EnvNotFound(EnvironmentId),
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("record for environment {file} contains environment {record}")]
    IdMismatch {
        file: EnvironmentId,
        record: EnvironmentId,
    },
    #[error("invalid store key: {0}")]
    InvalidKey(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("store lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_env_not_found() {
        let e = StoreError::EnvNotFound(EnvironmentId::new(17));
        assert!(e.to_string().contains("17"));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            key: "k".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }
}
