use crate::StoreError;
use serde::{Deserialize, Serialize};
use stackgate_schema::EnvironmentId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a stackgate store.
///
/// ```text
/// <root>/version
/// <root>/.lock
/// <root>/environments/<id>.json
/// <root>/locks/<id>.lock
/// <root>/state/<key>
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("environments")
    }

    #[inline]
    pub fn environment_file(&self, id: EnvironmentId) -> PathBuf {
        self.environments_dir().join(format!("{id}.json"))
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Cross-process lock serializing pipeline runs for one environment.
    #[inline]
    pub fn environment_lock_file(&self, id: EnvironmentId) -> PathBuf {
        self.root.join("locks").join(format!("{id}.lock"))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.environments_dir())?;
        fs::create_dir_all(self.state_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
