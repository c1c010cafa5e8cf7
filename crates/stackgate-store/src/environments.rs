use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use stackgate_schema::{Environment, EnvironmentId};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::RwLock;
use tempfile::NamedTempFile;

/// Durable key/value persistence for environment records.
///
/// `put` must be atomic per environment id: a concurrent or crashed writer
/// never leaves a partially written record behind.
pub trait EnvironmentStore: Send + Sync {
    fn get(&self, id: EnvironmentId) -> Result<Environment, StoreError>;

    fn put(&self, env: &Environment) -> Result<(), StoreError>;

    /// All records, ordered by id.
    fn list(&self) -> Result<Vec<Environment>, StoreError>;

    fn exists(&self, id: EnvironmentId) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvironmentRecord {
    environment: Environment,
    /// blake3 over the serialized environment. `None` for hand-written records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

fn compute_checksum(env: &Environment) -> Result<String, StoreError> {
    let json = serde_json::to_vec(env)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}

/// One JSON file per environment under `<store>/environments/`.
pub struct FileEnvironmentStore {
    layout: StoreLayout,
}

impl FileEnvironmentStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn read_record(&self, id: EnvironmentId) -> Result<Environment, StoreError> {
        let path = self.layout.environment_file(id);
        if !path.exists() {
            return Err(StoreError::EnvNotFound(id));
        }
        let content = fs::read_to_string(&path)?;
        let record: EnvironmentRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = compute_checksum(&record.environment)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: id.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if record.environment.id != id {
            return Err(StoreError::IdMismatch {
                file: id,
                record: record.environment.id,
            });
        }
        Ok(record.environment)
    }

    /// Like `list()`, but returns per-entry results so `verify-store` can
    /// surface individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<Environment, (String, StoreError)>>, StoreError> {
        let dir = self.layout.environments_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match stem.parse::<EnvironmentId>() {
                Ok(id) => match self.read_record(id) {
                    Ok(env) => results.push(Ok(env)),
                    Err(e) => results.push(Err((name, e))),
                },
                Err(_) => results.push(Err((
                    name.clone(),
                    StoreError::InvalidKey(format!("not an environment id: {name}")),
                ))),
            }
        }
        Ok(results)
    }
}

impl EnvironmentStore for FileEnvironmentStore {
    fn get(&self, id: EnvironmentId) -> Result<Environment, StoreError> {
        self.read_record(id)
    }

    fn put(&self, env: &Environment) -> Result<(), StoreError> {
        let dir = self.layout.environments_dir();
        fs::create_dir_all(&dir)?;
        let dest = self.layout.environment_file(env.id);

        let record = EnvironmentRecord {
            environment: env.clone(),
            checksum: Some(compute_checksum(env)?),
        };
        let content = serde_json::to_string_pretty(&record)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        tracing::debug!(env_id = %env.id, changes = env.changes.len(), "persisted environment");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Environment>, StoreError> {
        let mut envs = Vec::new();
        for result in self.list_with_errors()? {
            match result {
                Ok(env) => envs.push(env),
                Err((name, e)) => {
                    tracing::warn!("skipping corrupted environment record '{name}': {e}");
                }
            }
        }
        envs.sort_by_key(|e| e.id);
        Ok(envs)
    }

    fn exists(&self, id: EnvironmentId) -> bool {
        self.layout.environment_file(id).exists()
    }
}

/// Process-local store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryEnvironmentStore {
    envs: RwLock<BTreeMap<EnvironmentId, Environment>>,
}

impl MemoryEnvironmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environments(envs: impl IntoIterator<Item = Environment>) -> Self {
        Self {
            envs: RwLock::new(envs.into_iter().map(|e| (e.id, e)).collect()),
        }
    }
}

impl EnvironmentStore for MemoryEnvironmentStore {
    fn get(&self, id: EnvironmentId) -> Result<Environment, StoreError> {
        let envs = self.envs.read().map_err(|_| StoreError::Poisoned)?;
        envs.get(&id).cloned().ok_or(StoreError::EnvNotFound(id))
    }

    fn put(&self, env: &Environment) -> Result<(), StoreError> {
        let mut envs = self.envs.write().map_err(|_| StoreError::Poisoned)?;
        envs.insert(env.id, env.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Environment>, StoreError> {
        let envs = self.envs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(envs.values().cloned().collect())
    }

    fn exists(&self, id: EnvironmentId) -> bool {
        self.envs
            .read()
            .map(|envs| envs.contains_key(&id))
            .unwrap_or(false)
    }
}
