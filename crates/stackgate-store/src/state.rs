use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use stackgate_schema::StateKey;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Persistence handle for provisioning-engine state, keyed by `env-<id>`.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &StateKey, data: &[u8]) -> Result<(), StoreError>;
}

fn validate_key(key: &StateKey) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

pub struct FileStateStore {
    layout: StoreLayout,
}

impl FileStateStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn path(&self, key: &StateKey) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.layout.state_dir().join(key.as_str()))
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &StateKey, data: &[u8]) -> Result<(), StoreError> {
        let dest = self.path(key)?;
        let dir = self.layout.state_dir();
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<StateKey, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>, StoreError> {
        let states = self.states.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(states.get(key).cloned())
    }

    fn put(&self, key: &StateKey, data: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut states = self.states.lock().map_err(|_| StoreError::Poisoned)?;
        states.insert(key.clone(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgate_schema::EnvironmentId;

    fn test_state_store() -> (tempfile::TempDir, FileStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, FileStateStore::new(layout))
    }

    #[test]
    fn file_state_roundtrip() {
        let (_dir, store) = test_state_store();
        let key = StateKey::for_environment(EnvironmentId::new(1));
        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, b"{\"version\": 4}").unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), b"{\"version\": 4}");
        store.put(&key, b"{\"version\": 5}").unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), b"{\"version\": 5}");
    }

    #[test]
    fn file_state_keys_are_isolated() {
        let (_dir, store) = test_state_store();
        let a = StateKey::for_environment(EnvironmentId::new(1));
        let b = StateKey::for_environment(EnvironmentId::new(2));
        store.put(&a, b"a").unwrap();
        assert_eq!(store.get(&b).unwrap(), None);
    }

    #[test]
    fn path_like_keys_are_rejected() {
        let (_dir, store) = test_state_store();
        for bad in ["../escape", "a/b", ".hidden", ""] {
            let key = StateKey::new(bad);
            assert!(matches!(
                store.put(&key, b"x"),
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn memory_state_roundtrip() {
        let store = MemoryStateStore::new();
        let key = StateKey::for_environment(EnvironmentId::new(3));
        store.put(&key, b"tfstate").unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), b"tfstate");
    }
}
