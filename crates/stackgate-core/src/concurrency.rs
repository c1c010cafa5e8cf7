use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive advisory lock on a file, released on drop.
///
/// Guards the store against concurrent mutation from separate processes,
/// e.g. a CLI registering environments while a server is running.
pub struct StoreLock {
    file: File,
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

impl StoreLock {
    /// Block until the lock is free.
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        tracing::trace!("acquired {}", path.display());
        Ok(Self { file })
    }

    /// Take the lock if it is free, `None` otherwise.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(CoreError::Io(e)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks long-running front ends to stop accepting work and
/// drain; a second one exits immediately.
pub fn install_signal_handler() {
    let result = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nshutdown requested, waiting for running changes to finish...");
    });
    if let Err(e) = result {
        tracing::warn!("failed to install signal handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("1.lock");
        let _lock = StoreLock::acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let _lock = StoreLock::acquire(&path).unwrap();
        assert!(StoreLock::try_acquire(&path).unwrap().is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        drop(StoreLock::acquire(&path).unwrap());
        assert!(StoreLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn distinct_lock_files_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let _a = StoreLock::acquire(&dir.path().join("1.lock")).unwrap();
        assert!(StoreLock::try_acquire(&dir.path().join("2.lock"))
            .unwrap()
            .is_some());
    }
}
