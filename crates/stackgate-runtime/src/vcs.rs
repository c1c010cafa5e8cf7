use crate::RuntimeError;
use stackgate_schema::Revision;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Version-control client used to materialize an environment's source tree.
pub trait SourceControl: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Clone `repo` at `branch` into `dest`, which must not exist yet.
    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), RuntimeError>;

    fn checkout(&self, tree: &Path, revision: &Revision) -> Result<(), RuntimeError>;
}

/// Drives the `git` binary as an external process.
pub struct GitClient {
    binary: PathBuf,
}

impl Default for GitClient {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl GitClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        tracing::debug!("git {}", args.join(" "));
        let output = cmd.output().map_err(|e| {
            RuntimeError::VcsFailed(format!("failed to spawn {}: {e}", self.binary.display()))
        })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::VcsFailed(format!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl SourceControl for GitClient {
    fn name(&self) -> &'static str {
        "git"
    }

    fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), RuntimeError> {
        let dest_str = dest.to_string_lossy();
        self.run(
            None,
            &[
                "clone",
                "--quiet",
                "--branch",
                branch,
                "--",
                repo,
                &*dest_str,
            ],
        )
    }

    fn checkout(&self, tree: &Path, revision: &Revision) -> Result<(), RuntimeError> {
        if revision.starts_with('-') {
            return Err(RuntimeError::VcsFailed(format!(
                "refusing option-like revision '{revision}'"
            )));
        }
        self.run(Some(tree), &["checkout", "--quiet", "--detach", revision.as_str()])
    }
}

pub fn select_vcs(name: &str, binary: &Path) -> Result<Arc<dyn SourceControl>, RuntimeError> {
    match name {
        "git" => Ok(Arc::new(GitClient::with_binary(binary))),
        "mock" => Ok(Arc::new(crate::mock::MockSourceControl::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        assert_eq!(select_vcs("git", Path::new("git")).unwrap().name(), "git");
        assert_eq!(select_vcs("mock", Path::new("")).unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_vcs("svn", Path::new("svn")),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn missing_binary_reports_spawn_failure() {
        let git = GitClient::with_binary("/nonexistent/stackgate-git");
        assert!(!git.available());
        let dir = tempfile::tempdir().unwrap();
        let err = git
            .clone_repo("https://example.invalid/repo.git", "main", &dir.path().join("x"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn option_like_revisions_are_rejected() {
        let git = GitClient::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(git
            .checkout(dir.path(), &Revision::new("--orphan"))
            .is_err());
    }
}
