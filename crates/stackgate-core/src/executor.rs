use stackgate_runtime::{Invocation, OutputSink, Provisioner, SourceControl};
use stackgate_schema::{Change, Command, Environment, StateKey};
use stackgate_store::StateStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const OUTPUT_ARTIFACT: &str = "output";
const STATE_ARTIFACT: &str = "state";

/// Why an execution did not complete. Only `Provisioning` reflects an engine
/// failure; the pipeline folds all three into the change status.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("variables not declared by the configuration: {}", .0.join(", "))]
    UndeclaredVariables(Vec<String>),
    #[error("{0}")]
    Provisioning(String),
}

/// Paths of one environment's scratch checkout.
///
/// ```text
/// <root>/<name>/                 clone of the environment repository
/// <root>/<name>/<path>/          directory the engine runs in
/// <root>/<name>/<path>/output    human-readable engine output
/// <root>/<name>/<path>/state     engine state after an apply
/// ```
#[derive(Debug, Clone)]
pub struct WorkTree {
    repo: PathBuf,
    files: PathBuf,
}

impl WorkTree {
    pub fn for_environment(root: &Path, env: &Environment) -> Self {
        let repo = root.join(&env.name);
        let files = if env.path.is_empty() {
            repo.clone()
        } else {
            repo.join(&env.path)
        };
        Self { repo, files }
    }

    #[inline]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    #[inline]
    pub fn files(&self) -> &Path {
        &self.files
    }

    #[inline]
    pub fn output(&self) -> PathBuf {
        self.files.join(OUTPUT_ARTIFACT)
    }

    #[inline]
    pub fn state(&self) -> PathBuf {
        self.files.join(STATE_ARTIFACT)
    }

    pub fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.repo) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Removes a work tree when dropped, whatever path the run took.
pub(crate) struct WorkTreeCleanup(pub(crate) WorkTree);

impl Drop for WorkTreeCleanup {
    fn drop(&mut self) {
        if let Err(e) = self.0.remove() {
            warn!("failed to remove work tree {}: {e}", self.0.repo().display());
        } else {
            debug!("removed work tree {}", self.0.repo().display());
        }
    }
}

/// Checks out an environment at a change's revision and runs the
/// provisioning engine against it.
pub struct Executor {
    root_folder: PathBuf,
    vcs: Arc<dyn SourceControl>,
    provisioner: Arc<dyn Provisioner>,
    states: Arc<dyn StateStore>,
}

impl Executor {
    pub fn new(
        root_folder: impl Into<PathBuf>,
        vcs: Arc<dyn SourceControl>,
        provisioner: Arc<dyn Provisioner>,
        states: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            root_folder: root_folder.into(),
            vcs,
            provisioner,
            states,
        }
    }

    #[inline]
    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    pub fn work_tree(&self, env: &Environment) -> WorkTree {
        WorkTree::for_environment(&self.root_folder, env)
    }

    /// Run `command` for `change` of `env`. Leaves the work tree in place;
    /// the caller reads the artifacts and removes it.
    pub fn execute(
        &self,
        env: &Environment,
        change: &Change,
        command: &Command,
        sink: &mut dyn OutputSink,
    ) -> Result<(), ExecError> {
        let tree = self.work_tree(env);
        debug!(
            env_id = %env.id,
            change_id = %change.id,
            command = %command,
            "executing in {}",
            tree.files().display()
        );

        // A crashed earlier run may have left its checkout behind.
        tree.remove()
            .and_then(|()| std::fs::create_dir_all(&self.root_folder))
            .map_err(|e| ExecError::SourceUnavailable(e.to_string()))?;

        sink.header(&format!("Cloning {} ({})...", env.repo, env.branch));
        self.vcs
            .clone_repo(&env.repo, &env.branch, tree.repo())
            .map_err(|e| {
                warn!(env_id = %env.id, "clone failed: {e}");
                ExecError::SourceUnavailable(e.to_string())
            })?;
        self.vcs
            .checkout(tree.repo(), &change.revision)
            .map_err(|e| {
                warn!(env_id = %env.id, revision = %change.revision, "checkout failed: {e}");
                ExecError::SourceUnavailable(e.to_string())
            })?;

        self.check_variables(env, tree.files())?;

        let invocation = Invocation {
            dir: tree.files().to_path_buf(),
            variables: &env.variables,
            state_key: StateKey::for_environment(env.id),
            states: self.states.as_ref(),
            output_path: tree.output(),
            state_path: tree.state(),
            args: vec![command.as_str().to_owned()],
        };

        sink.header(&format!(
            "Executing {} to manage infrastructure...",
            self.provisioner.name()
        ));
        sink.message("Raw output will begin streaming in below.");
        self.provisioner.run(&invocation, sink).map_err(|e| {
            warn!(env_id = %env.id, change_id = %change.id, "{command} failed: {e}");
            sink.error(&e.to_string());
            ExecError::Provisioning(e.to_string())
        })?;
        sink.header("Execution complete. Saving results...");
        Ok(())
    }

    fn check_variables(&self, env: &Environment, dir: &Path) -> Result<(), ExecError> {
        let declared = self
            .provisioner
            .declared_inputs(dir)
            .map_err(|e| ExecError::Provisioning(e.to_string()))?;
        let Some(declared) = declared else {
            return Ok(());
        };
        let undeclared: Vec<String> = env
            .variables
            .keys()
            .filter(|name| !declared.contains(*name))
            .cloned()
            .collect();
        if undeclared.is_empty() {
            Ok(())
        } else {
            Err(ExecError::UndeclaredVariables(undeclared))
        }
    }
}
