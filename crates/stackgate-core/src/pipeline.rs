use crate::concurrency::StoreLock;
use crate::executor::{ExecError, Executor, WorkTree, WorkTreeCleanup};
use crate::notify::ChangeNotifier;
use crate::registry::GateRegistry;
use crate::CoreError;
use stackgate_runtime::{OutputSink, TracingSink};
use stackgate_schema::{Action, Change, ChangeId, ChangeStatus, EnvironmentId, Revision};
use stackgate_store::{EnvironmentStore, StoreLayout};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a run operates on, resolved once the gate is held.
enum Target {
    New(Change),
    Explicit(Change),
    ById(ChangeId),
    Latest,
}

/// Runs plan and apply actions against environments, one at a time per
/// environment.
///
/// Every run reloads the environment from the store after taking the
/// environment's gate, so concurrent callers never overwrite each other's
/// change log updates.
pub struct Pipeline {
    store: Arc<dyn EnvironmentStore>,
    gates: Arc<GateRegistry>,
    notifier: Arc<ChangeNotifier>,
    executor: Executor,
    process_locks: Option<StoreLayout>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        gates: Arc<GateRegistry>,
        notifier: Arc<ChangeNotifier>,
        executor: Executor,
    ) -> Self {
        Self {
            store,
            gates,
            notifier,
            executor,
            process_locks: None,
        }
    }

    /// Also take a per-environment file lock under `layout`, so runs from
    /// separate processes sharing one store are serialized too.
    #[must_use]
    pub fn with_process_locks(mut self, layout: StoreLayout) -> Self {
        self.process_locks = Some(layout);
        self
    }

    pub fn store(&self) -> &Arc<dyn EnvironmentStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn gates(&self) -> &Arc<GateRegistry> {
        &self.gates
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run `action` against `env_id`, logging engine output through `tracing`.
    pub fn run_change(
        &self,
        env_id: EnvironmentId,
        change: Option<Change>,
        action: &Action,
    ) -> Result<Change, CoreError> {
        self.run_change_with_sink(env_id, change, action, &mut TracingSink::new(env_id))
    }

    /// Run `action` against `env_id`.
    ///
    /// A plan appends `change` to the log as a new entry. Any other action
    /// completes `change` when given (it must already be in the log) and the
    /// most recent change otherwise. Engine and source failures are recorded
    /// in the returned change's status; only store and artifact failures are
    /// returned as errors.
    pub fn run_change_with_sink(
        &self,
        env_id: EnvironmentId,
        change: Option<Change>,
        action: &Action,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        let target = match change {
            Some(change) if action.is_plan() => Target::New(change),
            None if action.is_plan() => return Err(CoreError::MissingChange),
            Some(change) => Target::Explicit(change),
            None => Target::Latest,
        };
        self.run_locked(env_id, target, action, sink)
    }

    /// Run `action` against the change `change_id` as it is stored when the
    /// gate is acquired.
    pub fn run_existing(
        &self,
        env_id: EnvironmentId,
        change_id: ChangeId,
        action: &Action,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        self.run_locked(env_id, Target::ById(change_id), action, sink)
    }

    /// Plan `revision` as a new change. If the environment applies
    /// automatically and the plan succeeded, apply that same change.
    pub fn plan_revision(
        &self,
        env_id: EnvironmentId,
        revision: Revision,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        let planned = self.run_change_with_sink(
            env_id,
            Some(Change::pending(revision)),
            &Action::plan(),
            sink,
        )?;
        if planned.status != ChangeStatus::Planned || !self.store.get(env_id)?.auto_apply {
            return Ok(planned);
        }
        info!(env_id = %env_id, change_id = %planned.id, "auto-applying planned change");
        self.run_existing(env_id, planned.id, &Action::apply(), sink)
    }

    fn run_locked(
        &self,
        env_id: EnvironmentId,
        target: Target,
        action: &Action,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        let gate = self.gates.gate(env_id);
        let _gate = gate.lock();
        let _process_lock = match self.process_locks {
            Some(ref layout) => Some(StoreLock::acquire(&layout.environment_lock_file(env_id))?),
            None => None,
        };
        debug!(env_id = %env_id, command = %action.command, "gate acquired");

        let mut env = self.store.get(env_id)?;
        let mut change = match target {
            Target::New(change) => {
                let id = env.changes.append(change);
                self.store.put(&env)?;
                self.notifier.notify(env_id);
                info!(env_id = %env_id, change_id = %id, "change queued");
                env.changes
                    .get(id)
                    .cloned()
                    .ok_or(CoreError::UnknownChange { env: env_id, change: id })?
            }
            Target::Explicit(change) => {
                if !env.changes.contains(change.id) {
                    return Err(CoreError::UnknownChange {
                        env: env_id,
                        change: change.id,
                    });
                }
                change
            }
            Target::ById(id) => env
                .changes
                .get(id)
                .cloned()
                .ok_or(CoreError::UnknownChange { env: env_id, change: id })?,
            Target::Latest => env
                .changes
                .latest()
                .cloned()
                .ok_or(CoreError::NoChanges(env_id))?,
        };

        let tree = self.executor.work_tree(&env);
        let _cleanup = WorkTreeCleanup(tree.clone());

        info!(
            env_id = %env_id,
            change_id = %change.id,
            revision = %change.revision,
            "running {}",
            action.command
        );
        let captured = match self.executor.execute(&env, &change, &action.command, sink) {
            Ok(()) => {
                change.status = action.success;
                change.failure = None;
                capture_artifacts(&tree, &mut change, action, true)
            }
            Err(ExecError::SourceUnavailable(reason)) => {
                change.status = ChangeStatus::SourceUnavailable;
                change.failure = Some(reason);
                Ok(())
            }
            Err(e) => {
                change.status = action.failure;
                change.failure = Some(e.to_string());
                capture_artifacts(&tree, &mut change, action, false)
            }
        };
        if let Err(ref e) = captured {
            warn!(env_id = %env_id, change_id = %change.id, "{e}");
            change.status = action.failure;
            change.failure = Some(e.to_string());
        }
        change.touch();

        env.changes.update(change.clone())?;
        self.store.put(&env)?;
        self.notifier.notify(env_id);
        info!(
            env_id = %env_id,
            change_id = %change.id,
            status = %change.status,
            "{} finished",
            action.command
        );

        captured.map(|()| change)
    }
}

/// Copy the run's artifacts into `change`. After a failed run the engine may
/// not have produced them, so missing files are tolerated there.
fn capture_artifacts(
    tree: &WorkTree,
    change: &mut Change,
    action: &Action,
    succeeded: bool,
) -> Result<(), CoreError> {
    if let Some(output) = read_artifact(&tree.output(), succeeded)? {
        change.plan_output = output;
    }
    if action.is_apply() {
        if let Some(state) = read_artifact(&tree.state(), succeeded)? {
            change.state = Some(state);
        }
    }
    Ok(())
}

fn read_artifact(path: &Path, required: bool) -> Result<Option<String>, CoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound && !required => Ok(None),
        Err(source) => Err(CoreError::Artifact {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_is_tolerated_only_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("output");
        assert!(read_artifact(&missing, false).unwrap().is_none());
        assert!(matches!(
            read_artifact(&missing, true),
            Err(CoreError::Artifact { .. })
        ));
    }

    #[test]
    fn unreadable_artifact_is_an_error_even_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where a file is expected cannot be read as a string.
        let path = dir.path().join("output");
        std::fs::create_dir(&path).unwrap();
        assert!(matches!(
            read_artifact(&path, false),
            Err(CoreError::Artifact { .. })
        ));
    }

    #[test]
    fn capture_reads_state_only_for_apply() {
        let dir = tempfile::tempdir().unwrap();
        let env = stackgate_schema::Environment::new(EnvironmentId::new(1), "prod", "r");
        let tree = WorkTree::for_environment(dir.path(), &env);
        std::fs::create_dir_all(tree.files()).unwrap();
        std::fs::write(tree.output(), "3 to add").unwrap();
        std::fs::write(tree.state(), "{}").unwrap();

        let mut change = Change::pending("abc");
        capture_artifacts(&tree, &mut change, &Action::plan(), true).unwrap();
        assert_eq!(change.plan_output, "3 to add");
        assert!(change.state.is_none());

        capture_artifacts(&tree, &mut change, &Action::apply(), true).unwrap();
        assert_eq!(change.state.as_deref(), Some("{}"));
    }
}
