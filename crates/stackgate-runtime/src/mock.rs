use crate::output::OutputSink;
use crate::provisioner::{Invocation, Provisioner};
use crate::vcs::SourceControl;
use crate::RuntimeError;
use stackgate_schema::Revision;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What a `MockProvisioner` saw for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRun {
    pub dir: PathBuf,
    pub args: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub state_key: String,
}

/// In-process provisioning engine that writes configurable artifacts.
///
/// Also tracks how many runs overlap, so tests can assert serialization.
pub struct MockProvisioner {
    output: Option<String>,
    state: Option<String>,
    fail: bool,
    delay: Option<Duration>,
    declared: Option<BTreeSet<String>>,
    runs: Mutex<Vec<RecordedRun>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self {
            output: Some("mock plan: no changes".to_owned()),
            state: Some("{\"version\": 4, \"serial\": 1}".to_owned()),
            fail: false,
            delay: None,
            declared: None,
            runs: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content written to the output artifact; `None` writes nothing.
    #[must_use]
    pub fn with_output(mut self, output: Option<&str>) -> Self {
        self.output = output.map(str::to_owned);
        self
    }

    /// Content written to the state artifact on apply; `None` writes nothing.
    #[must_use]
    pub fn with_state(mut self, state: Option<&str>) -> Self {
        self.state = state.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_declared_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Highest number of runs observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn write_artifacts(&self, invocation: &Invocation<'_>) -> Result<(), RuntimeError> {
        if let Some(parent) = invocation.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(ref output) = self.output {
            std::fs::write(&invocation.output_path, output)?;
        }
        if invocation.command() == "apply" {
            if let Some(ref state) = self.state {
                std::fs::write(&invocation.state_path, state)?;
                invocation
                    .states
                    .put(&invocation.state_key, state.as_bytes())?;
            }
        }
        Ok(())
    }
}

impl Provisioner for MockProvisioner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn declared_inputs(&self, _dir: &Path) -> Result<Option<BTreeSet<String>>, RuntimeError> {
        Ok(self.declared.clone())
    }

    fn run(
        &self,
        invocation: &Invocation<'_>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), RuntimeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        self.runs
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .push(RecordedRun {
                dir: invocation.dir.clone(),
                args: invocation.args.clone(),
                variables: invocation.variables.clone(),
                state_key: invocation.state_key.to_string(),
            });

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let result = self.write_artifacts(invocation).and_then(|()| {
            if let Some(ref output) = self.output {
                for line in output.lines() {
                    sink.output(line);
                }
            }
            if self.fail {
                sink.error("mock provisioning failure");
                Err(RuntimeError::ExecFailed(format!(
                    "mock {} failed",
                    invocation.command()
                )))
            } else {
                Ok(())
            }
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// In-process version-control client. Clone creates an empty directory.
#[derive(Default)]
pub struct MockSourceControl {
    fail_clone: bool,
    fail_checkout: bool,
    clones: Mutex<Vec<(String, String)>>,
    checkouts: Mutex<Vec<Revision>>,
}

impl MockSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_clone(mut self) -> Self {
        self.fail_clone = true;
        self
    }

    #[must_use]
    pub fn failing_checkout(mut self) -> Self {
        self.fail_checkout = true;
        self
    }

    /// `(repo, branch)` of every clone, in call order.
    pub fn clones(&self) -> Vec<(String, String)> {
        self.clones.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn checkouts(&self) -> Vec<Revision> {
        self.checkouts.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl SourceControl for MockSourceControl {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), RuntimeError> {
        self.clones
            .lock()
            .map_err(|e| RuntimeError::VcsFailed(format!("mutex poisoned: {e}")))?
            .push((repo.to_owned(), branch.to_owned()));
        if self.fail_clone {
            return Err(RuntimeError::VcsFailed(format!(
                "mock clone of {repo} failed"
            )));
        }
        std::fs::create_dir_all(dest)?;
        Ok(())
    }

    fn checkout(&self, tree: &Path, revision: &Revision) -> Result<(), RuntimeError> {
        self.checkouts
            .lock()
            .map_err(|e| RuntimeError::VcsFailed(format!("mutex poisoned: {e}")))?
            .push(revision.clone());
        if self.fail_checkout {
            return Err(RuntimeError::VcsFailed(format!(
                "mock checkout of {revision} failed"
            )));
        }
        if !tree.is_dir() {
            return Err(RuntimeError::VcsFailed(format!(
                "{} is not a working tree",
                tree.display()
            )));
        }
        std::fs::write(tree.join(".mock-revision"), revision.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CaptureSink;
    use stackgate_schema::{EnvironmentId, StateKey};
    use stackgate_store::{MemoryStateStore, StateStore};

    fn invocation<'a>(
        dir: &Path,
        command: &str,
        vars: &'a BTreeMap<String, String>,
        states: &'a MemoryStateStore,
    ) -> Invocation<'a> {
        Invocation {
            dir: dir.to_path_buf(),
            variables: vars,
            state_key: StateKey::for_environment(EnvironmentId::new(1)),
            states,
            output_path: dir.join("output"),
            state_path: dir.join("state"),
            args: vec![command.to_owned()],
        }
    }

    #[test]
    fn plan_writes_output_only() {
        let dir = tempfile::tempdir().unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mock = MockProvisioner::new().with_output(Some("plan shows 3 resources to add"));
        let mut sink = CaptureSink::new();
        mock.run(&invocation(dir.path(), "plan", &vars, &states), &mut sink)
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("output")).unwrap(),
            "plan shows 3 resources to add"
        );
        assert!(!dir.path().join("state").exists());
        assert!(sink.contains("3 resources"));
        assert_eq!(mock.run_count(), 1);
    }

    #[test]
    fn apply_writes_and_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mock = MockProvisioner::new().with_state(Some("tfstate-v1"));
        let mut sink = CaptureSink::new();
        mock.run(&invocation(dir.path(), "apply", &vars, &states), &mut sink)
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("state")).unwrap(),
            "tfstate-v1"
        );
        let key = StateKey::for_environment(EnvironmentId::new(1));
        assert_eq!(states.get(&key).unwrap().unwrap(), b"tfstate-v1");
    }

    #[test]
    fn failing_mock_still_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let vars = BTreeMap::new();
        let states = MemoryStateStore::new();
        let mock = MockProvisioner::new().failing();
        let mut sink = CaptureSink::new();
        let err = mock
            .run(&invocation(dir.path(), "plan", &vars, &states), &mut sink)
            .unwrap_err();
        assert!(err.to_string().contains("mock plan failed"));
        assert!(dir.path().join("output").exists());
        assert!(sink.contains("mock provisioning failure"));
    }

    #[test]
    fn mock_source_control_records_calls() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("prod");
        let vcs = MockSourceControl::new();
        vcs.clone_repo("repo.git", "main", &tree).unwrap();
        vcs.checkout(&tree, &Revision::new("abc123")).unwrap();
        assert_eq!(vcs.clones(), vec![("repo.git".to_owned(), "main".to_owned())]);
        assert_eq!(vcs.checkouts(), vec![Revision::new("abc123")]);
        assert!(tree.is_dir());
    }

    #[test]
    fn mock_source_control_failures() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("prod");
        assert!(MockSourceControl::new()
            .failing_clone()
            .clone_repo("r", "b", &tree)
            .is_err());
        let vcs = MockSourceControl::new().failing_checkout();
        vcs.clone_repo("r", "b", &tree).unwrap();
        assert!(vcs.checkout(&tree, &Revision::new("abc")).is_err());
    }
}
