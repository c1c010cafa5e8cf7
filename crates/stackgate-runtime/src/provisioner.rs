use crate::output::OutputSink;
use crate::RuntimeError;
use stackgate_schema::StateKey;
use stackgate_store::StateStore;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One fully bound provisioning-engine run.
pub struct Invocation<'a> {
    /// Directory the engine runs in (checkout root joined with the environment path).
    pub dir: PathBuf,
    pub variables: &'a BTreeMap<String, String>,
    pub state_key: StateKey,
    pub states: &'a dyn StateStore,
    /// Human-readable output artifact, read back by the pipeline.
    pub output_path: PathBuf,
    /// State artifact, read back by the pipeline after an apply.
    pub state_path: PathBuf,
    /// Command tokens, e.g. `["plan"]` or `["apply"]`.
    pub args: Vec<String>,
}

impl Invocation<'_> {
    pub fn command(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }
}

pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Input variable names declared by the configuration in `dir`, or `None`
    /// when the engine cannot tell.
    fn declared_inputs(&self, dir: &Path) -> Result<Option<BTreeSet<String>>, RuntimeError>;

    fn run(
        &self,
        invocation: &Invocation<'_>,
        sink: &mut dyn OutputSink,
    ) -> Result<(), RuntimeError>;
}

pub fn select_provisioner(
    name: &str,
    binary: &Path,
) -> Result<Arc<dyn Provisioner>, RuntimeError> {
    match name {
        "terraform" => Ok(Arc::new(
            crate::terraform::TerraformProvisioner::with_binary(binary),
        )),
        "mock" => Ok(Arc::new(crate::mock::MockProvisioner::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
