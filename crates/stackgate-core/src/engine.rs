use crate::executor::Executor;
use crate::notify::ChangeNotifier;
use crate::pipeline::Pipeline;
use crate::registry::GateRegistry;
use crate::CoreError;
use stackgate_runtime::{select_provisioner, select_vcs, OutputSink};
use stackgate_schema::{Action, Change, ChangeId, Config, Environment, EnvironmentId, Revision};
use stackgate_store::{
    EnvironmentStore, FileEnvironmentStore, FileStateStore, IntegrityReport, StoreLayout,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Front-end facade: environment registration and inspection plus the
/// plan/apply entry points, all backed by one `Pipeline`.
pub struct Engine {
    layout: Option<StoreLayout>,
    pipeline: Pipeline,
}

impl Engine {
    /// Open (and initialize if needed) the store named by `config` and wire
    /// up the configured backends.
    pub fn from_config(config: &Config) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(&config.store_dir);
        layout.initialize()?;

        let vcs = select_vcs(&config.vcs.backend, &config.vcs.binary)?;
        let provisioner =
            select_provisioner(&config.provisioner.backend, &config.provisioner.binary)?;
        if !provisioner.available() {
            warn!(
                "provisioner '{}' ({}) is not available; runs will fail",
                provisioner.name(),
                config.provisioner.binary.display()
            );
        }
        debug!(
            vcs = vcs.name(),
            provisioner = provisioner.name(),
            "store at {}",
            layout.root().display()
        );

        let executor = Executor::new(
            &config.root_folder,
            vcs,
            provisioner,
            Arc::new(FileStateStore::new(layout.clone())),
        );
        let pipeline = Pipeline::new(
            Arc::new(FileEnvironmentStore::new(layout.clone())),
            GateRegistry::global(),
            Arc::new(ChangeNotifier::new()),
            executor,
        )
        .with_process_locks(layout.clone());

        Ok(Self {
            layout: Some(layout),
            pipeline,
        })
    }

    /// Engine over an already assembled pipeline, without an on-disk layout.
    pub fn with_pipeline(pipeline: Pipeline) -> Self {
        Self {
            layout: None,
            pipeline,
        }
    }

    pub fn layout(&self) -> Option<&StoreLayout> {
        self.layout.as_ref()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        self.pipeline.notifier()
    }

    fn store(&self) -> &dyn EnvironmentStore {
        self.pipeline.store().as_ref()
    }

    /// Store a new environment. Ids and names must be unique.
    pub fn register(&self, env: &Environment) -> Result<(), CoreError> {
        env.validate()?;
        if self.store().exists(env.id) {
            return Err(CoreError::AlreadyExists(env.id));
        }
        if let Some(existing) = self.store().list()?.into_iter().find(|e| e.name == env.name) {
            return Err(CoreError::NameConflict {
                name: env.name.clone(),
                existing: existing.id,
            });
        }
        self.store().put(env)?;
        info!(env_id = %env.id, "registered environment '{}'", env.name);
        Ok(())
    }

    /// Register every environment, stopping at the first failure.
    pub fn import(&self, envs: &[Environment]) -> Result<usize, CoreError> {
        for env in envs {
            self.register(env)?;
        }
        Ok(envs.len())
    }

    /// Smallest id not used by any stored environment.
    pub fn next_id(&self) -> Result<EnvironmentId, CoreError> {
        let max = self
            .store()
            .list()?
            .iter()
            .map(|e| e.id.get())
            .max()
            .unwrap_or(0);
        Ok(EnvironmentId::new(max + 1))
    }

    pub fn list(&self) -> Result<Vec<Environment>, CoreError> {
        Ok(self.store().list()?)
    }

    pub fn get(&self, id: EnvironmentId) -> Result<Environment, CoreError> {
        Ok(self.store().get(id)?)
    }

    pub fn plan(
        &self,
        id: EnvironmentId,
        revision: Revision,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        self.pipeline.plan_revision(id, revision, sink)
    }

    /// Apply `change_id`, or the most recent change when `None`.
    pub fn apply(
        &self,
        id: EnvironmentId,
        change_id: Option<ChangeId>,
        sink: &mut dyn OutputSink,
    ) -> Result<Change, CoreError> {
        match change_id {
            Some(change_id) => self.pipeline.run_existing(id, change_id, &Action::apply(), sink),
            None => self
                .pipeline
                .run_change_with_sink(id, None, &Action::apply(), sink),
        }
    }

    pub fn verify_store(&self) -> Result<Option<IntegrityReport>, CoreError> {
        self.layout
            .as_ref()
            .map(stackgate_store::verify_store_integrity)
            .transpose()
            .map_err(CoreError::from)
    }
}
