//! Change orchestration for stackgate environments.
//!
//! This crate ties together the environment store, the version-control and
//! provisioning backends, and the output adapter into the `Pipeline`, which
//! runs one plan or apply at a time per environment behind a `Gate`. It also
//! provides the change notification channel, cross-process store locking, and
//! the `Engine` facade the front ends are built on.

pub mod concurrency;
pub mod engine;
pub mod executor;
pub mod notify;
pub mod pipeline;
pub mod registry;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use engine::Engine;
pub use executor::{ExecError, Executor, WorkTree};
pub use notify::ChangeNotifier;
pub use pipeline::Pipeline;
pub use registry::{Gate, GateGuard, GateRegistry};

use stackgate_schema::{ChangeId, EnvironmentId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] stackgate_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] stackgate_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] stackgate_runtime::RuntimeError),
    #[error("plan requires a change")]
    MissingChange,
    #[error("environment {0} has no changes to apply")]
    NoChanges(EnvironmentId),
    #[error("change {change} does not belong to environment {env}")]
    UnknownChange { env: EnvironmentId, change: ChangeId },
    #[error("failed to read artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("environment {0} already exists")]
    AlreadyExists(EnvironmentId),
    #[error("environment name '{name}' is already used by environment {existing}")]
    NameConflict { name: String, existing: EnvironmentId },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
