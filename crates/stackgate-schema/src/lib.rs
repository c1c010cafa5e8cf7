//! Domain types and configuration for stackgate.
//!
//! This crate defines the schema layer: `Environment` records with their
//! id-keyed `ChangeLog`, the `Change` and `ChangeStatus` types, the `Action`
//! descriptor for plan/apply requests, identifier newtypes, TOML environment
//! definitions, and the process `Config`.

pub mod action;
pub mod change;
pub mod config;
pub mod environment;
pub mod types;

pub use action::{Action, Command};
pub use change::{Change, ChangeLog, ChangeStatus};
pub use config::{Config, ProvisionerSection, ServerSection, VcsSection, DEFAULT_CONFIG_FILE};
pub use environment::{
    parse_environments_file, parse_environments_str, validate_env_name, validate_subpath,
    Environment, EnvironmentSummary,
};
pub use types::{ChangeId, EnvironmentId, Revision, StateKey};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("invalid environment path '{0}': must be relative and stay inside the checkout")]
    InvalidPath(String),
    #[error("invalid variable name: '{0}'")]
    InvalidVariable(String),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("duplicate {0}")]
    Duplicate(String),
    #[error("change {0} is not in the change log")]
    UnknownChange(ChangeId),
    #[error("invalid configuration: {0}")]
    Config(String),
}
