use crate::change::{ChangeLog, ChangeStatus};
use crate::types::EnvironmentId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

/// A named infrastructure target bound to a source tree and a variable set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    /// Source repository reference handed to the version-control client.
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Subdirectory of the checked-out tree the engine runs in.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub changes: ChangeLog,
}

/// Compact view of an environment for listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EnvironmentSummary {
    pub id: EnvironmentId,
    pub name: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
    pub auto_apply: bool,
    pub changes: usize,
    pub latest_status: Option<ChangeStatus>,
}

impl From<&Environment> for EnvironmentSummary {
    fn from(env: &Environment) -> Self {
        Self {
            id: env.id,
            name: env.name.clone(),
            repo: env.repo.clone(),
            branch: env.branch.clone(),
            path: env.path.clone(),
            auto_apply: env.auto_apply,
            changes: env.changes.len(),
            latest_status: env.changes.latest().map(|c| c.status),
        }
    }
}

fn default_branch() -> String {
    "master".to_owned()
}

impl Environment {
    pub fn new(id: EnvironmentId, name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            repo: repo.into(),
            branch: default_branch(),
            path: String::new(),
            auto_apply: false,
            variables: BTreeMap::new(),
            changes: ChangeLog::new(),
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_env_name(&self.name)?;
        validate_subpath(&self.path)?;
        if self.repo.trim().is_empty() {
            return Err(SchemaError::EmptyField("repo"));
        }
        if self.branch.trim().is_empty() {
            return Err(SchemaError::EmptyField("branch"));
        }
        if let Some(name) = self.variables.keys().find(|k| k.trim().is_empty()) {
            return Err(SchemaError::InvalidVariable(name.clone()));
        }
        Ok(())
    }
}

/// Environment names double as working-tree directory names, so they are
/// restricted to `[A-Za-z0-9_-]{1,64}`.
pub fn validate_env_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > 64 {
        return Err(SchemaError::InvalidName(
            "environment name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SchemaError::InvalidName(
            "environment name must match [a-zA-Z0-9_-]".to_owned(),
        ));
    }
    Ok(())
}

pub fn validate_subpath(path: &str) -> Result<(), SchemaError> {
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(SchemaError::InvalidPath(path.to_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentFile {
    #[serde(default)]
    environment: Vec<EnvironmentDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentDefinition {
    id: EnvironmentId,
    name: String,
    repo: String,
    #[serde(default = "default_branch")]
    branch: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    auto_apply: bool,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

impl From<EnvironmentDefinition> for Environment {
    fn from(def: EnvironmentDefinition) -> Self {
        Self {
            id: def.id,
            name: def.name,
            repo: def.repo,
            branch: def.branch,
            path: def.path,
            auto_apply: def.auto_apply,
            variables: def.variables,
            changes: ChangeLog::new(),
        }
    }
}

/// Parse `[[environment]]` tables from TOML. Every definition is validated and
/// ids and names must be unique within the file.
pub fn parse_environments_str(input: &str) -> Result<Vec<Environment>, SchemaError> {
    let file: EnvironmentFile = toml::from_str(input)?;
    let envs: Vec<Environment> = file.environment.into_iter().map(Into::into).collect();
    for (i, env) in envs.iter().enumerate() {
        env.validate()?;
        if envs[..i].iter().any(|other| other.id == env.id) {
            return Err(SchemaError::Duplicate(format!("environment id {}", env.id)));
        }
        if envs[..i].iter().any(|other| other.name == env.name) {
            return Err(SchemaError::Duplicate(format!(
                "environment name '{}'",
                env.name
            )));
        }
    }
    Ok(envs)
}

pub fn parse_environments_file(path: impl AsRef<Path>) -> Result<Vec<Environment>, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_environments_str(&content)
}
