use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "stackgate.toml";

/// Process configuration, loaded from `stackgate.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Working trees are checked out under `<root_folder>/<environment name>`.
    #[serde(default = "default_root_folder")]
    pub root_folder: PathBuf,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub provisioner: ProvisionerSection,
    #[serde(default)]
    pub vcs: VcsSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerSection {
    #[serde(default = "default_provisioner_backend")]
    pub backend: String,
    #[serde(default = "default_provisioner_binary")]
    pub binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VcsSection {
    #[serde(default = "default_vcs_backend")]
    pub backend: String,
    #[serde(default = "default_vcs_binary")]
    pub binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_root_folder() -> PathBuf {
    PathBuf::from("/var/lib/stackgate/work")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/stackgate/store")
}

fn default_provisioner_backend() -> String {
    "terraform".to_owned()
}

fn default_provisioner_binary() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_vcs_backend() -> String {
    "git".to_owned()
}

fn default_vcs_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_listen() -> String {
    "127.0.0.1:8420".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_folder: default_root_folder(),
            store_dir: default_store_dir(),
            provisioner: ProvisionerSection::default(),
            vcs: VcsSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl Default for ProvisionerSection {
    fn default() -> Self {
        Self {
            backend: default_provisioner_backend(),
            binary: default_provisioner_binary(),
        }
    }
}

impl Default for VcsSection {
    fn default() -> Self {
        Self {
            backend: default_vcs_backend(),
            binary: default_vcs_binary(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    pub fn parse_str(input: &str) -> Result<Self, SchemaError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// Load `path` if given, otherwise `./stackgate.toml` if present,
    /// otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SchemaError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.root_folder.as_os_str().is_empty() {
            return Err(SchemaError::EmptyField("root_folder"));
        }
        if self.store_dir.as_os_str().is_empty() {
            return Err(SchemaError::EmptyField("store_dir"));
        }
        if self.root_folder == self.store_dir {
            return Err(SchemaError::Config(
                "root_folder and store_dir must differ: working trees are deleted after each run"
                    .to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.provisioner.backend, "terraform");
        assert_eq!(config.vcs.binary, PathBuf::from("git"));
    }

    #[test]
    fn full_config_parses() {
        let input = r#"
root_folder = "/srv/work"
store_dir = "/srv/store"

[provisioner]
backend = "mock"
binary = "/usr/local/bin/terraform"

[vcs]
backend = "git"

[server]
listen = "0.0.0.0:9000"
"#;
        let config = Config::parse_str(input).unwrap();
        assert_eq!(config.root_folder, PathBuf::from("/srv/work"));
        assert_eq!(config.provisioner.backend, "mock");
        assert_eq!(config.vcs.binary, PathBuf::from("git"));
        assert_eq!(config.server.listen, "0.0.0.0:9000");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse_str("persistence = \"consul\"").is_err());
    }

    #[test]
    fn root_and_store_must_differ() {
        let input = "root_folder = \"/srv\"\nstore_dir = \"/srv\"\n";
        assert!(matches!(
            Config::parse_str(input),
            Err(SchemaError::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackgate.toml");
        fs::write(&path, "store_dir = \"/tmp/sg-store\"\n").unwrap();
        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/sg-store"));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
