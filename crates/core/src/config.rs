//! Project configuration, read from `shipyard.yaml`.
//!
//! ```yaml
//! source:
//!   destination: dist
//!   include: [secrets.txt]
//!   exclude: [data/raw]
//! storage:
//!   provider: box
//!   path: runs/{git}
//!   credentials: ~/.auth/box.yaml
//! batch:
//!   job_queue: pipelines
//!   repository: 1234.dkr.ecr.us-east-1.amazonaws.com/project
//!   container_properties: { vcpus: 1, memory: 2048 }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fileset::{PolicyError, SelectionPolicy};
use crate::job::ContainerSpec;
use crate::remote::DEFAULT_CHUNK_THRESHOLD;
use crate::Time;

/// Name of the configuration file at the project root.
pub const CONFIG_FILE: &str = "shipyard.yaml";

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the file
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed YAML or unknown values
    #[error("invalid configuration in {}: {source}", .path.display())]
    Yaml {
        /// File being parsed
        path: PathBuf,
        /// Underlying error
        source: serde_yaml::Error,
    },

    /// Invalid include/exclude rules
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Root of `shipyard.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShipyardConfig {
    /// Source selection settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Where artifacts and outputs are uploaded
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote batch execution, if used
    #[serde(default)]
    pub batch: Option<BatchConfig>,
}

impl ShipyardConfig {
    /// Load `shipyard.yaml` from `project_root`, falling back to defaults when
    /// the file does not exist. Selection rules are validated eagerly.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = project_root.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Load from an explicit file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        config.source.policy()?;
        Ok(config)
    }
}

/// `source` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Staging directory, relative to the project root
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Artifact name; defaults to the project directory name
    #[serde(default)]
    pub name: Option<String>,

    /// Always package these paths
    #[serde(default)]
    pub include: Vec<PathBuf>,

    /// Never package these paths
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            name: None,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl SourceConfig {
    /// Validated selection policy.
    pub fn policy(&self) -> Result<SelectionPolicy, PolicyError> {
        SelectionPolicy::new(&self.include, &self.exclude)
    }
}

fn default_destination() -> PathBuf {
    PathBuf::from("dist")
}

/// Storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Box cloud storage
    Box,
    /// A directory on the local filesystem
    Local,
}

/// `storage` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend; `None` disables uploads
    #[serde(default)]
    pub provider: Option<Provider>,

    /// Target path template, supports `{git}` and `{timestamp}`
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Credentials file for providers that need one
    #[serde(default)]
    pub credentials: Option<PathBuf>,

    /// Store directory for the `local` provider, relative to the project
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// Replace remote objects that already exist
    #[serde(default)]
    pub replace: bool,

    /// Files at or above this size use chunked uploads
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: None,
            path: default_storage_path(),
            credentials: None,
            local_root: default_local_root(),
            replace: false,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        }
    }
}

impl StorageConfig {
    /// Expand the path template.
    ///
    /// `{git}` becomes the commit hash, or `unknown` outside a repository.
    pub fn render_path(&self, git_hash: Option<&str>, now: Time) -> String {
        self.path
            .replace("{git}", git_hash.unwrap_or("unknown"))
            .replace("{timestamp}", &now.format("%Y%m%dT%H%M%SZ").to_string())
    }

    /// Credentials path with a leading `~` expanded.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials.as_deref().map(expand_home)
    }
}

fn default_storage_path() -> String {
    "runs/{git}".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from(".shipyard/store")
}

fn default_chunk_threshold() -> u64 {
    DEFAULT_CHUNK_THRESHOLD
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// `batch` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Queue jobs are submitted to
    pub job_queue: String,

    /// Image repository the project image is pushed to
    pub repository: String,

    /// Region override
    #[serde(default)]
    pub region_name: Option<String>,

    /// Job definition name; defaults to the artifact name
    #[serde(default)]
    pub job_definition: Option<String>,

    /// Container properties for the job definition
    #[serde(default)]
    pub container_properties: ContainerSpec,

    /// Command run for each job, `{name}` is the job name
    #[serde(default = "default_command")]
    pub command: Vec<String>,
}

fn default_command() -> Vec<String> {
    ["ploomber", "task", "{name}"].map(String::from).to_vec()
}
