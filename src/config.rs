//! Storage configuration
//!
//! Resolves where the cache state file and the file tracker's working
//! directory live. Every field has a default so an empty TOML document (or no
//! configuration at all) yields a usable layout under the platform data dir.

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the storage root
pub const HOME_ENV_VAR: &str = "MEDIAFLOW_HOME";

/// Get the default data directory for cache and artifact state
pub fn default_data_dir() -> Result<PathBuf> {
    ProjectDirs::from("com", "mediaflow", "mediaflow")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Layout of the on-disk state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Package-local data directory supplied by the host
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Directory (relative to `root`) holding the cache state file
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Cache state file name
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Working directory (relative to `root`) for temp artifacts
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// File tracker state file name, stored inside `temp_dir`
    #[serde(default = "default_file_state_file")]
    pub file_state_file: String,
}

fn default_root() -> PathBuf {
    default_data_dir().unwrap_or_else(|_| PathBuf::from(".mediaflow"))
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("workflow-cache")
}

fn default_state_file() -> String {
    "workflow-state.json".to_string()
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_file_state_file() -> String {
    "file-state.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::with_root(default_root())
    }
}

impl StorageConfig {
    /// Default layout under an explicit root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache_dir: default_cache_dir(),
            state_file: default_state_file(),
            temp_dir: default_temp_dir(),
            file_state_file: default_file_state_file(),
        }
    }

    /// Default layout, rooted at `$MEDIAFLOW_HOME` when set
    pub fn from_env() -> Self {
        match std::env::var_os(HOME_ENV_VAR) {
            Some(root) if !root.is_empty() => Self::with_root(PathBuf::from(root)),
            _ => Self::default(),
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse storage configuration")
    }

    /// Load a TOML configuration file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Directory holding the cache state file
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.cache_dir)
    }

    /// Full path of the cache state file
    pub fn state_path(&self) -> PathBuf {
        self.cache_dir().join(&self.state_file)
    }

    /// Working directory for temp artifacts
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(&self.temp_dir)
    }

    /// Full path of the file tracker state file
    pub fn file_state_path(&self) -> PathBuf {
        self.temp_dir().join(&self.file_state_file)
    }
}
