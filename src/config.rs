//! Server configuration - loaded from a YAML file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_LISTEN: &str = "127.0.0.1:12345";
const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the transport listens on
    pub listen: String,
    /// Root of durable state (finished-task records)
    pub save_path: PathBuf,
    /// Directory for default saved-output files (`<save_path>/output` when unset)
    pub output_path: Option<PathBuf>,
    /// Default log filter (RUST_LOG wins)
    pub log_level: String,
    /// Write the on-disk finished-task record
    pub persist_finished: bool,
    /// Broadcast capacity, in chunks, of each output multiplexer
    pub stream_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            save_path: Self::default_save_path(),
            output_path: None,
            log_level: "info".to_string(),
            persist_finished: true,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl Config {
    /// Default save path: platform data dir, or `./.stq`
    pub fn default_save_path() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("stq"))
            .unwrap_or_else(|| PathBuf::from(".stq"))
    }

    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config rooted at a given directory (used by tests and embedders)
    pub fn with_save_path(save_path: impl Into<PathBuf>) -> Self {
        Self {
            save_path: save_path.into(),
            ..Self::default()
        }
    }

    /// Directory for default saved-output files
    pub fn output_dir(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.save_path.join("output"))
    }

    fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            anyhow::bail!("listen address must not be empty");
        }
        if self.stream_capacity == 0 {
            anyhow::bail!("stream_capacity must be greater than zero");
        }
        Ok(())
    }

    /// Create the save and output directories
    pub fn prepare_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.save_path)
            .with_context(|| format!("Failed to create {}", self.save_path.display()))?;
        let output_dir = self.output_dir();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        Ok(())
    }
}
