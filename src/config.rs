use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

use crate::pipeline::scheduler::{DEFAULT_TASK_TIMEOUT, DEFAULT_WORKERS};
use crate::pipeline::SchedulerOptions;
use crate::store::DEFAULT_OUTPUT_DIR;

/// Central configuration for reconflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    /// Credential name to secret. Blank secrets count as unset.
    pub api_keys: BTreeMap<String, String>,
    /// Tool name to binary path, for tools not on `PATH`.
    pub tools: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub task_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT.as_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let api_keys = ["shodan", "uncover", "openai"]
            .into_iter()
            .map(|name| (name.to_string(), String::new()))
            .collect();

        Self {
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            api_keys,
            tools: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from the standard config directory
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path())
    }

    /// Load configuration from `path`, writing the defaults there if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Get the path to the config file
    pub fn get_config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("reconflow");
        path.push("config.json");
        path
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(anyhow::anyhow!("pipeline.workers must be greater than 0"));
        }

        if self.pipeline.task_timeout_secs == 0 {
            return Err(anyhow::anyhow!("pipeline.task_timeout_secs must be greater than 0"));
        }

        if self.storage.output_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("storage.output_dir must not be empty"));
        }

        Ok(())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.pipeline.workers,
            task_timeout: Duration::from_secs(self.pipeline.task_timeout_secs),
        }
    }

    /// Non-blank credentials
    pub fn credentials(&self) -> HashMap<String, String> {
        self.api_keys
            .iter()
            .filter(|(_, secret)| !secret.trim().is_empty())
            .map(|(name, secret)| (name.clone(), secret.clone()))
            .collect()
    }

    pub fn tool_paths(&self) -> HashMap<String, PathBuf> {
        self.tools
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect()
    }
}
