//! Configuration parsing for the run harness.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Root holding `<owner>/<project>` directories.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Number of accelerator devices in the pool. Detected with `nvidia-smi` when unset.
    #[serde(default)]
    pub device_count: Option<u32>,
    /// Program used to execute the entry script.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// File name of the entry script inside a run workspace.
    #[serde(default = "default_entry_script")]
    pub entry_script: String,
    /// File name of the optional configuration document inside a run workspace.
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// Empty marker file written in each copied artifact category. Empty disables it.
    #[serde(default = "default_package_marker")]
    pub package_marker: String,
    /// Environment variables that carry the visible device list to a child.
    #[serde(default = "default_visible_device_vars")]
    pub visible_device_vars: Vec<String>,
    /// Extra environment variables passed to every child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            device_count: None,
            interpreter: default_interpreter(),
            entry_script: default_entry_script(),
            config_file: default_config_file(),
            package_marker: default_package_marker(),
            visible_device_vars: default_visible_device_vars(),
            env: BTreeMap::new(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_interpreter() -> String {
    "python".to_string()
}

fn default_entry_script() -> String {
    "engine.py".to_string()
}

fn default_config_file() -> String {
    "config.yaml".to_string()
}

fn default_package_marker() -> String {
    "__init__.py".to_string()
}

fn default_visible_device_vars() -> Vec<String> {
    vec![
        "CUDA_VISIBLE_DEVICES".to_string(),
        "NVIDIA_VISIBLE_DEVICES".to_string(),
    ]
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.harness;
        if h.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("interpreter must not be empty".into()));
        }
        for (key, name) in [("entry_script", &h.entry_script), ("config_file", &h.config_file)] {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be a plain file name, got {name:?}"
                )));
            }
        }
        if h.entry_script == h.config_file {
            return Err(ConfigError::Invalid(
                "entry_script and config_file must differ".into(),
            ));
        }
        Ok(())
    }

    /// Builder-style override of the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.harness.workspace_root = root.into();
        self
    }

    /// Builder-style override of the device count.
    #[must_use]
    pub fn with_device_count(mut self, count: u32) -> Self {
        self.harness.device_count = Some(count);
        self
    }

    /// Path of the cross-process lock file used by the CLI.
    #[must_use]
    pub fn host_lock_path(&self) -> PathBuf {
        self.harness.workspace_root.join(".harness.lock")
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
