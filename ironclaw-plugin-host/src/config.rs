//! Host configuration
//!
//! Loaded from TOML; every field has a default, so an empty file (or none at
//! all) yields a working host.
//!
//! ```toml
//! [registry]
//! plugins_dir = "plugins"
//!
//! [sandbox]
//! poll_interval_ms = 100
//! kill_grace_ms = 1000
//!
//! [hot_reload]
//! backup_dir = "data/plugin_backups"
//! debounce_ms = 1000
//! keep_backups = 5
//! ```

use crate::reload::HotReloadConfig;
use crate::sandbox::{default_worker_program, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub registry: RegistrySection,
    pub sandbox: SandboxSection,
    pub hot_reload: HotReloadSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Root holding one directory per plugin
    pub plugins_dir: PathBuf,
    /// Accepted entry file names, exactly one of which a plugin directory holds
    pub entry_files: Vec<String>,
    /// Wasm fuel per invocation; unlimited when absent
    pub fuel: Option<u64>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            entry_files: vec!["plugin.wasm".to_string(), "plugin.wat".to_string()],
            fuel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub poll_interval_ms: u64,
    pub kill_grace_ms: u64,
    /// Worker executable; defaults to `plugin-worker` next to the host binary
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            kill_grace_ms: 1000,
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadSection {
    pub backup_dir: PathBuf,
    pub debounce_ms: u64,
    pub keep_backups: usize,
}

impl Default for HotReloadSection {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("data/plugin_backups"),
            debounce_ms: 1000,
            keep_backups: 5,
        }
    }
}

impl HostConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform config location, e.g. `~/.config/ironclaw/plugins.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("ironclaw")
            .join("plugins.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.entry_files.is_empty() {
            return Err(ConfigError::Invalid(
                "registry.entry_files must not be empty".into(),
            ));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            poll_interval: Duration::from_millis(self.sandbox.poll_interval_ms),
            kill_grace: Duration::from_millis(self.sandbox.kill_grace_ms),
            worker_program: self
                .sandbox
                .worker_program
                .clone()
                .unwrap_or_else(default_worker_program),
            worker_args: self.sandbox.worker_args.clone(),
            fuel: self.registry.fuel,
        }
    }

    pub fn hot_reload_config(&self) -> HotReloadConfig {
        HotReloadConfig {
            backup_dir: self.hot_reload.backup_dir.clone(),
            debounce: Duration::from_millis(self.hot_reload.debounce_ms),
            keep_backups: self.hot_reload.keep_backups,
        }
    }
}
