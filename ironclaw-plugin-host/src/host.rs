//! The host context
//!
//! Built once at startup and handed to whatever exposes plugin operations.
//! Every component receives its collaborators explicitly; there is no
//! global state.

use crate::config::{ConfigError, HostConfig};
use crate::discovery::PluginScanner;
use crate::loader::{LoaderConfig, LoaderError, PluginLoader};
use crate::registry::PluginRegistry;
use crate::reload::{HotReloadError, HotReloadManager};
use crate::result::ExecutionResult;
use crate::sandbox::Sandbox;
use chrono::Utc;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    HotReload(#[from] HotReloadError),
}

/// Registry, sandbox and hot reload manager wired together
pub struct PluginHost {
    config: HostConfig,
    registry: PluginRegistry,
    sandbox: Arc<Sandbox>,
    hot_reload: HotReloadManager,
}

impl PluginHost {
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;

        let loader = PluginLoader::new(LoaderConfig {
            fuel: config.registry.fuel,
            memory_ceiling_bytes: None,
        })?;
        let scanner = PluginScanner::new(Arc::new(loader), config.registry.entry_files.clone());
        let registry = PluginRegistry::new(config.registry.plugins_dir.clone(), scanner);
        let sandbox = Arc::new(Sandbox::new(config.sandbox_config()));
        let hot_reload = HotReloadManager::new(registry.clone(), config.hot_reload_config());

        Ok(Self {
            config,
            registry,
            sandbox,
            hot_reload,
        })
    }

    /// Build from a TOML file
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, HostError> {
        Self::new(HostConfig::load(path)?)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn hot_reload(&self) -> &HotReloadManager {
        &self.hot_reload
    }

    /// Discover plugins on disk; returns the registered names
    pub async fn start(&self) -> Vec<String> {
        let names = self.registry.discover_plugins().await;
        tracing::info!(plugins = ?names, "Plugin host started");
        names
    }

    /// Registry gates, then one isolated invocation
    pub async fn execute_sandboxed(
        &self,
        name: &str,
        validate_first: bool,
        args: &Value,
        timeout_override: Option<u64>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let started_at = Utc::now();

        match self
            .registry
            .prepare_execution(name, validate_first, args)
            .await
        {
            Ok(plugin) => {
                self.sandbox
                    .execute(plugin.as_ref(), args, timeout_override)
                    .await
            }
            Err(e) => ExecutionResult::failure(&e).with_timing(started, started_at),
        }
    }

    /// Stop watching, cancel running workers and unload every plugin
    pub async fn shutdown(&self) {
        self.hot_reload.stop_watching().await;
        for name in self.sandbox.get_active_plugins() {
            self.sandbox.cancel_plugin(&name);
        }
        self.registry.unload_all().await;
        tracing::info!("Plugin host stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WatPlugin;
    use ironclaw_plugin_api::{ExecutionStatus, PluginDescriptor};
    use serde_json::json;
    use tempfile::TempDir;

    fn host(temp: &TempDir) -> PluginHost {
        let mut config = HostConfig::default();
        config.registry.plugins_dir = temp.path().join("plugins");
        config.hot_reload.backup_dir = temp.path().join("backups");
        PluginHost::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_gates_apply_before_sandbox() {
        let temp = TempDir::new().unwrap();
        let host = host(&temp);
        let root = temp.path().join("plugins/echo");
        std::fs::create_dir_all(&root).unwrap();
        let descriptor = PluginDescriptor::builder("echo", "1.0.0").build().unwrap();
        std::fs::write(root.join("plugin.wat"), WatPlugin::new(descriptor).render()).unwrap();

        assert_eq!(host.start().await, vec!["echo"]);

        let result = host.execute_sandboxed("ghost", true, &json!({}), None).await;
        assert_eq!(result.metadata["error_kind"], "not_found");
        assert!(host.sandbox().get_active_plugins().is_empty());

        host.registry().disable_plugin("echo").await;
        let result = host.execute_sandboxed("echo", true, &json!({}), None).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.metadata["error_kind"], "disabled");

        host.shutdown().await;
        assert!(host.registry().is_empty().await);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = HostConfig::default();
        config.registry.entry_files.clear();
        assert!(matches!(PluginHost::new(config), Err(HostError::Config(_))));
    }

    #[test]
    fn test_from_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plugins.toml");
        let plugins_dir = temp.path().join("custom");
        std::fs::write(
            &path,
            format!("[registry]\nplugins_dir = {:?}\n", plugins_dir.display().to_string()),
        )
        .unwrap();

        let host = PluginHost::from_config_file(&path).unwrap();
        assert_eq!(host.registry().plugins_dir(), plugins_dir.as_path());

        assert!(matches!(
            PluginHost::from_config_file(temp.path().join("missing.toml")),
            Err(HostError::Config(_))
        ));
    }
}
