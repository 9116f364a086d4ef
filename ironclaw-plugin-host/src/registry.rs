//! Plugin registry with dependency checks and reload support
//!
//! Provides a thread-safe registry owning exactly one live instance per
//! plugin name, with discovery, enable/disable policy and validated
//! dispatch.

use crate::discovery::PluginScanner;
use crate::error::PluginError;
use crate::plugin::Plugin;
use crate::result::ExecutionResult;
use crate::wasm::WasmPlugin;
use chrono::Utc;
use ironclaw_plugin_api::PluginDescriptor;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// A thread-safe registry for managing loaded plugins
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    /// Serialises register/unload/reload so teardown and install never interleave
    lifecycle: Arc<Mutex<()>>,
    scanner: Arc<PluginScanner>,
    plugins_dir: PathBuf,
}

struct RegistryInner {
    /// Plugins indexed by name
    plugins: HashMap<String, PluginEntry>,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
    source: Option<SourceInfo>,
}

/// Where a discovered plugin was loaded from
#[derive(Clone)]
struct SourceInfo {
    path: PathBuf,
    digest: String,
    bytes: Arc<[u8]>,
}

impl SourceInfo {
    fn of(plugin: &WasmPlugin) -> Self {
        Self {
            path: plugin.source_path().to_path_buf(),
            digest: plugin.digest().to_string(),
            bytes: plugin.source(),
        }
    }
}

/// Descriptor and state of a registered plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub descriptor: PluginDescriptor,
    pub enabled: bool,
    pub source_path: Option<PathBuf>,
    pub source_digest: Option<String>,
}

impl PluginRegistry {
    /// Create an empty registry rooted at `plugins_dir`
    pub fn new(plugins_dir: impl Into<PathBuf>, scanner: PluginScanner) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                plugins: HashMap::new(),
            })),
            lifecycle: Arc::new(Mutex::new(())),
            scanner: Arc::new(scanner),
            plugins_dir: plugins_dir.into(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn scanner(&self) -> &PluginScanner {
        &self.scanner
    }

    /// Scan the plugins directory and register everything found
    ///
    /// Plugins are registered in dependency order; a plugin that fails to
    /// load or whose dependencies never appear is logged and skipped.
    pub async fn discover_plugins(&self) -> Vec<String> {
        if !self.plugins_dir.exists() {
            if let Err(e) = tokio::fs::create_dir_all(&self.plugins_dir).await {
                tracing::warn!(dir = %self.plugins_dir.display(), error = %e, "Failed to create plugins directory");
            } else {
                tracing::info!(dir = %self.plugins_dir.display(), "Created plugins directory");
            }
            return Vec::new();
        }

        let scanner = Arc::clone(&self.scanner);
        let dir = self.plugins_dir.clone();
        let scan = tokio::task::spawn_blocking(move || scanner.scan_directory(&dir)).await;

        let result = match scan {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(dir = %self.plugins_dir.display(), error = %e, "Plugin discovery failed");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Plugin discovery task failed");
                return Vec::new();
            }
        };

        tracing::debug!(
            dir = %self.plugins_dir.display(),
            found = result.total_found(),
            loaded = result.plugins.len(),
            "Scanned plugins directory"
        );
        if !result.is_success() {
            for (path, error) in &result.failures {
                tracing::warn!(path = %path.display(), error = %error, "Skipping plugin");
            }
        }

        let _guard = self.lifecycle.lock().await;
        let mut pending = result.plugins;
        let mut discovered = Vec::new();

        loop {
            let mut deferred = Vec::new();
            let before = pending.len();

            for plugin in pending {
                if self.check_dependencies(plugin.descriptor()).await.is_ok() {
                    let name = plugin.name().to_string();
                    let source = SourceInfo::of(&plugin);
                    match self.install(Arc::new(plugin), Some(source)).await {
                        Ok(()) => discovered.push(name),
                        Err(e) => tracing::warn!(plugin = %name, error = %e, "Failed to register plugin"),
                    }
                } else {
                    deferred.push(plugin);
                }
            }

            pending = deferred;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for plugin in &pending {
            if let Err(e) = self.check_dependencies(plugin.descriptor()).await {
                tracing::warn!(plugin = %plugin.name(), error = %e, "Skipping plugin");
            }
        }

        tracing::info!(count = discovered.len(), "Plugin discovery complete");
        discovered
    }

    /// Register a plugin instance, replacing any instance with the same name
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let _guard = self.lifecycle.lock().await;
        self.install(plugin, None).await
    }

    /// Unload a plugin by name
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        if self.teardown(name).await {
            true
        } else {
            tracing::warn!(plugin = %name, "Cannot unload unknown plugin");
            false
        }
    }

    /// Unload every registered plugin
    pub async fn unload_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let names: Vec<String> = self.inner.read().await.plugins.keys().cloned().collect();
        for name in names {
            self.teardown(&name).await;
        }
    }

    /// Reload a plugin from `<plugins_dir>/<name>`
    ///
    /// Works whether or not `name` is currently registered. On failure the
    /// name is left unregistered.
    pub async fn reload_plugin(&self, name: &str) -> bool {
        let _guard = self.lifecycle.lock().await;

        let plugin_dir = self.plugins_dir.join(name);
        if !plugin_dir.is_dir() {
            tracing::warn!(plugin = %name, dir = %plugin_dir.display(), "No plugin source to reload from");
            return false;
        }

        self.teardown(name).await;

        let scanner = Arc::clone(&self.scanner);
        let plugin_name = name.to_string();
        let loaded =
            tokio::task::spawn_blocking(move || scanner.load_plugin(&plugin_name, &plugin_dir))
                .await;

        let plugin = match loaded {
            Ok(Ok(plugin)) => plugin,
            Ok(Err(e)) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to reload plugin");
                return false;
            }
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Plugin reload task failed");
                return false;
            }
        };

        let source = SourceInfo::of(&plugin);
        match self.install(Arc::new(plugin), Some(source)).await {
            Ok(()) => {
                tracing::info!(plugin = %name, "Plugin reloaded");
                true
            }
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to reload plugin");
                false
            }
        }
    }

    /// Execute a plugin in-process, returning a terminal result in all cases
    pub async fn execute_plugin(
        &self,
        name: &str,
        validate_first: bool,
        args: &Value,
    ) -> ExecutionResult {
        let started = Instant::now();
        let started_at = Utc::now();

        let plugin = match self.prepare_execution(name, validate_first, args).await {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::debug!(plugin = %name, error = %e, "Execution rejected");
                return ExecutionResult::failure(&e).with_timing(started, started_at);
            }
        };

        // A separate task keeps a panicking plugin from unwinding into the caller.
        let task_plugin = Arc::clone(&plugin);
        let task_args = args.clone();
        let outcome = tokio::spawn(async move { task_plugin.execute(&task_args).await }).await;

        let error = match outcome {
            Ok(Ok(result)) if result.completed_at.is_some() => return result,
            Ok(Ok(result)) => return result.with_timing(started, started_at),
            Ok(Err(e)) => e,
            Err(e) => PluginError::Execution(format!("plugin panicked: {e}")),
        };

        tracing::warn!(plugin = %name, error = %error, "Plugin execution failed");
        plugin.on_error(&error).await;
        ExecutionResult::failure(&error).with_timing(started, started_at)
    }

    /// Apply the not-found, disabled and validation gates
    ///
    /// Returns the live instance when the invocation may proceed.
    pub async fn prepare_execution(
        &self,
        name: &str,
        validate_first: bool,
        args: &Value,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        let plugin = {
            let inner = self.inner.read().await;
            let entry = inner
                .plugins
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            if !entry.enabled {
                return Err(PluginError::Disabled(name.to_string()));
            }
            Arc::clone(&entry.plugin)
        };

        if validate_first {
            match plugin.validate(args).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(PluginError::Validation(format!(
                        "arguments rejected by plugin {name}"
                    )))
                }
                Err(e) => return Err(PluginError::Validation(e.to_string())),
            }
        }

        Ok(plugin)
    }

    pub async fn enable_plugin(&self, name: &str) -> bool {
        self.set_enabled(name, true).await
    }

    pub async fn disable_plugin(&self, name: &str) -> bool {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.plugins.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                tracing::info!(plugin = %name, enabled, "Plugin state changed");
                true
            }
            None => false,
        }
    }

    /// Descriptor and state for every plugin, ordered by name
    pub async fn list_plugins(&self, enabled_only: bool) -> BTreeMap<String, PluginInfo> {
        let inner = self.inner.read().await;
        inner
            .plugins
            .iter()
            .filter(|(_, entry)| entry.enabled || !enabled_only)
            .map(|(name, entry)| {
                let info = PluginInfo {
                    descriptor: entry.plugin.descriptor().clone(),
                    enabled: entry.enabled,
                    source_path: entry.source.as_ref().map(|s| s.path.clone()),
                    source_digest: entry.source.as_ref().map(|s| s.digest.clone()),
                };
                (name.clone(), info)
            })
            .collect()
    }

    /// Check the installed version of `name` against a requirement such as
    /// `>=1.2.0`
    ///
    /// Versions compare as plain strings.
    pub async fn check_version_compatibility(&self, name: &str, requirement: &str) -> bool {
        let inner = self.inner.read().await;
        let Some(entry) = inner.plugins.get(name) else {
            return false;
        };
        version_satisfies(entry.plugin.descriptor().version(), requirement)
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let inner = self.inner.read().await;
        inner.plugins.get(name).map(|e| Arc::clone(&e.plugin))
    }

    pub async fn get_descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        let inner = self.inner.read().await;
        inner.plugins.get(name).map(|e| e.plugin.descriptor().clone())
    }

    /// Entry file the live instance of `name` was loaded from
    pub async fn source_path(&self, name: &str) -> Option<PathBuf> {
        let inner = self.inner.read().await;
        inner
            .plugins
            .get(name)
            .and_then(|e| e.source.as_ref().map(|s| s.path.clone()))
    }

    /// Module bytes the live instance of `name` was built from
    pub async fn source_bytes(&self, name: &str) -> Option<Arc<[u8]>> {
        let inner = self.inner.read().await;
        inner
            .plugins
            .get(name)
            .and_then(|e| e.source.as_ref().map(|s| Arc::clone(&s.bytes)))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.plugins.contains_key(name)
    }

    pub async fn is_enabled(&self, name: &str) -> Option<bool> {
        self.inner.read().await.plugins.get(name).map(|e| e.enabled)
    }

    /// Get the number of registered plugins
    pub async fn len(&self) -> usize {
        self.inner.read().await.plugins.len()
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.plugins.is_empty()
    }

    async fn check_dependencies(&self, descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        let inner = self.inner.read().await;
        for dependency in descriptor.dependencies() {
            let reason = match inner.plugins.get(dependency) {
                None => "not registered",
                Some(entry) if !entry.enabled => "disabled",
                Some(_) => continue,
            };
            return Err(PluginError::Dependency {
                plugin: descriptor.name().to_string(),
                dependency: dependency.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Install `plugin`; the caller holds the lifecycle lock
    async fn install(
        &self,
        plugin: Arc<dyn Plugin>,
        source: Option<SourceInfo>,
    ) -> Result<(), PluginError> {
        let descriptor = plugin.descriptor().clone();
        let name = descriptor.name().to_string();

        self.check_dependencies(&descriptor).await?;

        if self.teardown(&name).await {
            tracing::debug!(plugin = %name, "Replaced existing plugin instance");
        }

        self.inner.write().await.plugins.insert(
            name.clone(),
            PluginEntry {
                plugin: Arc::clone(&plugin),
                enabled: descriptor.enabled(),
                source,
            },
        );
        plugin.on_load().await;

        tracing::info!(plugin = %name, version = %descriptor.version(), "Plugin registered");
        Ok(())
    }

    /// Fire on_unload, await cleanup, then drop the entry; the caller holds
    /// the lifecycle lock
    async fn teardown(&self, name: &str) -> bool {
        let Some(plugin) = self.get_plugin(name).await else {
            return false;
        };

        plugin.on_unload().await;
        plugin.cleanup().await;
        self.inner.write().await.plugins.remove(name);

        tracing::info!(plugin = %name, "Plugin unloaded");
        true
    }
}

/// Compare `installed` against a comparator-prefixed requirement
pub fn version_satisfies(installed: &str, requirement: &str) -> bool {
    let requirement = requirement.trim();
    let installed = installed.trim();

    if let Some(wanted) = requirement.strip_prefix(">=") {
        installed >= wanted.trim()
    } else if let Some(wanted) = requirement.strip_prefix("<=") {
        installed <= wanted.trim()
    } else if let Some(wanted) = requirement.strip_prefix("==") {
        installed == wanted.trim()
    } else if let Some(wanted) = requirement.strip_prefix('>') {
        installed > wanted.trim()
    } else if let Some(wanted) = requirement.strip_prefix('<') {
        installed < wanted.trim()
    } else {
        installed == requirement
    }
}
