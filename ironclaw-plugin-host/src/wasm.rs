//! Plugins backed by a wasm module on disk

use crate::error::PluginError;
use crate::loader::{read_module, LoaderError, ModuleInstance, PluginLoader};
use crate::plugin::{LifecycleHooks, Plugin, WorkerTarget};
use crate::result::ExecutionResult;
use async_trait::async_trait;
use chrono::Utc;
use ironclaw_plugin_api::PluginDescriptor;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

/// Directory under the system temp dir holding content-addressed module copies
const STAGING_DIR: &str = "ironclaw-plugin-modules";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// A plugin whose code lives in a wasm module
///
/// Guest calls are synchronous, so they run on the blocking pool.
pub struct WasmPlugin {
    descriptor: PluginDescriptor,
    source_path: PathBuf,
    source: Arc<[u8]>,
    digest: String,
    hooks: LifecycleHooks,
    instance: Arc<Mutex<ModuleInstance>>,
    staged: OnceLock<PathBuf>,
}

impl WasmPlugin {
    /// Load the module at `path`
    pub fn from_file(loader: &PluginLoader, path: &Path) -> Result<Self, LoaderError> {
        let bytes = read_module(path)?;
        Self::from_bytes(loader, path, bytes)
    }

    /// Load a module already read from `path`
    pub fn from_bytes(
        loader: &PluginLoader,
        path: &Path,
        bytes: Vec<u8>,
    ) -> Result<Self, LoaderError> {
        let loaded = loader.load(&bytes)?;
        Ok(Self {
            descriptor: loaded.manifest.descriptor,
            source_path: path.to_path_buf(),
            digest: module_digest(&bytes),
            source: bytes.into(),
            hooks: LifecycleHooks::new(),
            instance: Arc::new(Mutex::new(loaded.instance)),
            staged: OnceLock::new(),
        })
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Module bytes this instance was built from
    pub fn source(&self) -> Arc<[u8]> {
        Arc::clone(&self.source)
    }

    /// blake3 digest of the module bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Path of an immutable copy of [`source`](Self::source) for workers
    ///
    /// The entry file may be edited at any time; workers must run the bytes
    /// this instance was loaded from, not whatever is on disk now.
    fn staged_path(&self) -> std::io::Result<&Path> {
        if let Some(path) = self.staged.get() {
            return Ok(path.as_path());
        }
        let path = stage_module(&self.source, &self.digest)?;
        Ok(self.staged.get_or_init(|| path).as_path())
    }

    async fn with_instance<T, F>(&self, call: F) -> Result<T, PluginError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ModuleInstance) -> Result<T, LoaderError> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        tokio::task::spawn_blocking(move || {
            let mut guard = instance.lock().unwrap_or_else(PoisonError::into_inner);
            call(&mut *guard)
        })
        .await
        .map_err(|e| PluginError::Execution(format!("plugin task failed: {e}")))?
        .map_err(|e| PluginError::Execution(e.to_string()))
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    async fn execute(&self, args: &Value) -> Result<ExecutionResult, PluginError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let args = args.clone();

        let reply = self.with_instance(move |instance| instance.execute(&args)).await?;
        Ok(ExecutionResult::from_reply(reply).with_timing(started, started_at))
    }

    async fn validate(&self, args: &Value) -> Result<bool, PluginError> {
        let args = args.clone();
        self.with_instance(move |instance| instance.validate(&args))
            .await
    }

    async fn cleanup(&self) {
        if let Err(e) = self.with_instance(ModuleInstance::cleanup).await {
            tracing::warn!(plugin = %self.descriptor.name(), error = %e, "Plugin cleanup failed");
        }
    }

    fn worker_target(&self) -> Option<WorkerTarget> {
        match self.staged_path() {
            Ok(path) => Some(WorkerTarget::Module {
                path: path.to_path_buf(),
                digest: self.digest.clone(),
            }),
            Err(e) => {
                tracing::warn!(
                    plugin = %self.descriptor.name(),
                    error = %e,
                    "Could not stage module for sandbox workers"
                );
                None
            }
        }
    }
}

pub(crate) fn module_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Write `bytes` to `<tmp>/ironclaw-plugin-modules/<digest>` unless an intact
/// copy is already there
///
/// Copies are shared by every instance with the same digest and never removed.
fn stage_module(bytes: &[u8], digest: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join(STAGING_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(digest);
    if is_intact(&path, digest) {
        return Ok(path);
    }

    let partial = dir.join(format!(
        "{digest}.{}.{}.partial",
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&partial, bytes)?;
    if let Err(e) = std::fs::rename(&partial, &path) {
        let _ = std::fs::remove_file(&partial);
        if !is_intact(&path, digest) {
            return Err(e);
        }
    }
    tracing::debug!(path = %path.display(), "Staged module copy");
    Ok(path)
}

fn is_intact(path: &Path, digest: &str) -> bool {
    std::fs::read(path)
        .map(|bytes| module_digest(&bytes) == digest)
        .unwrap_or(false)
}
