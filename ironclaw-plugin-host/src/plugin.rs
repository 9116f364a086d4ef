//! The plugin contract
//!
//! Every plugin, whether a wasm module discovered on disk or a native type
//! registered by the host, implements [`Plugin`]. Lifecycle callbacks are
//! plain listener lists owned by the instance and fired in registration
//! order.

use crate::error::PluginError;
use crate::result::ExecutionResult;
use async_trait::async_trait;
use ironclaw_plugin_api::PluginDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Callback fired on load or unload
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Callback fired when an invocation faults
pub type ErrorHook = Arc<dyn Fn(&PluginError) + Send + Sync>;

/// Listener lists for a plugin instance
#[derive(Default)]
pub struct LifecycleHooks {
    on_load: Mutex<Vec<LifecycleHook>>,
    on_unload: Mutex<Vec<LifecycleHook>>,
    on_error: Mutex<Vec<ErrorHook>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_on_load(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.on_load).push(Arc::new(hook));
    }

    pub fn register_on_unload(&self, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.on_unload).push(Arc::new(hook));
    }

    pub fn register_on_error(&self, hook: impl Fn(&PluginError) + Send + Sync + 'static) {
        lock(&self.on_error).push(Arc::new(hook));
    }

    pub fn fire_load(&self) {
        // Snapshot first so a hook may register further hooks.
        let hooks = lock(&self.on_load).clone();
        hooks.iter().for_each(|hook| hook());
    }

    pub fn fire_unload(&self) {
        let hooks = lock(&self.on_unload).clone();
        hooks.iter().for_each(|hook| hook());
    }

    pub fn fire_error(&self, error: &PluginError) {
        let hooks = lock(&self.on_error).clone();
        hooks.iter().for_each(|hook| hook(error));
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_load", &lock(&self.on_load).len())
            .field("on_unload", &lock(&self.on_unload).len())
            .field("on_error", &lock(&self.on_error).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a sandbox worker process re-creates a plugin on its side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerTarget {
    /// Load the wasm module at `path`; its blake3 digest must equal `digest`
    Module { path: PathBuf, digest: String },

    /// Instantiate a native plugin through a factory compiled into the worker
    Factory { name: String },
}

/// Capability interface every plugin implements
///
/// `execute` reports expected failures through a Failed [`ExecutionResult`];
/// an `Err` means the plugin faulted, which fires `on_error` hooks.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Immutable identity and resource envelope
    fn descriptor(&self) -> &PluginDescriptor;

    /// Lifecycle listener lists
    fn hooks(&self) -> &LifecycleHooks;

    /// Perform the plugin's work
    async fn execute(&self, args: &Value) -> Result<ExecutionResult, PluginError>;

    /// Side-effect-free pre-check of `args`
    async fn validate(&self, args: &Value) -> Result<bool, PluginError>;

    /// Release resources; awaited before the instance counts as destroyed
    async fn cleanup(&self) {}

    async fn on_load(&self) {
        self.hooks().fire_load();
    }

    async fn on_unload(&self) {
        self.hooks().fire_unload();
    }

    async fn on_error(&self, error: &PluginError) {
        self.hooks().fire_error(error);
    }

    /// Where a sandbox worker finds this plugin; `None` means it cannot be
    /// run out of process
    fn worker_target(&self) -> Option<WorkerTarget> {
        None
    }

    fn name(&self) -> &str {
        self.descriptor().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_fire_in_registration_order() {
        let hooks = LifecycleHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            hooks.register_on_load(move || order.lock().unwrap().push(i));
        }
        hooks.fire_load();
        hooks.fire_unload();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_error_hooks_receive_error() {
        let hooks = LifecycleHooks::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        hooks.register_on_error(move |err| {
            assert!(matches!(err, PluginError::Execution(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hooks.fire_error(&PluginError::Execution("boom".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_target_wire_format() {
        let target = WorkerTarget::Module {
            path: PathBuf::from("/tmp/ironclaw-plugin-modules/af13"),
            digest: "af13".into(),
        };
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["kind"], "module");
        assert_eq!(json["digest"], "af13");

        let decoded: WorkerTarget =
            serde_json::from_str(r#"{"kind":"factory","name":"echo"}"#).unwrap();
        assert_eq!(
            decoded,
            WorkerTarget::Factory {
                name: "echo".into()
            }
        );
    }
}
