//! ironclaw-plugin-host: sandboxed plugin runtime
//!
//! Loads wasm plugins from a directory tree into a dependency-aware
//! [`PluginRegistry`], runs invocations in supervised worker processes through
//! the [`Sandbox`], and hot-reloads changed plugins with backup and rollback
//! via the [`HotReloadManager`]. [`PluginHost`] wires the three together.

pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod loader;
pub mod plugin;
pub mod registry;
pub mod reload;
pub mod result;
pub mod sandbox;
pub mod telemetry;
pub mod wasm;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ConfigError, HostConfig};
pub use discovery::{DiscoveryError, DiscoveryResult, PluginScanner};
pub use error::{ErrorKind, PluginError};
pub use host::{HostError, PluginHost};
pub use loader::{LoaderConfig, LoaderError, PluginLoader};
pub use plugin::{LifecycleHooks, Plugin, WorkerTarget};
pub use registry::{PluginInfo, PluginRegistry};
pub use reload::{BackupInfo, HotReloadConfig, HotReloadError, HotReloadManager, ReloadOutcome};
pub use result::ExecutionResult;
pub use sandbox::{PluginStats, Sandbox, SandboxConfig, Worker};
pub use telemetry::{init_tracing, TelemetryFormat};
pub use wasm::WasmPlugin;

pub use ironclaw_plugin_api::{ExecutionStatus, PluginDescriptor, ResourceLimits};
