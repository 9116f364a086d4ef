//! Plugin loader using wasmtime
//!
//! Compiles plugin modules (binary or text format), links the small host
//! API and wraps the guest's well-known exports.

use ironclaw_plugin_api::{PluginManifest, PluginReply, API_VERSION};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use wasmtime::*;

/// Errors that can occur during plugin loading
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Host function setup failed: {0}")]
    Linker(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Invalid JSON from plugin: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// Knobs applied to every store the loader creates
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// Fuel budget per call; `None` disables fuel metering
    pub fuel: Option<u64>,

    /// Ceiling on guest linear memory growth
    pub memory_ceiling_bytes: Option<usize>,
}

/// Plugin loader with wasmtime engine
pub struct PluginLoader {
    engine: Engine,
    config: LoaderConfig,
}

/// A compiled and instantiated plugin module
pub struct LoadedModule {
    /// Plugin manifest with the descriptor
    pub manifest: PluginManifest,

    /// Module instance for execution
    pub instance: ModuleInstance,
}

struct HostState {
    plugin: String,
    limits: StoreLimits,
}

/// Live instance of a plugin module
pub struct ModuleInstance {
    store: Store<HostState>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    execute_fn: TypedFunc<(i32, i32), i64>,
    validate_fn: Option<TypedFunc<(i32, i32), i32>>,
    cleanup_fn: Option<TypedFunc<(), ()>>,
    fuel: Option<u64>,
}

/// Unpack ptr and len from a packed i64
#[inline]
/// Read raw module bytes (binary or text format)
pub fn read_module(path: &Path) -> Result<Vec<u8>, LoaderError> {
    std::fs::read(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

fn call_error(function: &'static str, error: anyhow::Error) -> LoaderError {
    if matches!(error.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        LoaderError::FuelExhausted
    } else {
        LoaderError::FunctionCall {
            function,
            source: error,
        }
    }
}

impl PluginLoader {
    /// Create a new plugin loader
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(config.fuel.is_some());
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load a plugin from module bytes
    pub fn load(&self, wasm_bytes: &[u8]) -> Result<LoadedModule, LoaderError> {
        // 1. Compile module
        let module =
            Module::new(&self.engine, wasm_bytes).map_err(LoaderError::ModuleCompilation)?;

        // 2. Create store with memory ceiling and optional fuel
        let limits = match self.config.memory_ceiling_bytes {
            Some(bytes) => StoreLimitsBuilder::new().memory_size(bytes).build(),
            None => StoreLimits::default(),
        };
        let mut store = Store::new(
            &self.engine,
            HostState {
                plugin: String::from("<loading>"),
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.config.fuel {
            store.set_fuel(fuel).map_err(LoaderError::EngineCreation)?;
        }

        // 3. Link the host API; any other import fails instantiation
        let mut linker = Linker::new(&self.engine);
        define_host_functions(&mut linker)?;

        // 4. Instantiate
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        // 5. Resolve exports
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LoaderError::FunctionNotFound("memory".to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, "plugin_alloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_alloc".to_string()))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "plugin_dealloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_dealloc".to_string()))?;

        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, "plugin_manifest")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_manifest".to_string()))?;

        let execute_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "plugin_execute")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_execute".to_string()))?;

        let validate_fn = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "plugin_validate")
            .ok();
        let cleanup_fn = instance
            .get_typed_func::<(), ()>(&mut store, "plugin_cleanup")
            .ok();

        let mut instance = ModuleInstance {
            store,
            memory,
            alloc_fn,
            dealloc_fn,
            execute_fn,
            validate_fn,
            cleanup_fn,
            fuel: self.config.fuel,
        };

        // 6. Read and validate the manifest
        let packed = manifest_fn
            .call(&mut instance.store, ())
            .map_err(|e| call_error("plugin_manifest", e))?;
        let manifest_bytes = instance.take_buffer(packed)?;
        let manifest: PluginManifest =
            serde_json::from_slice(&manifest_bytes).map_err(LoaderError::Deserialization)?;

        if manifest.api_version != API_VERSION {
            return Err(LoaderError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }

        instance.store.data_mut().plugin = manifest.descriptor.name().to_string();

        Ok(LoadedModule { manifest, instance })
    }
}

fn define_host_functions(linker: &mut Linker<HostState>) -> Result<(), LoaderError> {
    linker
        .func_wrap("host", "sleep_ms", |millis: i32| {
            if millis > 0 {
                std::thread::sleep(Duration::from_millis(millis as u64));
            }
        })
        .map_err(LoaderError::Linker)?;

    linker
        .func_wrap(
            "host",
            "log",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
                let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory())
                else {
                    return;
                };
                let start = ptr as u32 as usize;
                let end = start.saturating_add(len as u32 as usize);
                if let Some(bytes) = memory.data(&caller).get(start..end) {
                    let message = String::from_utf8_lossy(bytes);
                    tracing::info!(plugin = %caller.data().plugin, "{}", message);
                }
            },
        )
        .map_err(LoaderError::Linker)?;

    Ok(())
}

impl ModuleInstance {
    /// Execute the plugin with JSON arguments
    pub fn execute(&mut self, args: &Value) -> Result<PluginReply, LoaderError> {
        let args_bytes = serde_json::to_vec(args).map_err(LoaderError::Deserialization)?;
        let packed = self.call_with_buffer("plugin_execute", self.execute_fn.clone(), &args_bytes)?;
        let result_bytes = self.take_buffer(packed)?;
        serde_json::from_slice(&result_bytes).map_err(LoaderError::Deserialization)
    }

    /// Run the guest's `plugin_validate` export; modules without one accept
    /// everything
    pub fn validate(&mut self, args: &Value) -> Result<bool, LoaderError> {
        let Some(validate_fn) = self.validate_fn.clone() else {
            return Ok(true);
        };
        let args_bytes = serde_json::to_vec(args).map_err(LoaderError::Deserialization)?;
        let verdict = self.call_with_buffer("plugin_validate", validate_fn, &args_bytes)?;
        Ok(verdict != 0)
    }

    /// Run the guest's `plugin_cleanup` export if present
    pub fn cleanup(&mut self) -> Result<(), LoaderError> {
        let Some(cleanup_fn) = self.cleanup_fn.clone() else {
            return Ok(());
        };
        self.refuel()?;
        cleanup_fn
            .call(&mut self.store, ())
            .map_err(|e| call_error("plugin_cleanup", e))
    }

    fn refuel(&mut self) -> Result<(), LoaderError> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(LoaderError::EngineCreation)?;
        }
        Ok(())
    }

    /// Copy `input` into guest memory, call `func` with (ptr, len) and free
    /// the input afterwards
    fn call_with_buffer<R: WasmResults>(
        &mut self,
        function: &'static str,
        func: TypedFunc<(i32, i32), R>,
        input: &[u8],
    ) -> Result<R, LoaderError> {
        let len = i32::try_from(input.len())
            .map_err(|_| LoaderError::MemoryAccess("input too large".to_string()))?;
        let ptr = self
            .alloc_fn
            .call(&mut self.store, len)
            .map_err(|e| call_error("plugin_alloc", e))?;

        self.memory
            .write(&mut self.store, ptr as u32 as usize, input)
            .map_err(|e| LoaderError::MemoryAccess(format!("Failed to write input: {}", e)))?;

        self.refuel()?;
        let output = func
            .call(&mut self.store, (ptr, len))
            .map_err(|e| call_error(function, e))?;

        self.dealloc_fn.call(&mut self.store, (ptr, len)).ok();
        Ok(output)
    }

    /// Read a packed (ptr, len) buffer out of guest memory and free it
    fn take_buffer(&mut self, packed: i64) -> Result<Vec<u8>, LoaderError> {
        let (ptr, len) = unpack_ptr_len(packed);
        let start = ptr as u32 as usize;
        let end = start.saturating_add(len as u32 as usize);

        let data = self.memory.data(&self.store);
        let bytes = data
            .get(start..end)
            .ok_or_else(|| {
                LoaderError::MemoryAccess(format!(
                    "Out of bounds: ptr={}, len={}, memory_size={}",
                    ptr,
                    len,
                    data.len()
                ))
            })?
            .to_vec();

        self.dealloc_fn.call(&mut self.store, (ptr, len)).ok();
        Ok(bytes)
    }
}
