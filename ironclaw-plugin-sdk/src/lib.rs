//! ironclaw-plugin-sdk: SDK for writing Wasm plugins
//!
//! Implement [`Plugin`] for a unit struct and let [`export_plugin!`] generate
//! the exports the host looks for.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ironclaw_plugin_sdk::prelude::*;
//!
//! struct Greeter;
//!
//! impl Plugin for Greeter {
//!     fn manifest() -> PluginManifest {
//!         PluginManifest::new(
//!             PluginDescriptor::builder("greeter", "1.0.0")
//!                 .description("Greets a person")
//!                 .build()
//!                 .expect("valid descriptor"),
//!         )
//!     }
//!
//!     fn execute(args: Value) -> PluginReply {
//!         let name = args["name"].as_str().unwrap_or("World");
//!         PluginReply::success(json!({ "greeting": format!("Hello, {name}!") }))
//!     }
//! }
//!
//! export_plugin!(Greeter);
//! ```

use std::alloc::{alloc, dealloc, Layout};

pub use ironclaw_plugin_api::*;
pub use serde_json::{json, Value};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_plugin, host, memory, Plugin};
    pub use ironclaw_plugin_api::{
        PluginDescriptor, PluginManifest, PluginReply, ResourceLimits, API_VERSION,
    };
    pub use serde_json::{json, Value};
}

/// Trait that plugins must implement
pub trait Plugin {
    /// Identity, limits and requirements reported to the host
    fn manifest() -> PluginManifest;

    /// Handle one invocation
    fn execute(args: Value) -> PluginReply;

    /// Check arguments before execution; accepts everything by default
    fn validate(_args: &Value) -> bool {
        true
    }

    /// Release resources before the host unloads the module
    fn cleanup() {}
}

/// Functions provided by the host under the `host` import module
pub mod host {
    #[cfg(target_arch = "wasm32")]
    #[link(wasm_import_module = "host")]
    extern "C" {
        #[link_name = "sleep_ms"]
        fn host_sleep_ms(millis: i32);

        #[link_name = "log"]
        fn host_log(ptr: i32, len: i32);
    }

    /// Block the plugin for `millis` milliseconds
    pub fn sleep_ms(millis: u32) {
        #[cfg(target_arch = "wasm32")]
        unsafe {
            host_sleep_ms(i32::try_from(millis).unwrap_or(i32::MAX))
        }

        #[cfg(not(target_arch = "wasm32"))]
        std::thread::sleep(std::time::Duration::from_millis(u64::from(millis)));
    }

    /// Write `message` to the host log
    pub fn log(message: &str) {
        #[cfg(target_arch = "wasm32")]
        unsafe {
            host_log(message.as_ptr() as i32, message.len() as i32)
        }

        #[cfg(not(target_arch = "wasm32"))]
        eprintln!("{message}");
    }
}

/// Memory utilities for Wasm plugin development
///
/// Buffers handed to the host are allocated with [`memory::plugin_alloc`]; the
/// host frees them through `plugin_dealloc` once it has copied them out.
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// The ptr must have been allocated by `plugin_alloc` with the same size.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Pack a pointer and length into a single i64 value
    ///
    /// wasm32-unknown-unknown has no multi-value returns, so every buffer
    /// crosses the boundary as `(ptr << 32) | len`.
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Serialize `data` as JSON into a fresh buffer and return it packed
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = serde_json::to_vec(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plugin_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        pack_ptr_len(ptr, len)
    }

    /// Decode JSON arguments the host wrote at `ptr`
    ///
    /// # Safety
    /// The pointer must be valid for `len` bytes.
    pub unsafe fn read_args(ptr: i32, len: i32) -> Result<Value, serde_json::Error> {
        if ptr == 0 || len <= 0 {
            return Ok(Value::Null);
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        serde_json::from_slice(slice)
    }
}

/// Macro to export all required plugin functions
///
/// Generates `plugin_manifest`, `plugin_execute`, `plugin_validate`,
/// `plugin_cleanup`, `plugin_alloc` and `plugin_dealloc`.
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_manifest() -> i64 {
            let manifest = <$plugin as $crate::Plugin>::manifest();
            $crate::memory::serialize_and_return(&manifest)
        }

        #[no_mangle]
        pub extern "C" fn plugin_execute(args_ptr: i32, args_len: i32) -> i64 {
            let reply = match unsafe { $crate::memory::read_args(args_ptr, args_len) } {
                Ok(args) => <$plugin as $crate::Plugin>::execute(args),
                Err(e) => $crate::PluginReply::failed(format!("Invalid arguments: {e}")),
            };
            $crate::memory::serialize_and_return(&reply)
        }

        #[no_mangle]
        pub extern "C" fn plugin_validate(args_ptr: i32, args_len: i32) -> i32 {
            match unsafe { $crate::memory::read_args(args_ptr, args_len) } {
                Ok(args) => i32::from(<$plugin as $crate::Plugin>::validate(&args)),
                Err(_) => 0,
            }
        }

        #[no_mangle]
        pub extern "C" fn plugin_cleanup() {
            <$plugin as $crate::Plugin>::cleanup()
        }

        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}
