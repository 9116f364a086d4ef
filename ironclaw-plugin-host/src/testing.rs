//! Plugin fixtures shared by unit and integration tests
//!
//! Compiled for `cfg(test)` and behind the `test-utils` feature.

use crate::error::PluginError;
use crate::plugin::{LifecycleHooks, Plugin};
use crate::result::ExecutionResult;
use async_trait::async_trait;
use ironclaw_plugin_api::{PluginDescriptor, PluginManifest, PluginReply};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const MANIFEST_OFFSET: usize = 1024;
const REPLY_OFFSET: usize = 16384;

/// Builds a text-format plugin module around a descriptor and a canned reply
pub struct WatPlugin {
    manifest: String,
    reply: String,
    validate: Option<bool>,
    grow_pages: Option<u32>,
    sleep_ms: Option<u32>,
    trap: bool,
    spin: bool,
}

impl WatPlugin {
    pub fn new(descriptor: PluginDescriptor) -> Self {
        let manifest = PluginManifest::new(descriptor);
        Self {
            manifest: serde_json::to_string(&manifest).unwrap(),
            reply: serde_json::to_string(&PluginReply::success(serde_json::json!({ "ok": true })))
                .unwrap(),
            validate: None,
            grow_pages: None,
            sleep_ms: None,
            trap: false,
            spin: false,
        }
    }

    pub fn named(name: &str, version: &str) -> Self {
        Self::new(PluginDescriptor::builder(name, version).build().unwrap())
    }

    pub fn replying(mut self, reply: PluginReply) -> Self {
        self.reply = serde_json::to_string(&reply).unwrap();
        self
    }

    pub fn validating(mut self, verdict: bool) -> Self {
        self.validate = Some(verdict);
        self
    }

    pub fn api_version(mut self, version: u32) -> Self {
        let mut value: serde_json::Value = serde_json::from_str(&self.manifest).unwrap();
        value["api_version"] = version.into();
        self.manifest = value.to_string();
        self
    }

    pub fn growing(mut self, pages: u32) -> Self {
        self.grow_pages = Some(pages);
        self
    }

    pub fn sleeping(mut self, millis: u32) -> Self {
        self.sleep_ms = Some(millis);
        self
    }

    pub fn trapping(mut self) -> Self {
        self.trap = true;
        self
    }

    pub fn spinning(mut self) -> Self {
        self.spin = true;
        self
    }

    pub fn render(&self) -> String {
        assert!(self.manifest.len() < REPLY_OFFSET - MANIFEST_OFFSET);

        let mut body = String::new();
        if let Some(pages) = self.grow_pages {
            body.push_str(&format!(
                r#"
    (local.set $addr (memory.grow (i32.const {pages})))
    (if (i32.eq (local.get $addr) (i32.const -1)) (then unreachable))
    (local.set $addr (i32.mul (local.get $addr) (i32.const 65536)))
    (local.set $end (i32.add (local.get $addr) (i32.const {bytes})))
    (block $done
      (loop $touch
        (br_if $done (i32.ge_u (local.get $addr) (local.get $end)))
        (i32.store8 (local.get $addr) (i32.const 1))
        (local.set $addr (i32.add (local.get $addr) (i32.const 4096)))
        (br $touch)))"#,
                bytes = u64::from(pages) * 65536,
            ));
        }
        if let Some(millis) = self.sleep_ms {
            body.push_str(&format!("\n    (call $sleep (i32.const {millis}))"));
        }
        if self.spin {
            body.push_str("\n    (loop $spin (br $spin))");
        }
        if self.trap {
            body.push_str("\n    unreachable");
        }

        let validate = match self.validate {
            Some(verdict) => format!(
                r#"(func (export "plugin_validate") (param i32 i32) (result i32) (i32.const {}))"#,
                i32::from(verdict)
            ),
            None => String::new(),
        };

        format!(
            r#"(module
  (import "host" "sleep_ms" (func $sleep (param i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 32768))
  (data (i32.const {MANIFEST_OFFSET}) "{manifest}")
  (data (i32.const {REPLY_OFFSET}) "{reply}")
  (func (export "plugin_alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "plugin_dealloc") (param i32 i32))
  (func (export "plugin_manifest") (result i64)
    (i64.or (i64.shl (i64.const {MANIFEST_OFFSET}) (i64.const 32)) (i64.const {manifest_len})))
  (func (export "plugin_execute") (param i32 i32) (result i64)
    (local $addr i32)
    (local $end i32){body}
    (i64.or (i64.shl (i64.const {REPLY_OFFSET}) (i64.const 32)) (i64.const {reply_len})))
  {validate}
)
"#,
            manifest = escape(&self.manifest),
            manifest_len = self.manifest.len(),
            reply = escape(&self.reply),
            reply_len = self.reply.len(),
        )
    }

    /// Write as `<root>/<name>/plugin.wat`
    pub fn install(&self, root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plugin.wat");
        std::fs::write(&path, self.render()).unwrap();
        path
    }
}

fn escape(json: &str) -> String {
    json.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Native plugin with scripted behaviour and an invocation counter
pub struct StubPlugin {
    descriptor: PluginDescriptor,
    hooks: LifecycleHooks,
    valid: bool,
    panics: bool,
    faults: bool,
    pub executions: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

impl StubPlugin {
    pub fn new(name: &str) -> Self {
        Self::with_descriptor(PluginDescriptor::builder(name, "1.0.0").build().unwrap())
    }

    pub fn with_descriptor(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            hooks: LifecycleHooks::new(),
            valid: true,
            panics: false,
            faults: false,
            executions: Arc::new(AtomicUsize::new(0)),
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn rejecting(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn faulting(mut self) -> Self {
        self.faults = true;
        self
    }
}

#[async_trait]
impl Plugin for StubPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    async fn execute(&self, args: &Value) -> Result<ExecutionResult, PluginError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("stub plugin panicked");
        }
        if self.faults {
            return Err(PluginError::Execution("stub fault".into()));
        }
        Ok(ExecutionResult::success(serde_json::json!({ "echo": args })))
    }

    async fn validate(&self, _args: &Value) -> Result<bool, PluginError> {
        Ok(self.valid)
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
