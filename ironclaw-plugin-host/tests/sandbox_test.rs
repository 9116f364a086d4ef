//! Worker-process isolation against the real worker binary

use ironclaw_plugin_api::{PluginDescriptor, PluginReply};
use ironclaw_plugin_host::testing::WatPlugin;
use ironclaw_plugin_host::{
    ExecutionStatus, LoaderConfig, PluginLoader, Sandbox, SandboxConfig, WasmPlugin,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sandbox() -> Sandbox {
    Sandbox::new(SandboxConfig {
        worker_program: PathBuf::from(env!("CARGO_BIN_EXE_plugin-worker")),
        ..SandboxConfig::default()
    })
}

fn load(temp: &TempDir, module: &WatPlugin, name: &str) -> WasmPlugin {
    let path = module.install(temp.path(), name);
    let loader = PluginLoader::new(LoaderConfig::default()).unwrap();
    WasmPlugin::from_file(&loader, &path).unwrap()
}

#[tokio::test]
async fn test_echo_runs_in_worker() {
    let temp = TempDir::new().unwrap();
    let plugin = load(&temp, &WatPlugin::named("echo", "1.0.0"), "echo");

    let result = sandbox().execute(&plugin, &json!({ "x": 1 }), None).await;

    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
    assert_eq!(result.data, json!({ "ok": true }));
    assert!(result.execution_time_ms > 0);
    assert!(result.metadata.contains_key("worker_pid"));
}

#[tokio::test]
async fn test_worker_runs_loaded_module_not_file_on_disk() {
    let temp = TempDir::new().unwrap();
    let v1 = WatPlugin::named("pinned", "1.0.0")
        .replying(PluginReply::success(json!({ "v": 1 })));
    let plugin = load(&temp, &v1, "pinned");
    let sandbox = sandbox();

    // Edited without a reload: the registered instance is still v1.
    let v2 = WatPlugin::named("pinned", "2.0.0")
        .replying(PluginReply::success(json!({ "v": 2 })));
    v2.install(temp.path(), "pinned");
    let result = sandbox.execute(&plugin, &json!({}), None).await;
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
    assert_eq!(result.data, json!({ "v": 1 }));

    std::fs::write(plugin.source_path(), "(module").unwrap();
    let result = sandbox.execute(&plugin, &json!({}), None).await;
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
    assert_eq!(result.data, json!({ "v": 1 }));
}

#[tokio::test]
async fn test_plugin_reported_failure_passes_through() {
    let temp = TempDir::new().unwrap();
    let module = WatPlugin::named("picky", "1.0.0").replying(PluginReply::failed("bad input"));
    let plugin = load(&temp, &module, "picky");

    let result = sandbox().execute(&plugin, &json!({}), None).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("bad input"));
}

#[tokio::test]
async fn test_slow_plugin_times_out() {
    let temp = TempDir::new().unwrap();
    let plugin = load(&temp, &WatPlugin::named("slow", "1.0.0").sleeping(10_000), "slow");

    let started = Instant::now();
    let result = sandbox().execute(&plugin, &json!({}), Some(1)).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.error.unwrap().contains("1 seconds"));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_memory_hog_is_terminated() {
    let temp = TempDir::new().unwrap();
    let descriptor = PluginDescriptor::builder("hog", "1.0.0")
        .max_memory_mb(64)
        .max_execution_time_seconds(20)
        .build()
        .unwrap();
    let module = WatPlugin::new(descriptor).growing(1600).sleeping(10_000);
    let plugin = load(&temp, &module, "hog");
    let sandbox = sandbox();

    let result = sandbox.execute(&plugin, &json!({}), None).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.contains("Memory limit exceeded"), "{error}");
    assert!(error.contains("> 64MB"), "{error}");
    assert!(result.memory_used_mb > 64.0);
    assert!(sandbox.get_active_plugins().is_empty());
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let temp = TempDir::new().unwrap();
    let plugin = load(&temp, &WatPlugin::named("nap", "1.0.0").sleeping(10_000), "nap");
    let sandbox = Arc::new(sandbox());

    let runner = {
        let sandbox = Arc::clone(&sandbox);
        tokio::spawn(async move { sandbox.execute(&plugin, &json!({}), None).await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while sandbox.get_active_plugins().is_empty() {
        assert!(Instant::now() < deadline, "worker never became active");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = sandbox.get_plugin_stats("nap").unwrap();
    assert!(stats.pid.is_some());
    assert!(sandbox.cancel_plugin("nap"));

    let result = runner.await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.error.unwrap().contains("cancelled"));
    assert!(sandbox.get_plugin_stats("nap").is_none());
    assert!(!sandbox.cancel_plugin("nap"));
}
