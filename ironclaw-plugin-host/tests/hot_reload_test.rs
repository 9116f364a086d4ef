//! Discovery, sandboxed execution and hot reload through a full host

use ironclaw_plugin_host::testing::WatPlugin;
use ironclaw_plugin_host::{ExecutionStatus, HostConfig, PluginHost};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn host(temp: &TempDir) -> PluginHost {
    let mut config = HostConfig::default();
    config.registry.plugins_dir = temp.path().join("plugins");
    config.sandbox.worker_program = Some(PathBuf::from(env!("CARGO_BIN_EXE_plugin-worker")));
    config.hot_reload.backup_dir = temp.path().join("backups");
    config.hot_reload.debounce_ms = 200;
    PluginHost::new(config).unwrap()
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_reload_and_rollback() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    let plugins = temp.path().join("plugins");
    let entry = WatPlugin::named("echo", "1.0.0").install(&plugins, "echo");

    assert_eq!(host.start().await, vec!["echo"]);
    let result = host
        .execute_sandboxed("echo", true, &json!({ "msg": "hi" }), None)
        .await;
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);

    let reloaded = Arc::new(Mutex::new(Vec::<String>::new()));
    let failed = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let reloaded = Arc::clone(&reloaded);
        let failed = Arc::clone(&failed);
        host.hot_reload()
            .start_watching(
                Some(Arc::new(move |name: &str| {
                    reloaded.lock().unwrap().push(name.to_string())
                })),
                Some(Arc::new(move |name: &str, _reason: &str| {
                    failed.lock().unwrap().push(name.to_string())
                })),
            )
            .unwrap();
    }
    assert!(host.hot_reload().is_watching());

    let v2 = WatPlugin::named("echo", "2.0.0").render();
    std::fs::write(&entry, &v2).unwrap();
    let registry = host.registry().clone();
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move {
                registry
                    .get_descriptor("echo")
                    .await
                    .is_some_and(|d| d.version() == "2.0.0")
            }
        })
        .await
    );
    assert!(reloaded.lock().unwrap().contains(&"echo".to_string()));
    assert!(!host.hot_reload().get_backup_info("echo").is_empty());

    std::fs::write(&entry, "(module").unwrap();
    let seen = Arc::clone(&failed);
    assert!(eventually(|| {
        let seen = Arc::clone(&seen);
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await);

    assert_eq!(std::fs::read_to_string(&entry).unwrap(), v2);
    assert_eq!(
        host.registry().get_descriptor("echo").await.unwrap().version(),
        "2.0.0"
    );

    assert!(host.hot_reload().stop_watching().await);
    assert!(!host.hot_reload().is_watching());
    host.shutdown().await;
    assert!(host.registry().is_empty().await);
}

#[tokio::test]
async fn test_manual_reload_of_new_plugin() {
    let temp = TempDir::new().unwrap();
    let host = host(&temp);
    assert!(host.start().await.is_empty());

    WatPlugin::named("late", "0.1.0").install(&temp.path().join("plugins"), "late");

    assert!(host.hot_reload().manual_reload("late").await);
    assert!(host.registry().contains("late").await);
    assert!(!host.hot_reload().manual_reload("missing").await);
}
