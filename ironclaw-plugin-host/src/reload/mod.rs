//! Hot reload with backup and rollback
//!
//! Watches the plugin tree, debounces bursts of saves per plugin and drives
//! [`PluginRegistry::reload_plugin`]. The live version is snapshotted before
//! every attempt and restored when the new version fails to load.

mod backup;

pub use backup::{BackupInfo, BackupStore};

use crate::error::PluginError;
use crate::registry::PluginRegistry;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Called with the plugin name after a successful reload
pub type SuccessCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with the plugin name and a description after a failed reload
pub type FailureCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Configuration for the hot reload manager
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    pub backup_dir: PathBuf,
    /// Quiet period before a burst of changes triggers a reload
    pub debounce: Duration,
    /// Backups kept per plugin after a successful reload
    pub keep_backups: usize,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("data/plugin_backups"),
            debounce: Duration::from_secs(1),
            keep_backups: 5,
        }
    }
}

/// How a reload attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new version is live
    Reloaded,
    /// The new version failed; the previous one was restored
    RolledBack { reason: String },
    /// The new version failed and so did restoring the previous one
    RollbackFailed { reason: String },
    /// Nothing was attempted
    Aborted { reason: String },
}

impl ReloadOutcome {
    pub fn is_reloaded(&self) -> bool {
        matches!(self, Self::Reloaded)
    }
}

/// Errors that can occur while managing hot reload
#[derive(Debug, Error)]
pub enum HotReloadError {
    #[error("Hot reload is already watching")]
    AlreadyWatching,

    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Default)]
struct Callbacks {
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl Callbacks {
    fn success(&self, plugin: &str) {
        if let Some(callback) = &self.on_success {
            callback(plugin);
        }
    }

    fn failure(&self, plugin: &str, reason: &str) {
        if let Some(callback) = &self.on_failure {
            callback(plugin, reason);
        }
    }
}

struct WatchSession {
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives backup, reload and rollback for the plugin tree of one registry
pub struct HotReloadManager {
    reloader: Arc<Reloader>,
    session: Mutex<Option<WatchSession>>,
}

impl HotReloadManager {
    pub fn new(registry: PluginRegistry, config: HotReloadConfig) -> Self {
        Self {
            reloader: Arc::new(Reloader {
                registry,
                backups: BackupStore::new(config.backup_dir, config.keep_backups),
                debounce: config.debounce,
                in_flight: tokio::sync::Mutex::new(()),
                restored: Mutex::new(HashMap::new()),
            }),
            session: Mutex::new(None),
        }
    }

    /// Start watching the registry's plugin directory
    pub fn start_watching(
        &self,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Result<(), HotReloadError> {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(HotReloadError::AlreadyWatching);
        }

        let root = self.reloader.registry.plugins_dir().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| HotReloadError::Io {
            path: root.clone(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.blocking_send(res);
        })
        .map_err(HotReloadError::WatcherInit)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(HotReloadError::WatcherInit)?;

        let callbacks = Callbacks {
            on_success,
            on_failure,
        };
        let task = tokio::spawn(watch_loop(
            Arc::clone(&self.reloader),
            callbacks,
            event_rx,
            shutdown_rx,
        ));

        tracing::info!(dir = %root.display(), "Watching plugins for changes");
        *session = Some(WatchSession {
            _watcher: watcher,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop watching; pending debounced reloads are dropped
    pub async fn stop_watching(&self) -> bool {
        let Some(session) = lock(&self.session).take() else {
            return false;
        };

        let _ = session.shutdown_tx.send(()).await;
        if let Err(e) = session.task.await {
            tracing::warn!(error = %e, "Hot reload task ended abnormally");
        }
        tracing::info!("Hot reload watcher stopped");
        true
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Backup, reload and roll back on failure, right now
    ///
    /// Returns whether the new version is live.
    pub async fn manual_reload(&self, name: &str) -> bool {
        self.reloader
            .reload(name, &Callbacks::default())
            .await
            .is_reloaded()
    }

    /// Like [`manual_reload`](Self::manual_reload), reporting how it ended
    pub async fn reload_with_outcome(&self, name: &str) -> ReloadOutcome {
        self.reloader.reload(name, &Callbacks::default()).await
    }

    /// Backups of `name`, newest first
    pub fn get_backup_info(&self, name: &str) -> Vec<BackupInfo> {
        match self.reloader.backups.list(name) {
            Ok(backups) => backups,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to list backups");
                Vec::new()
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Reloader {
    registry: PluginRegistry,
    backups: BackupStore,
    debounce: Duration,
    /// One reload at a time, whether watcher-driven or manual
    in_flight: tokio::sync::Mutex<()>,
    /// Entry files written by a rollback, with what the write left on disk
    restored: Mutex<HashMap<PathBuf, FileStamp>>,
}

/// Modification time and length of a file
type FileStamp = (SystemTime, u64);

fn file_stamp(path: &Path) -> std::io::Result<FileStamp> {
    let metadata = std::fs::metadata(path)?;
    Ok((metadata.modified()?, metadata.len()))
}

impl Reloader {
    async fn reload(&self, name: &str, callbacks: &Callbacks) -> ReloadOutcome {
        let _guard = self.in_flight.lock().await;

        let plugin_dir = self.registry.plugins_dir().join(name);
        let entry = match self.registry.scanner().entry_path(&plugin_dir) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Reload skipped");
                return ReloadOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        let backup = match self.snapshot(name, &entry).await {
            Ok(backup) => backup,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Reload skipped, backup failed");
                return ReloadOutcome::Aborted {
                    reason: format!("backup failed: {e}"),
                };
            }
        };

        if self.registry.reload_plugin(name).await {
            if let Err(e) = self.backups.prune(name) {
                tracing::warn!(plugin = %name, error = %e, "Failed to prune backups");
            }
            callbacks.success(name);
            return ReloadOutcome::Reloaded;
        }

        let reason = PluginError::Reload {
            plugin: name.to_string(),
            reason: "new version failed to load".to_string(),
        }
        .to_string();
        tracing::warn!(plugin = %name, backup = %backup.display(), "Rolling back plugin");

        let restored = restore(&backup, &entry).await;
        if let Ok(stamp) = &restored {
            lock(&self.restored).insert(entry.clone(), *stamp);
        }
        let recovered = restored.is_ok() && self.registry.reload_plugin(name).await;

        if recovered {
            tracing::info!(plugin = %name, "Rolled back to previous version");
            callbacks.failure(name, &reason);
            return ReloadOutcome::RolledBack { reason };
        }

        let detail = match restored {
            Ok(_) => "previous version failed to load".to_string(),
            Err(e) => format!("could not restore backup: {e}"),
        };
        let reason = format!("{reason}; rollback failed: {detail}");
        tracing::error!(plugin = %name, reason = %reason, "Plugin left unloaded");
        callbacks.failure(name, &reason);
        ReloadOutcome::RollbackFailed { reason }
    }

    /// Back up the live version, falling back to the file on disk when the
    /// plugin is not registered
    async fn snapshot(&self, name: &str, entry: &Path) -> std::io::Result<PathBuf> {
        let contents = match self.registry.source_bytes(name).await {
            Some(bytes) => bytes.to_vec(),
            None => tokio::fs::read(entry).await?,
        };
        let extension = entry
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("wasm");
        self.backups.create(name, extension, &contents)
    }

    /// Whether `path` still holds exactly what a rollback wrote
    ///
    /// Any later write clears the record, so only the restore itself is
    /// ignored.
    fn is_restored_copy(&self, path: &Path) -> bool {
        let mut restored = lock(&self.restored);
        let Some(stamp) = restored.get(path) else {
            return false;
        };
        if file_stamp(path).is_ok_and(|current| current == *stamp) {
            return true;
        }
        restored.remove(path);
        false
    }

    /// Plugin names whose entry file changed in `event`
    fn changed_plugins(&self, event: &Event) -> Vec<String> {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            if matches!(event.kind, EventKind::Remove(_)) {
                tracing::debug!(paths = ?event.paths, "Ignoring removed plugin files");
            }
            return Vec::new();
        }

        let mut names = Vec::new();
        for path in &event.paths {
            let Some(name) = self.plugin_of(path) else {
                continue;
            };
            if self.is_restored_copy(path) {
                tracing::debug!(plugin = %name, "Ignoring change written by rollback");
                continue;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn plugin_of(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        if !self.registry.scanner().is_entry_file(file_name) {
            return None;
        }
        let name = path.parent()?.file_name()?.to_str()?;
        self.registry
            .plugins_dir()
            .join(name)
            .is_dir()
            .then(|| name.to_string())
    }
}

/// Write `backup` over `entry` through a temporary file and rename
///
/// Returns the stamp of the restored entry.
async fn restore(backup: &Path, entry: &Path) -> std::io::Result<FileStamp> {
    let contents = tokio::fs::read(backup).await?;
    let mut staging = entry.as_os_str().to_owned();
    staging.push(".restore");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, &contents).await?;
    tokio::fs::rename(&staging, entry).await?;
    file_stamp(entry)
}

async fn watch_loop(
    reloader: Arc<Reloader>,
    callbacks: Callbacks,
    mut events: mpsc::Receiver<notify::Result<Event>>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut pending: HashMap<String, Instant> = HashMap::new();

    loop {
        let next_due = pending.values().min().copied();

        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Hot reload watcher shutting down");
                break;
            }

            event = events.recv() => match event {
                Some(Ok(event)) => {
                    let deadline = Instant::now() + reloader.debounce;
                    for name in reloader.changed_plugins(&event) {
                        // A newer change replaces the pending reload.
                        pending.insert(name, deadline);
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "File watch error"),
                None => break,
            },

            _ = async {
                match next_due {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = Instant::now();
                let mut due: Vec<String> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(name, _)| name.clone())
                    .collect();
                due.sort();

                for name in due {
                    pending.remove(&name);
                    let outcome = reloader.reload(&name, &callbacks).await;
                    tracing::debug!(plugin = %name, outcome = ?outcome, "Hot reload finished");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PluginScanner;
    use crate::loader::{LoaderConfig, PluginLoader};
    use crate::testing::WatPlugin;
    use ironclaw_plugin_api::{PluginDescriptor, PluginReply};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        registry: PluginRegistry,
        manager: HotReloadManager,
    }

    fn fixture(debounce: Duration) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("plugins");
        let loader = Arc::new(PluginLoader::new(LoaderConfig::default()).unwrap());
        let scanner = PluginScanner::new(
            loader,
            vec!["plugin.wasm".to_string(), "plugin.wat".to_string()],
        );
        let registry = PluginRegistry::new(&root, scanner);
        let manager = HotReloadManager::new(
            registry.clone(),
            HotReloadConfig {
                backup_dir: temp.path().join("backups"),
                debounce,
                keep_backups: 5,
            },
        );
        Fixture {
            _temp: temp,
            root,
            registry,
            manager,
        }
    }

    fn echo(message: &str) -> String {
        let descriptor = PluginDescriptor::builder("echo", "1.0.0").build().unwrap();
        WatPlugin::new(descriptor)
            .replying(PluginReply::success(json!({ "message": message })))
            .render()
    }

    fn write_entry(root: &Path, source: &str) {
        std::fs::create_dir_all(root.join("echo")).unwrap();
        std::fs::write(root.join("echo/plugin.wat"), source).unwrap();
    }

    async fn message(registry: &PluginRegistry) -> Value {
        registry.execute_plugin("echo", true, &json!({})).await.data["message"].clone()
    }

    #[tokio::test]
    async fn test_manual_reload_creates_backups() {
        let f = fixture(Duration::from_millis(100));
        write_entry(&f.root, &echo("v1"));
        f.registry.discover_plugins().await;

        assert!(f.manager.manual_reload("echo").await);
        write_entry(&f.root, &echo("v2"));
        assert!(f.manager.manual_reload("echo").await);
        assert_eq!(message(&f.registry).await, "v2");

        let backups = f.manager.get_backup_info("echo");
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().all(|b| b.size_bytes > 0));
        // The newest backup holds the version live before the second reload.
        let newest = std::fs::read_to_string(&backups[0].path).unwrap();
        assert!(newest.contains("v1"));
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_version() {
        let f = fixture(Duration::from_millis(100));
        write_entry(&f.root, &echo("v1"));
        f.registry.discover_plugins().await;

        write_entry(&f.root, "(module");
        let outcome = f.manager.reload_with_outcome("echo").await;

        assert!(matches!(outcome, ReloadOutcome::RolledBack { .. }));
        assert_eq!(message(&f.registry).await, "v1");
        let on_disk = std::fs::read_to_string(f.root.join("echo/plugin.wat")).unwrap();
        assert!(on_disk.contains("v1"));
    }

    #[tokio::test]
    async fn test_only_the_restore_write_is_ignored() {
        use notify::event::ModifyKind;

        let f = fixture(Duration::from_millis(100));
        let entry = f.root.join("echo/plugin.wat");
        write_entry(&f.root, &echo("v1"));
        f.registry.discover_plugins().await;

        write_entry(&f.root, "(module");
        let outcome = f.manager.reload_with_outcome("echo").await;
        assert!(matches!(outcome, ReloadOutcome::RolledBack { .. }));

        let modified = || Event::new(EventKind::Modify(ModifyKind::Any)).add_path(entry.clone());
        let reloader = &f.manager.reloader;
        assert!(reloader.changed_plugins(&modified()).is_empty());

        // An edit right after the rollback is a real change.
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_entry(&f.root, &echo("edited"));
        assert_eq!(reloader.changed_plugins(&modified()), vec!["echo"]);
        assert!(lock(&reloader.restored).is_empty());
    }

    #[tokio::test]
    async fn test_reload_without_entry_is_aborted() {
        let f = fixture(Duration::from_millis(100));
        let outcome = f.manager.reload_with_outcome("ghost").await;
        assert!(matches!(outcome, ReloadOutcome::Aborted { .. }));
        assert!(!f.manager.manual_reload("ghost").await);
        assert!(f.manager.get_backup_info("ghost").is_empty());
    }

    #[tokio::test]
    async fn test_watcher_debounces_and_reloads() {
        let f = fixture(Duration::from_millis(200));
        write_entry(&f.root, &echo("v1"));
        f.registry.discover_plugins().await;

        let reloads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reloads);
        f.manager
            .start_watching(
                Some(Arc::new(move |_: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                None,
            )
            .unwrap();
        assert!(f.manager.is_watching());
        assert!(matches!(
            f.manager.start_watching(None, None),
            Err(HotReloadError::AlreadyWatching)
        ));

        // A burst of saves collapses into one reload.
        for version in ["v2", "v3", "v4"] {
            write_entry(&f.root, &echo(version));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reloads.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(reloads.load(Ordering::SeqCst), 1);
        assert_eq!(message(&f.registry).await, "v4");

        assert!(f.manager.stop_watching().await);
        assert!(!f.manager.is_watching());
        assert!(!f.manager.stop_watching().await);
    }

    #[tokio::test]
    async fn test_watcher_reports_rollback() {
        let f = fixture(Duration::from_millis(200));
        write_entry(&f.root, &echo("v1"));
        f.registry.discover_plugins().await;

        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        f.manager
            .start_watching(
                None,
                Some(Arc::new(move |name: &str, reason: &str| {
                    seen.lock().unwrap().push((name.to_string(), reason.to_string()));
                })),
            )
            .unwrap();

        write_entry(&f.root, "(module");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while failures.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Let the rollback's own write pass through the watcher.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let failures = failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "echo");
        assert!(failures[0].1.contains("failed to load"));
        assert_eq!(message(&f.registry).await, "v1");

        f.manager.stop_watching().await;
    }
}
