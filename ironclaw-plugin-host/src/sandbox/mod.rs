//! Process-isolated plugin execution
//!
//! Each invocation runs in its own worker process. The host side writes a
//! [`WorkerJob`] to the worker's stdin, supervises it with a polling monitor
//! loop and turns whatever happens into a terminal [`ExecutionResult`].

mod monitor;
pub mod worker;

pub use monitor::ProcessSample;
pub use worker::{PluginFactory, Worker, WorkerError, WorkerJob};

use crate::error::PluginError;
use crate::plugin::Plugin;
use crate::result::ExecutionResult;
use chrono::Utc;
use ironclaw_plugin_api::PluginReply;
use monitor::{MonitorOutcome, MonitorReport, MonitorSettings};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// File name of the bundled worker binary
pub const WORKER_BINARY: &str = "plugin-worker";

/// Sandbox settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Monitor polling interval
    pub poll_interval: Duration,
    /// Time a worker gets to exit after the graceful signal
    pub kill_grace: Duration,
    /// Program spawned for every invocation
    pub worker_program: PathBuf,
    /// Extra arguments passed to the worker program
    pub worker_args: Vec<String>,
    /// Wasm fuel budget forwarded to workers
    pub fuel: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            kill_grace: Duration::from_secs(1),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            fuel: None,
        }
    }
}

/// The worker binary installed next to the current executable
pub fn default_worker_program() -> PathBuf {
    let file_name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// Live snapshot of a running worker
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub pid: Option<u32>,
    pub running_ms: u64,
    pub active_workers: usize,
    /// Most recent monitor reading; `None` before the first poll
    pub sample: Option<ProcessSample>,
}

struct ActiveWorker {
    id: u64,
    pid: Option<u32>,
    started: Instant,
    cancel: Arc<Notify>,
    latest: Arc<Mutex<Option<ProcessSample>>>,
}

type ActiveTable = Arc<Mutex<HashMap<String, Vec<ActiveWorker>>>>;

/// Removes a worker from the active table when its invocation ends
struct Registration {
    active: ActiveTable,
    name: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut active = lock(&self.active);
        if let Some(workers) = active.get_mut(&self.name) {
            workers.retain(|worker| worker.id != self.id);
            if workers.is_empty() {
                active.remove(&self.name);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs plugin invocations in supervised worker processes
pub struct Sandbox {
    config: SandboxConfig,
    active: ActiveTable,
    next_id: AtomicU64,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one `execute` of `plugin` in a worker process
    ///
    /// `timeout_override` replaces the descriptor's time limit; `Some(0)` is
    /// treated as no override. Never fails: every outcome is a terminal
    /// result.
    pub async fn execute(
        &self,
        plugin: &dyn Plugin,
        args: &Value,
        timeout_override: Option<u64>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let name = plugin.name().to_string();
        let limits = plugin.descriptor().limits().clone();
        let timeout_seconds = match timeout_override {
            Some(seconds) if seconds > 0 => seconds,
            _ => limits.max_execution_time_seconds,
        };

        let Some(target) = plugin.worker_target() else {
            let error = PluginError::Sandbox(format!(
                "plugin {name} cannot be isolated in a worker process"
            ));
            return ExecutionResult::failure(&error).with_timing(started, started_at);
        };

        let job = WorkerJob {
            plugin: name.clone(),
            target,
            args: args.clone(),
            limits,
            timeout_seconds,
            fuel: self.config.fuel,
        };

        let result = match self.run_worker(job).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Sandboxed execution failed");
                ExecutionResult::failure(&e)
            }
        };
        result.with_timing(started, started_at)
    }

    /// Terminate every live worker for `name`
    pub fn cancel_plugin(&self, name: &str) -> bool {
        let active = lock(&self.active);
        let Some(workers) = active.get(name).filter(|workers| !workers.is_empty()) else {
            return false;
        };

        for worker in workers {
            worker.cancel.notify_one();
        }
        tracing::info!(plugin = %name, workers = workers.len(), "Cancelling plugin");
        true
    }

    /// Latest stats for the newest live worker of `name`
    pub fn get_plugin_stats(&self, name: &str) -> Option<PluginStats> {
        let active = lock(&self.active);
        let workers = active.get(name)?;
        let newest = workers.last()?;
        let sample = lock(&newest.latest).clone();

        Some(PluginStats {
            pid: newest.pid,
            running_ms: u64::try_from(newest.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            active_workers: workers.len(),
            sample,
        })
    }

    /// Names with at least one live worker
    pub fn get_active_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.active).keys().cloned().collect();
        names.sort();
        names
    }

    async fn run_worker(&self, job: WorkerJob) -> Result<ExecutionResult, PluginError> {
        let payload = serde_json::to_vec(&job)
            .map_err(|e| PluginError::Sandbox(format!("failed to encode job: {e}")))?;

        let mut child = Command::new(&self.config.worker_program)
            .args(&self.config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginError::Sandbox(format!(
                    "failed to spawn worker {}: {e}",
                    self.config.worker_program.display()
                ))
            })?;

        let pid = child.id();
        tracing::debug!(plugin = %job.plugin, pid = ?pid, "Spawned worker");

        send_job(&mut child, payload);
        let reply = collect_stdout(&mut child);
        forward_stderr(&mut child, &job.plugin);

        let cancel = Arc::new(Notify::new());
        let latest = Arc::new(Mutex::new(None));
        let _registration = self.register(&job.plugin, pid, &cancel, &latest);

        let settings = MonitorSettings {
            poll_interval: self.config.poll_interval,
            kill_grace: self.config.kill_grace,
            timeout: Duration::from_secs(job.timeout_seconds),
            limits: job.limits.clone(),
        };
        let report = monitor::supervise(&mut child, &settings, &cancel, &latest).await;

        Ok(conclude(&job, pid, report, reply, self.config.kill_grace).await)
    }

    fn register(
        &self,
        name: &str,
        pid: Option<u32>,
        cancel: &Arc<Notify>,
        latest: &Arc<Mutex<Option<ProcessSample>>>,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.active)
            .entry(name.to_string())
            .or_default()
            .push(ActiveWorker {
                id,
                pid,
                started: Instant::now(),
                cancel: Arc::clone(cancel),
                latest: Arc::clone(latest),
            });

        Registration {
            active: Arc::clone(&self.active),
            name: name.to_string(),
            id,
        }
    }
}

/// Write the job line without blocking the monitor on a worker that never
/// reads it
fn send_job(child: &mut Child, mut payload: Vec<u8>) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    payload.push(b'\n');
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::debug!(error = %e, "Worker did not accept its job");
        }
    });
}

/// Tracks the last non-empty line a worker printed
struct ReplyReader {
    last_line: Arc<Mutex<Option<String>>>,
    task: JoinHandle<std::io::Result<()>>,
}

fn collect_stdout(child: &mut Child) -> Option<ReplyReader> {
    let stdout = child.stdout.take()?;
    let last_line = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&last_line);
    let task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if !line.is_empty() {
                *lock(&sink) = Some(line.to_string());
            }
        }
    });
    Some(ReplyReader { last_line, task })
}

fn forward_stderr(child: &mut Child, plugin: &str) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let plugin = plugin.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(plugin = %plugin, "worker: {line}");
        }
    });
}

async fn conclude(
    job: &WorkerJob,
    pid: Option<u32>,
    report: MonitorReport,
    reply: Option<ReplyReader>,
    grace: Duration,
) -> ExecutionResult {
    let mut memory_used_mb = report.last_memory_mb;

    let result = match report.outcome {
        MonitorOutcome::Exited(Ok(status)) => match read_reply(reply, grace).await {
            Ok(reply) => ExecutionResult::from_reply(reply),
            Err(detail) => {
                let error = PluginError::ProcessCrash(match detail {
                    Some(detail) => format!("{status}; {detail}"),
                    None => status.to_string(),
                });
                tracing::warn!(plugin = %job.plugin, error = %error, "Worker crashed");
                ExecutionResult::failure(&error)
            }
        },
        MonitorOutcome::Exited(Err(e)) => {
            ExecutionResult::failure(&PluginError::Sandbox(format!("failed to wait for worker: {e}")))
        }
        MonitorOutcome::TimedOut => {
            ExecutionResult::failure(&PluginError::Timeout(job.timeout_seconds))
        }
        MonitorOutcome::MemoryExceeded { used_mb } => {
            memory_used_mb = used_mb;
            ExecutionResult::failure(&PluginError::ResourceLimit {
                used_mb,
                limit_mb: job.limits.max_memory_mb,
            })
        }
        MonitorOutcome::Cancelled => {
            ExecutionResult::failure(&PluginError::Cancelled(job.plugin.clone()))
        }
    };

    let mut result = result
        .with_metadata("peak_memory_mb", report.peak_memory_mb)
        .with_metadata("cpu_limit_breaches", report.cpu_breaches);
    if let Some(pid) = pid {
        result = result.with_metadata("worker_pid", pid);
    }
    result.memory_used_mb = memory_used_mb;
    result
}

/// The worker's reply is its last non-empty stdout line; `Err` carries an
/// optional detail when no usable reply exists
///
/// Stdout may outlive the worker when a descendant inherited it, so the
/// reader gets `grace` to reach end of stream before the lines seen so far
/// are used.
async fn read_reply(
    reply: Option<ReplyReader>,
    grace: Duration,
) -> Result<PluginReply, Option<String>> {
    let Some(ReplyReader { last_line, mut task }) = reply else {
        return Err(None);
    };

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(Some(format!("failed to read output: {e}"))),
        Ok(Err(e)) => return Err(Some(format!("output reader failed: {e}"))),
        Err(_) => {
            task.abort();
            tracing::debug!("Worker stdout still open after exit");
        }
    }

    let line = lock(&last_line).take();
    let Some(line) = line else {
        return Err(None);
    };
    serde_json::from_str(&line).map_err(|e| Some(format!("unreadable reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::WorkerTarget;
    use crate::testing::StubPlugin;
    use ironclaw_plugin_api::{ExecutionStatus, PluginDescriptor};
    use serde_json::json;

    /// A plugin whose worker is an arbitrary shell script
    struct ScriptedPlugin(StubPlugin);

    #[async_trait::async_trait]
    impl Plugin for ScriptedPlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            self.0.descriptor()
        }

        fn hooks(&self) -> &crate::plugin::LifecycleHooks {
            self.0.hooks()
        }

        async fn execute(&self, args: &Value) -> Result<ExecutionResult, PluginError> {
            self.0.execute(args).await
        }

        async fn validate(&self, args: &Value) -> Result<bool, PluginError> {
            self.0.validate(args).await
        }

        fn worker_target(&self) -> Option<WorkerTarget> {
            Some(WorkerTarget::Factory {
                name: self.name().to_string(),
            })
        }
    }

    fn scripted(name: &str) -> ScriptedPlugin {
        ScriptedPlugin(StubPlugin::new(name))
    }

    fn sandbox(script: &str) -> Sandbox {
        Sandbox::new(SandboxConfig {
            worker_program: PathBuf::from("sh"),
            worker_args: vec!["-c".to_string(), script.to_string()],
            kill_grace: Duration::from_millis(500),
            ..SandboxConfig::default()
        })
    }

    #[tokio::test]
    async fn test_reply_is_translated() {
        let sandbox = sandbox(
            r#"cat >/dev/null; echo 'noise'; echo '{"status":"success","data":{"ok":true}}'"#,
        );
        let result = sandbox.execute(&scripted("echo"), &json!({}), None).await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.data["ok"], true);
        assert!(result.execution_time_ms > 0);
        assert!(result.metadata.contains_key("worker_pid"));
        assert!(sandbox.get_active_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_inherited_stdout_does_not_hold_the_reply() {
        let sandbox = sandbox(
            r#"cat >/dev/null; echo '{"status":"success","data":{"ok":true}}'; sleep 10 & exit 0"#,
        );
        let started = Instant::now();
        let result = sandbox.execute(&scripted("forky"), &json!({}), None).await;

        assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
        assert_eq!(result.data["ok"], true);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cpu_breach_is_counted_not_fatal() {
        let descriptor = PluginDescriptor::builder("busy", "1.0.0")
            .max_cpu_percent(10.0)
            .build()
            .unwrap();
        let plugin = ScriptedPlugin(StubPlugin::with_descriptor(descriptor));
        let sandbox = sandbox(
            r#"cat >/dev/null
end=$(( $(date +%s) + 2 ))
while [ "$(date +%s)" -lt "$end" ]; do
  i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done
done
echo '{"status":"success","data":{"done":true}}'"#,
        );

        let result = sandbox.execute(&plugin, &json!({}), None).await;

        assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.error);
        assert_eq!(result.data["done"], true);
        let breaches = result.metadata["cpu_limit_breaches"].as_u64().unwrap();
        assert!(breaches > 0, "no breach recorded");
    }

    #[tokio::test]
    async fn test_exit_without_reply_is_a_crash() {
        let sandbox = sandbox("exit 3");
        let result = sandbox.execute(&scripted("crashy"), &json!({}), None).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("exited without result"));
        assert_eq!(result.metadata["error_kind"], "process_crash");
    }

    #[tokio::test]
    async fn test_timeout_override() {
        let sandbox = sandbox("sleep 10");
        let started = Instant::now();
        let result = sandbox.execute(&scripted("slow"), &json!({}), Some(1)).await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(sandbox.get_active_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_stats() {
        let sandbox = Arc::new(sandbox("sleep 10"));
        assert!(!sandbox.cancel_plugin("slow"));
        assert!(sandbox.get_plugin_stats("slow").is_none());

        let running = Arc::clone(&sandbox);
        let task = tokio::spawn(async move {
            running.execute(&scripted("slow"), &json!({}), None).await
        });

        while sandbox.get_active_plugins().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let stats = sandbox.get_plugin_stats("slow").unwrap();
        assert!(stats.pid.is_some());
        assert_eq!(stats.active_workers, 1);
        assert!(stats.sample.is_some());

        assert!(sandbox.cancel_plugin("slow"));
        let result = task.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(sandbox.get_active_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_plugin_without_target_is_rejected() {
        let sandbox = sandbox("true");
        let result = sandbox
            .execute(&StubPlugin::new("native"), &json!({}), None)
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("cannot be isolated"));
    }

    #[tokio::test]
    async fn test_missing_worker_program() {
        let sandbox = Sandbox::new(SandboxConfig {
            worker_program: PathBuf::from("/nonexistent/plugin-worker"),
            ..SandboxConfig::default()
        });
        let result = sandbox.execute(&scripted("echo"), &json!({}), None).await;
        assert_eq!(result.metadata["error_kind"], "sandbox");
    }
}
