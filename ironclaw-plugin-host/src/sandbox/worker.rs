//! Worker side of the sandbox
//!
//! A worker process reads one [`WorkerJob`] line from stdin, runs the plugin
//! in a fresh current-thread runtime and writes one
//! [`PluginReply`](ironclaw_plugin_api::PluginReply) line to stdout.

use crate::error::PluginError;
use crate::loader::{read_module, LoaderConfig, LoaderError, PluginLoader};
use crate::plugin::{Plugin, WorkerTarget};
use crate::result::ExecutionResult;
use crate::wasm::{module_digest, WasmPlugin};
use ironclaw_plugin_api::{PluginReply, ResourceLimits};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

/// One invocation handed to a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub plugin: String,
    pub target: WorkerTarget,
    pub args: Value,
    pub limits: ResourceLimits,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub fuel: Option<u64>,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to read job: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed job: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("No factory registered for plugin {0}")]
    UnknownFactory(String),

    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error("Job is for plugin {expected} but module declares {declared}")]
    WrongPlugin { expected: String, declared: String },

    #[error("Module digest is {found}, job expects {expected}")]
    StaleModule { expected: String, found: String },
}

/// Builds a native plugin inside the worker
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Worker process entry point
#[derive(Default)]
pub struct Worker {
    factories: HashMap<String, PluginFactory>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a native plugin available under [`WorkerTarget::Factory`]
    pub fn with_factory(
        mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Serve one job over stdin/stdout
    ///
    /// Also applies best-effort OS ceilings to the current process, so call it
    /// only from a dedicated worker binary.
    pub fn run(&self) -> ExitCode {
        let reply = match read_job(std::io::stdin().lock()) {
            Ok(job) => {
                if let Err(e) = apply_os_limits(&job) {
                    tracing::warn!(error = %e, "Could not apply OS resource limits");
                }
                self.run_job(job)
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker could not read its job");
                PluginReply::failed(e.to_string())
            }
        };

        match write_reply(std::io::stdout().lock(), &reply) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Worker could not write its reply");
                ExitCode::FAILURE
            }
        }
    }

    /// Run `job` to completion on a fresh runtime
    pub fn run_job(&self, job: WorkerJob) -> PluginReply {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return PluginReply::failed(format!("Failed to start worker runtime: {e}")),
        };

        runtime.block_on(async {
            match self.execute(job).await {
                Ok(reply) => reply,
                Err(e) => ExecutionResult::failure(&PluginError::Execution(e.to_string()))
                    .into_reply(),
            }
        })
    }

    async fn execute(&self, job: WorkerJob) -> Result<PluginReply, WorkerError> {
        let plugin = self.instantiate(&job)?;
        if plugin.name() != job.plugin {
            return Err(WorkerError::WrongPlugin {
                expected: job.plugin,
                declared: plugin.name().to_string(),
            });
        }

        tracing::debug!(plugin = %job.plugin, "Worker executing plugin");
        let task_plugin = Arc::clone(&plugin);
        let args = job.args;
        let outcome = tokio::spawn(async move { task_plugin.execute(&args).await }).await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::failure(&e),
            Err(e) => ExecutionResult::failure(&PluginError::Execution(format!(
                "plugin panicked: {e}"
            ))),
        };

        plugin.cleanup().await;
        Ok(result.into_reply())
    }

    fn instantiate(&self, job: &WorkerJob) -> Result<Arc<dyn Plugin>, WorkerError> {
        match &job.target {
            WorkerTarget::Module { path, digest } => {
                let bytes = read_module(path)?;
                let found = module_digest(&bytes);
                if found != *digest {
                    return Err(WorkerError::StaleModule {
                        expected: digest.clone(),
                        found,
                    });
                }
                let loader = PluginLoader::new(LoaderConfig {
                    fuel: job.fuel,
                    memory_ceiling_bytes: memory_ceiling(&job.limits),
                })?;
                Ok(Arc::new(WasmPlugin::from_bytes(&loader, path, bytes)?))
            }
            WorkerTarget::Factory { name } => self
                .factories
                .get(name)
                .map(|factory| factory())
                .ok_or_else(|| WorkerError::UnknownFactory(name.clone())),
        }
    }
}

/// Linear memory ceiling for the guest
///
/// Twice the declared limit, so the host monitor is the one that observes
/// and reports a breach.
fn memory_ceiling(limits: &ResourceLimits) -> Option<usize> {
    limits
        .max_memory_mb
        .checked_mul(2 * 1024 * 1024)
        .and_then(|bytes| usize::try_from(bytes).ok())
}

pub(crate) fn read_job(mut input: impl BufRead) -> Result<WorkerJob, WorkerError> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(serde_json::from_str(line.trim())?)
}

pub(crate) fn write_reply(mut output: impl Write, reply: &PluginReply) -> Result<(), WorkerError> {
    serde_json::to_writer(&mut output, reply)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

#[cfg(unix)]
fn apply_os_limits(job: &WorkerJob) -> std::io::Result<()> {
    let seconds = job.timeout_seconds.saturating_add(1) as libc::rlim_t;
    let limit = libc::rlimit {
        rlim_cur: seconds,
        rlim_max: seconds.saturating_add(1),
    };
    // SAFETY: setrlimit only reads the struct we pass.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CPU, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn apply_os_limits(_job: &WorkerJob) -> std::io::Result<()> {
    Ok(())
}
