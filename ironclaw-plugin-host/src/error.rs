//! Failure taxonomy shared by the registry, sandbox and hot reload manager
//!
//! Public operations never surface these as `Err` to the host: they are
//! folded into a terminal [`ExecutionResult`](crate::ExecutionResult) or a
//! boolean return, with the message logged.

use ironclaw_plugin_api::ExecutionStatus;
use serde::Serialize;
use thiserror::Error;

/// Every way a plugin operation can go wrong
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    #[error("Memory limit exceeded: {used_mb:.1}MB > {limit_mb}MB")]
    ResourceLimit { used_mb: f64, limit_mb: u64 },

    #[error("Plugin process exited without result ({0})")]
    ProcessCrash(String),

    #[error("Plugin {plugin} has unmet dependency {dependency}: {reason}")]
    Dependency {
        plugin: String,
        dependency: String,
        reason: &'static str,
    },

    #[error("Failed to reload plugin {plugin}: {reason}")]
    Reload { plugin: String, reason: String },

    #[error("Plugin {0} not found in registry")]
    NotFound(String),

    #[error("Plugin {0} is disabled")]
    Disabled(String),

    #[error("Plugin {0} was cancelled")]
    Cancelled(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),
}

/// Stable, serializable tag for a [`PluginError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    Timeout,
    ResourceLimit,
    ProcessCrash,
    Dependency,
    Reload,
    NotFound,
    Disabled,
    Cancelled,
    Sandbox,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::ResourceLimit => "resource_limit",
            Self::ProcessCrash => "process_crash",
            Self::Dependency => "dependency",
            Self::Reload => "reload",
            Self::NotFound => "not_found",
            Self::Disabled => "disabled",
            Self::Cancelled => "cancelled",
            Self::Sandbox => "sandbox",
        }
    }
}

impl PluginError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::ProcessCrash(_) => ErrorKind::ProcessCrash,
            Self::Dependency { .. } => ErrorKind::Dependency,
            Self::Reload { .. } => ErrorKind::Reload,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Sandbox(_) => ErrorKind::Sandbox,
        }
    }

    /// Terminal status an invocation ends in when this error occurs
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Timeout(_) => ExecutionStatus::Timeout,
            Self::Cancelled(_) => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        }
    }
}
