//! Execution results returned by every plugin invocation

use crate::error::PluginError;
use chrono::{DateTime, Utc};
use ironclaw_plugin_api::{ExecutionStatus, PluginReply};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;

/// Outcome of one plugin invocation, with timing and resource telemetry
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub data: Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
    pub metadata: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            data: Value::Null,
            error: None,
            execution_time_ms: 0,
            memory_used_mb: 0.0,
            metadata: Map::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Successful result carrying `data`
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::new(ExecutionStatus::Success)
        }
    }

    /// Terminal result for `error`, tagged with its kind
    pub fn failure(error: &PluginError) -> Self {
        let mut result = Self::new(error.status());
        result.error = Some(error.to_string());
        result
            .metadata
            .insert("error_kind".to_string(), error.kind().as_str().into());
        result
    }

    /// Translate a plugin's wire reply
    ///
    /// A reply claiming a non-terminal status becomes an execution failure.
    pub fn from_reply(reply: PluginReply) -> Self {
        if !reply.status.is_terminal() {
            return Self::failure(&PluginError::Execution(format!(
                "plugin reported non-terminal status {}",
                reply.status
            )));
        }
        Self {
            data: reply.data,
            error: reply.error,
            metadata: reply.metadata,
            ..Self::new(reply.status)
        }
    }

    /// Convert back to the wire form used across process boundaries
    pub fn into_reply(self) -> PluginReply {
        PluginReply {
            status: self.status,
            data: self.data,
            error: self.error,
            metadata: self.metadata,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stamp the invocation window measured by the caller
    pub fn with_timing(mut self, started: Instant, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.completed_at = Some(Utc::now());
        self.execution_time_ms = elapsed_ms(started);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// Milliseconds since `started`, rounded up so finished work never reads 0
pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    let micros = started.elapsed().as_micros();
    let millis = micros.div_ceil(1000).max(1);
    u64::try_from(millis).unwrap_or(u64::MAX)
}
