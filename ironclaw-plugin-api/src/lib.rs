//! ironclaw-plugin-api: Shared types for the ironclaw plugin system
//!
//! This crate defines the protocol between the host, its sandbox workers and
//! guest (wasm) plugins. Everything that crosses a process or module boundary
//! is JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Allowed range for `max_execution_time_seconds`
pub const EXECUTION_TIME_RANGE: (u64, u64) = (1, 300);

/// Allowed range for `max_memory_mb`
pub const MEMORY_RANGE_MB: (u64, u64) = (64, 2048);

/// Allowed range for `max_cpu_percent`
pub const CPU_PERCENT_RANGE: (f64, f64) = (10.0, 100.0);

/// Errors raised when a descriptor fails validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DescriptorError {
    #[error("Plugin name and version are required")]
    MissingIdentity,

    #[error("Execution time must be between 1 and 300 seconds (got {0})")]
    ExecutionTime(u64),

    #[error("Memory limit must be between 64MB and 2048MB (got {0}MB)")]
    Memory(u64),

    #[error("CPU limit must be between 10% and 100% (got {0}%)")]
    Cpu(f64),
}

/// Resource envelope a plugin declares for each invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget per invocation
    #[serde(default = "default_execution_time")]
    pub max_execution_time_seconds: u64,

    /// Resident memory ceiling of the worker process
    #[serde(default = "default_memory")]
    pub max_memory_mb: u64,

    /// CPU utilisation ceiling, advisory only
    #[serde(default = "default_cpu")]
    pub max_cpu_percent: f64,
}

fn default_execution_time() -> u64 {
    30
}

fn default_memory() -> u64 {
    512
}

fn default_cpu() -> f64 {
    50.0
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time_seconds: default_execution_time(),
            max_memory_mb: default_memory(),
            max_cpu_percent: default_cpu(),
        }
    }
}

impl ResourceLimits {
    /// Check every limit against its allowed range
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let (lo, hi) = EXECUTION_TIME_RANGE;
        if !(lo..=hi).contains(&self.max_execution_time_seconds) {
            return Err(DescriptorError::ExecutionTime(
                self.max_execution_time_seconds,
            ));
        }

        let (lo, hi) = MEMORY_RANGE_MB;
        if !(lo..=hi).contains(&self.max_memory_mb) {
            return Err(DescriptorError::Memory(self.max_memory_mb));
        }

        let (lo, hi) = CPU_PERCENT_RANGE;
        // NaN fails both comparisons, so test the positive range.
        if !(self.max_cpu_percent >= lo && self.max_cpu_percent <= hi) {
            return Err(DescriptorError::Cpu(self.max_cpu_percent));
        }

        Ok(())
    }
}

/// Immutable plugin metadata, fixed at load time
///
/// Construct through [`PluginDescriptor::builder`]; deserialization runs the
/// same validation, so an out-of-range manifest never yields a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorBuilder")]
pub struct PluginDescriptor {
    name: String,
    version: String,
    description: String,
    author: String,
    dependencies: Vec<String>,
    limits: ResourceLimits,
    requires_network: bool,
    allowed_domains: Vec<String>,
    required_permissions: Vec<String>,
    enabled: bool,
    tags: Vec<String>,
}

impl PluginDescriptor {
    /// Start building a descriptor
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(name, version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Names of plugins that must be registered and enabled first
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    /// Declared network domains (metadata only, not enforced)
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    pub fn required_permissions(&self) -> &[String] {
        &self.required_permissions
    }

    /// Initial enabled state when the plugin is registered
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

/// Builder for [`PluginDescriptor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorBuilder {
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_author")]
    pub author: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub requires_network: bool,

    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default)]
    pub required_permissions: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_author() -> String {
    "Unknown".to_string()
}

fn default_enabled() -> bool {
    true
}

impl DescriptorBuilder {
    /// Create a builder with default limits
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: default_author(),
            dependencies: Vec::new(),
            limits: ResourceLimits::default(),
            requires_network: false,
            allowed_domains: Vec::new(),
            required_permissions: Vec::new(),
            enabled: true,
            tags: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Add a dependency on another plugin
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_execution_time_seconds(mut self, seconds: u64) -> Self {
        self.limits.max_execution_time_seconds = seconds;
        self
    }

    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.limits.max_memory_mb = mb;
        self
    }

    pub fn max_cpu_percent(mut self, percent: f64) -> Self {
        self.limits.max_cpu_percent = percent;
        self
    }

    /// Declare network access restricted to the given domains
    pub fn network(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.requires_network = true;
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Validate and freeze the descriptor
    pub fn build(self) -> Result<PluginDescriptor, DescriptorError> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(DescriptorError::MissingIdentity);
        }
        self.limits.validate()?;

        Ok(PluginDescriptor {
            name: self.name,
            version: self.version,
            description: self.description,
            author: self.author,
            dependencies: self.dependencies,
            limits: self.limits,
            requires_network: self.requires_network,
            allowed_domains: self.allowed_domains,
            required_permissions: self.required_permissions,
            enabled: self.enabled,
            tags: self.tags,
        })
    }
}

impl TryFrom<DescriptorBuilder> for PluginDescriptor {
    type Error = DescriptorError;

    fn try_from(builder: DescriptorBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

/// Lifecycle status of one plugin invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// Success, Failed, Timeout and Cancelled never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome message produced by a plugin
///
/// Returned by a guest's `plugin_execute` export and written by a sandbox
/// worker on its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginReply {
    pub status: ExecutionStatus,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PluginReply {
    /// Create a success reply
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            data: data.into(),
            error: None,
            metadata: Map::new(),
        }
    }

    /// Create a failed reply
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            data: Value::Null,
            error: Some(message.into()),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Plugin manifest with API version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Plugin identity, limits and requirements
    pub descriptor: PluginDescriptor,
}

impl PluginManifest {
    /// Create a manifest for the current API version
    pub fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            api_version: API_VERSION,
            descriptor,
        }
    }
}
