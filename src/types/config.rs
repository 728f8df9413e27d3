//! Configuration structures.
//!
//! Configuration is produced externally (typically by a compiler over a
//! declarative model) and handed to the kernel once at build time. Every
//! structure here is plain serde data; pluggable implementations are named by
//! identifier and resolved against the registrations on
//! [`crate::kernel::KernelBuilder`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Asset monitoring configuration.
    #[serde(default)]
    pub assets: AssetConfig,

    /// Teams available to every office.
    #[serde(default)]
    pub teams: Vec<TeamConfig>,

    /// Managed object sources available to every office.
    #[serde(default)]
    pub managed_object_sources: Vec<ManagedObjectSourceConfig>,

    /// Offices hosted by the kernel.
    #[serde(default)]
    pub offices: Vec<OfficeConfig>,
}

impl KernelConfig {
    /// Parse configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Asset monitoring and scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// How often waiting assets are checked for timeouts.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Start the background asset monitor when the kernel opens. Outside a
    /// tokio runtime it runs on a dedicated thread.
    pub monitor_on_open: bool,

    /// Job nodes a thread may run inline before yielding to its team.
    pub max_nodes_per_run: usize,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(100),
            monitor_on_open: true,
            max_nodes_per_run: 64,
        }
    }
}

/// Team configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Unique team name.
    pub name: String,

    /// Team source identifier (`passive`, `worker_pool`, `one_person`,
    /// `tokio`, or a registered custom source).
    pub source: String,

    /// Source-specific properties (e.g. `size`).
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Managed object source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedObjectSourceConfig {
    /// Unique source name.
    pub name: String,

    /// Registered source identifier.
    pub source: String,

    /// Registered pool factory identifier (optional).
    #[serde(default)]
    pub pool: Option<String>,

    /// Maximum time to wait for an instance to be sourced.
    #[serde(with = "humantime_serde", default = "default_source_timeout")]
    pub timeout: Duration,

    /// Maximum time an asynchronous operation may remain in progress.
    #[serde(with = "humantime_serde", default = "default_source_timeout")]
    pub async_timeout: Duration,

    /// Source-specific properties.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Scope a managed object lives for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedObjectScope {
    /// One instance per function node.
    Function,
    /// One instance per thread of execution.
    Thread,
    /// One instance per process (unit of work).
    Process,
}

impl ManagedObjectScope {
    /// Whether an object of this scope may depend on an object of `other`.
    pub fn may_depend_on(self, other: ManagedObjectScope) -> bool {
        other >= self
    }
}

/// Office configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfficeConfig {
    /// Unique office name.
    pub name: String,

    /// Team used for functions without an explicit team (default: passive).
    #[serde(default)]
    pub default_team: Option<String>,

    /// Managed objects bound into the office.
    #[serde(default)]
    pub managed_objects: Vec<ManagedObjectConfig>,

    /// Governance available to functions of the office.
    #[serde(default)]
    pub governance: Vec<GovernanceConfig>,

    /// Functions of the office.
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,

    /// Office-level escalation procedure.
    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,
}

/// Managed object bound into an office.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedObjectConfig {
    /// Unique name within the office.
    pub name: String,

    /// Name of the managed object source providing instances.
    pub source: String,

    /// Scope of each instance.
    pub scope: ManagedObjectScope,

    /// Dependencies (for coordinating managed objects).
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

/// A dependency of a coordinating managed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Symbolic key (positional when omitted).
    #[serde(default)]
    pub key: Option<String>,

    /// Name of the managed object satisfying the dependency.
    pub object: String,
}

/// Function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Unique name within the office.
    pub name: String,

    /// Registered function logic identifier.
    pub function: String,

    /// Responsible team (default: the office default team).
    #[serde(default)]
    pub team: Option<String>,

    /// Managed objects used by the function.
    #[serde(default)]
    pub objects: Vec<DependencyConfig>,

    /// Flows the function may instigate.
    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Function to continue with once this function completes.
    #[serde(default)]
    pub next: Option<String>,

    /// Function-level escalation procedure.
    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,

    /// Names of governance required active while the function executes.
    #[serde(default)]
    pub governance: Vec<String>,

    /// Duties run before the function.
    #[serde(default)]
    pub pre_administration: Vec<AdministrationConfig>,

    /// Duties run after the function.
    #[serde(default)]
    pub post_administration: Vec<AdministrationConfig>,
}

/// Flow a function, duty or governance activity may instigate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Symbolic key (positional when omitted).
    #[serde(default)]
    pub key: Option<String>,

    /// Function the flow starts with.
    pub function: String,

    /// Run the flow on its own thread of execution.
    #[serde(default)]
    pub spawn_thread: bool,
}

/// Escalation entry: fault type handled by a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Registered fault type name.
    pub fault_type: String,

    /// Function handling the fault.
    pub function: String,
}

/// Governance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Unique name within the office.
    pub name: String,

    /// Registered governance factory identifier.
    pub governance: String,

    /// Extension capability governed managed objects must provide.
    pub extension: String,

    /// Team running governance activities (default: the function's team).
    #[serde(default)]
    pub team: Option<String>,

    /// Flows governance activities may instigate.
    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Governance-level escalation procedure.
    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,
}

/// Administration (duty) attached to a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdministrationConfig {
    /// Duty name.
    pub name: String,

    /// Registered administration identifier.
    pub administration: String,

    /// Extension capability of the administered managed objects.
    pub extension: String,

    /// Names of the function's managed objects administered.
    #[serde(default)]
    pub objects: Vec<String>,

    /// Team running the duty (default: the function's team).
    #[serde(default)]
    pub team: Option<String>,

    /// Flows the duty may instigate.
    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Duty-level escalation procedure.
    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,
}

/// Parse a numeric team/source property, using `default` when absent.
pub fn property_usize(
    properties: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize> {
    match properties.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
            Error::configuration(format!("property {} must be a number, got '{}'", name, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_kernel_config_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.assets.max_nodes_per_run, 64);
        assert_eq!(config.observability.log_level, "info");
        assert!(config.offices.is_empty());
    }

    #[test]
    fn test_parse_json_with_humantime_durations() {
        let config = KernelConfig::from_json_str(
            r#"{
                "assets": { "check_interval": "250ms", "monitor_on_open": false, "max_nodes_per_run": 8 },
                "teams": [ { "name": "workers", "source": "worker_pool", "properties": { "size": "4" } } ],
                "managed_object_sources": [
                    { "name": "db", "source": "connections", "pool": "free_list", "timeout": "5s" }
                ],
                "offices": [ {
                    "name": "office",
                    "managed_objects": [ { "name": "conn", "source": "db", "scope": "process" } ],
                    "functions": [ { "name": "start", "function": "start", "objects": [ { "object": "conn" } ] } ]
                } ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.assets.check_interval, Duration::from_millis(250));
        assert_eq!(config.managed_object_sources[0].timeout, Duration::from_secs(5));
        assert_eq!(config.managed_object_sources[0].async_timeout, Duration::from_secs(30));
        assert_eq!(
            config.offices[0].managed_objects[0].scope,
            ManagedObjectScope::Process
        );
        assert_eq!(config.teams[0].properties.get("size").unwrap(), "4");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "offices": [ {{ "name": "o" }} ] }}"#).unwrap();
        let config = KernelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.offices[0].name, "o");
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let err = KernelConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_scope_dependency_rules() {
        use ManagedObjectScope::*;
        assert!(Function.may_depend_on(Thread));
        assert!(Function.may_depend_on(Process));
        assert!(Thread.may_depend_on(Process));
        assert!(Thread.may_depend_on(Thread));
        assert!(!Process.may_depend_on(Thread));
        assert!(!Thread.may_depend_on(Function));
    }

    #[test]
    fn test_property_usize() {
        let mut props = HashMap::new();
        assert_eq!(property_usize(&props, "size", 3).unwrap(), 3);
        props.insert("size".to_string(), " 7 ".to_string());
        assert_eq!(property_usize(&props, "size", 3).unwrap(), 7);
        props.insert("size".to_string(), "many".to_string());
        assert!(property_usize(&props, "size", 3).unwrap_err().is_configuration());
    }
}
