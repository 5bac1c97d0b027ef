//! Configuration specification types for the converge engine.
//!
//! This module defines all the structs that map to the `converge.yaml` file.
//! These types are declarative and fully describe the desired state; they are
//! never mutated once loaded into a planning cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The root configuration structure for a converge project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergeConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Directory holding state and lock files (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// State key; defaults to `<project>-<environment>`.
    #[serde(default)]
    pub key: Option<String>,
    /// How long to wait for a contended lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// Process-local state, discarded on exit.
    Memory,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight within a wave.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-action timeout.
    #[serde(default)]
    pub action_timeout_secs: Option<u64>,
}

/// Whether a resource is managed or only read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    /// Created, updated and destroyed by the engine.
    #[default]
    Managed,
    /// Read-only data source, refreshed on every cycle.
    Data,
}

/// Identity of a resource: its type plus a logical name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type, which selects the provider.
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDefinition {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Managed resource or data source.
    #[serde(default)]
    pub mode: ResourceMode,
    /// Attribute values; strings may contain `${type.name.attr}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies in addition to the ones implied by references.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    /// Lifecycle customisation.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Lifecycle customisation for a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Attributes whose change forces destroy-then-create.
    #[serde(default)]
    pub replace_on_change: BTreeSet<String>,
}

// Default value functions

const fn default_lock_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: None,
            key: None,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            action_timeout_secs: None,
        }
    }
}

// Resource id string conversion

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses an identity from a string like `null_resource.net`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not exactly `type.name`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (resource_type, name) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid resource identity: {s}. Expected format: TYPE.NAME"))?;

        if resource_type.is_empty() || name.is_empty() || name.contains('.') {
            return Err(format!("Invalid resource identity: {s}. Expected format: TYPE.NAME"));
        }

        Ok(Self::new(resource_type, name))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl ResourceDefinition {
    /// Creates a managed resource with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            mode: ResourceMode::Managed,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Turns this definition into a data source.
    #[must_use]
    pub fn as_data_source(mut self) -> Self {
        self.mode = ResourceMode::Data;
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Marks an attribute as forcing replacement when it changes.
    #[must_use]
    pub fn replace_on_change(mut self, attribute: impl Into<String>) -> Self {
        self.lifecycle.replace_on_change.insert(attribute.into());
        self
    }

    /// Returns the identity of this definition.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Returns true for read-only data sources.
    #[must_use]
    pub const fn is_data_source(&self) -> bool {
        matches!(self.mode, ResourceMode::Data)
    }

    /// Returns true if a change to `attribute` must replace the resource.
    #[must_use]
    pub fn replaces_on_change(&self, attribute: &str) -> bool {
        self.lifecycle.replace_on_change.contains(attribute)
    }
}

impl ConvergeConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the state key used for this configuration.
    #[must_use]
    pub fn state_key(&self) -> String {
        self.state
            .key
            .clone()
            .unwrap_or_else(|| self.qualified_name())
    }

    /// Returns the number of data sources.
    #[must_use]
    pub fn data_source_count(&self) -> usize {
        self.resources.iter().filter(|r| r.is_data_source()).count()
    }
}

impl fmt::Display for ResourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Self::Managed => "managed",
            Self::Data => "data",
        };
        write!(f, "{mode}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id = ResourceId::parse("null_resource.net").unwrap();
        assert_eq!(id.resource_type, "null_resource");
        assert_eq!(id.name, "net");
        assert_eq!(id.to_string(), "null_resource.net");
    }

    #[test]
    fn test_resource_id_invalid() {
        assert!(ResourceId::parse("invalid").is_err());
        assert!(ResourceId::parse(".name").is_err());
        assert!(ResourceId::parse("a.b.c").is_err());
    }

    #[test]
    fn test_state_key_defaults_to_qualified_name() {
        let config = ConvergeConfig {
            project: ProjectConfig {
                name: String::from("hana"),
                environment: String::from("prod"),
            },
            state: StateConfig::default(),
            execution: ExecutionConfig::default(),
            resources: vec![],
        };
        assert_eq!(config.state_key(), "hana-prod");
        assert_eq!(config.execution.concurrency, 4);
        assert_eq!(config.state.lock_timeout_secs, 30);
    }
}
