//! Error types for the converge engine.
//!
//! Errors are split by the phase that raises them. Structural errors
//! (configuration, definitions, state, planning) abort an operation before any
//! resource is touched. Provider errors are raised per action and are
//! contained by the executor in its apply report.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or inconsistent resource definitions.
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors surfaced outside of an apply (e.g. drift detection).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override holds a value of the wrong shape.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Errors in the declared resource definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Two definitions share the same identity.
    #[error("Duplicate resource identity: {id}")]
    DuplicateIdentity {
        /// The duplicated identity.
        id: String,
    },

    /// A reference names a resource that is not defined.
    #[error("Resource {from} references undefined resource {target}")]
    UnresolvedReference {
        /// Identity of the referencing resource.
        from: String,
        /// The reference that could not be resolved.
        target: String,
    },

    /// A reference expression could not be parsed.
    #[error("Malformed expression in {resource}.{attribute}: {expression}")]
    MalformedExpression {
        /// Identity of the resource holding the expression.
        resource: String,
        /// Attribute holding the expression.
        attribute: String,
        /// The offending expression text.
        expression: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}' (used by {id})")]
    UnknownResourceType {
        /// The resource type.
        resource_type: String,
        /// Identity of the resource using it.
        id: String,
    },

    /// A reference points at an attribute that does not exist.
    #[error("Resource {from} references missing attribute {target}")]
    MissingAttribute {
        /// Identity of the referencing resource.
        from: String,
        /// The full reference.
        target: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted (checksum or schema validation failed).
    #[error("State '{key}' is corrupted: {message}")]
    Corrupted {
        /// State key.
        key: String,
        /// Description of the corruption.
        message: String,
    },

    /// The lock could not be acquired before the timeout elapsed.
    #[error("Timed out after {waited_secs}s waiting for lock on '{key}' (held by {holder} since {since})")]
    LockTimeout {
        /// State key.
        key: String,
        /// Identifier of the current lock holder.
        holder: String,
        /// When the current holder acquired the lock.
        since: String,
        /// How long we waited.
        waited_secs: u64,
    },

    /// The lock was lost, expired or the state moved since acquisition.
    #[error("Stale lock on '{key}': {message}")]
    StaleLock {
        /// State key.
        key: String,
        /// Description of what went stale.
        message: String,
    },

    /// Lock file or storage could not be written.
    #[error("Failed to access state storage: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected at most {expected}, found {found}")]
    VersionMismatch {
        /// Highest supported state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A dependency cycle was found.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Identities forming the cycle, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A saved plan no longer matches the state it was computed against.
    #[error("Saved plan is stale: planned against serial {planned}, state is at serial {current}")]
    StalePlan {
        /// Serial the plan was built against.
        planned: u64,
        /// Current state serial.
        current: u64,
    },

    /// A saved plan targets a different state key.
    #[error("Saved plan targets state '{planned}' but the configuration uses '{current}'")]
    KeyMismatch {
        /// Key recorded in the plan.
        planned: String,
        /// Key of the current configuration.
        current: String,
    },
}

/// Errors raised by a provider while handling a single action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote object does not exist.
    #[error("{id} not found")]
    NotFound {
        /// Identity of the missing resource.
        id: String,
    },

    /// The provider rejected the action.
    #[error("{id}: {message}")]
    Failed {
        /// Identity of the resource.
        id: String,
        /// Provider message.
        message: String,
    },

    /// An attribute has the wrong shape for this provider.
    #[error("{id}: invalid attribute '{attribute}': {message}")]
    InvalidAttribute {
        /// Identity of the resource.
        id: String,
        /// Attribute name.
        attribute: String,
        /// What is wrong with it.
        message: String,
    },

    /// The action did not finish within the configured timeout.
    #[error("{id}: timed out after {secs}s")]
    Timeout {
        /// Identity of the resource.
        id: String,
        /// Timeout in seconds.
        secs: u64,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error was raised before any resource was touched.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Definition(_) | Self::State(_) | Self::Plan(_)
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error for a key.
    #[must_use]
    pub fn corrupted(key: &str, message: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Creates a stale-lock error for a key.
    #[must_use]
    pub fn stale(key: &str, message: impl Into<String>) -> Self {
        Self::StaleLock {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a generic provider failure.
    #[must_use]
    pub fn failed(id: impl ToString, message: impl Into<String>) -> Self {
        Self::Failed {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Creates an invalid-attribute failure.
    #[must_use]
    pub fn invalid_attribute(
        id: impl ToString,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidAttribute {
            id: id.to_string(),
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = PlanError::CyclicDependency {
            cycle: vec!["a.x".into(), "b.y".into(), "a.x".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a.x -> b.y -> a.x");
    }

    #[test]
    fn test_structural_classification() {
        let structural = ConvergeError::from(StateError::storage("disk full"));
        assert!(structural.is_structural());

        let provider = ConvergeError::from(ProviderError::failed("null_resource.a", "boom"));
        assert!(!provider.is_structural());
    }
}
