//! Configuration validation for project files.
//!
//! This module validates configuration values before any graph is built,
//! so that obviously broken projects fail without touching state.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ConvergeConfig, ExecutionConfig, ProjectConfig, ResourceDefinition, StateConfig};

/// Validator for project configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Resource types with a registered provider. Empty disables the check.
    known_types: HashSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator that accepts any resource type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts resource types to the given set.
    #[must_use]
    pub fn with_known_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Validates a project configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &ConvergeConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        self.validate_resources(&config.resources, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be alphanumeric with hyphens or underscores.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if let Some(key) = &state.key
            && !is_valid_name(key)
        {
            result.errors.push(ValidationError {
                field: String::from("state.key"),
                message: format!("State key '{key}' is invalid"),
            });
        }

        if state.lock_timeout_secs == 0 {
            result
                .warnings
                .push(String::from("state.lock_timeout_secs: 0 fails immediately on contention"));
        }
    }

    /// Validates executor settings.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if execution.action_timeout_secs == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("execution.action_timeout_secs"),
                message: String::from("Action timeout must be at least 1 second"),
            });
        }
    }

    /// Validates all resource definitions.
    fn validate_resources(&self, resources: &[ResourceDefinition], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.id()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource identity: {}", resource.id()),
                });
            }

            if !is_valid_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be alphanumeric with hyphens or underscores.",
                        resource.name
                    ),
                });
            }

            if !is_valid_name(&resource.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!("Resource type '{}' is invalid", resource.resource_type),
                });
            } else if !self.known_types.is_empty()
                && !self.known_types.contains(&resource.resource_type)
            {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "No provider registered for resource type '{}'",
                        resource.resource_type
                    ),
                });
            }

            if resource.is_data_source() && !resource.lifecycle.replace_on_change.is_empty() {
                result.warnings.push(format!(
                    "{prefix}.lifecycle: replace_on_change has no effect on data source {}",
                    resource.id()
                ));
            }

            for attribute in &resource.lifecycle.replace_on_change {
                if !resource.attributes.contains_key(attribute) {
                    result.warnings.push(format!(
                        "{prefix}.lifecycle.replace_on_change: '{attribute}' is not a declared attribute"
                    ));
                }
            }

            if resource.depends_on.contains(&resource.id()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on"),
                    message: format!("{} cannot depend on itself", resource.id()),
                });
            }
        }
    }
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks that a name is alphanumeric with hyphens or underscores.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> ConvergeConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let config = parse(
            r"
project:
  name: sap-hana
resources:
  - type: null_resource
    name: vnet
",
        );
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let config = parse(
            r"
project:
  name: sap-hana
resources:
  - type: null_resource
    name: vnet
  - type: null_resource
    name: vnet
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_unknown_type_rejected_when_types_known() {
        let config = parse(
            r"
project:
  name: sap-hana
resources:
  - type: azurerm_linux_virtual_machine
    name: hana
",
        );
        let validator = ConfigValidator::new().with_known_types(["null_resource"]);
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = parse(
            r"
project:
  name: sap-hana
execution:
  concurrency: 0
",
        );
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_empty_resources_warns() {
        let config = parse("project:\n  name: sap-hana\n");
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("hana_vm-01"));
        assert!(!is_valid_name("-leading"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(""));
    }
}
