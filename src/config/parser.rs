//! Configuration parser for loading project files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::Path;
use tracing::{debug, info};

use super::spec::ConvergeConfig;

/// Configuration parser for loading project configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_state_path(&mut config);
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ConvergeConfig> {
        debug!("Parsing YAML configuration");

        let config: ConvergeConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has the wrong shape.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ConvergeConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut ConvergeConfig) -> Result<()> {
        if let Ok(name) = std::env::var("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("CONVERGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(path) = std::env::var("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(raw) = std::env::var("CONVERGE_CONCURRENCY") {
            debug!("Overriding execution.concurrency from environment");
            config.execution.concurrency = raw.parse().map_err(|_| {
                ConvergeError::Config(ConfigError::InvalidEnvVar {
                    name: String::from("CONVERGE_CONCURRENCY"),
                    value: raw.clone(),
                })
            })?;
        }

        Ok(())
    }

    /// Makes a relative local state path relative to the config directory.
    fn resolve_state_path(&self, config: &mut ConvergeConfig) {
        let Some(base) = &self.base_path else {
            return;
        };

        if let Some(path) = &config.state.path
            && Path::new(path).is_relative()
        {
            config.state.path = Some(base.join(path).display().to_string());
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceId, ResourceMode, StateBackend};
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: sap-hana
  environment: prod

state:
  backend: local
  path: .converge
  lock_timeout_secs: 5

execution:
  concurrency: 2
  action_timeout_secs: 600

resources:
  - type: null_resource
    name: vnet
    attributes:
      address_space: ["10.0.0.0/16"]
    lifecycle:
      replace_on_change: [address_space]
  - type: null_resource
    name: vm
    attributes:
      subnet: "${null_resource.vnet.id}"
      size: Standard_M32ts
    depends_on: [null_resource.vnet]
  - type: local_file
    name: inventory
    mode: data
    attributes:
      filename: inventory.ini
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.execution.concurrency, 2);
        assert_eq!(config.state.lock_timeout_secs, 5);
        assert!(config.resources[0].replaces_on_change("address_space"));
        assert_eq!(
            config.resources[1].depends_on,
            vec![ResourceId::new("null_resource", "vnet")]
        );
        assert_eq!(config.resources[2].mode, ResourceMode::Data);
        assert_eq!(config.data_source_count(), 1);
    }

    #[test]
    fn test_invalid_depends_on_rejected() {
        let yaml = r"
project:
  name: test
resources:
  - type: null_resource
    name: a
    depends_on: [not-an-identity]
";
        let parser = ConfigParser::new();
        assert!(parser.parse_yaml(yaml, None).is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(temp.path().join("converge.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, temp.path().join("converge.yaml"));
    }

    #[test]
    fn test_relative_state_path_resolved_against_base() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("converge.yaml");
        std::fs::write(&file, "project:\n  name: x\nstate:\n  path: state-dir\n").unwrap();

        let config = ConfigParser::new()
            .with_base_path(temp.path())
            .load_file(&file)
            .unwrap();

        assert_eq!(
            config.state.path.as_deref(),
            Some(temp.path().join("state-dir").display().to_string().as_str())
        );
    }
}
