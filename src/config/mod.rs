//! Configuration module for the converge engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ConvergeConfig, ExecutionConfig, LifecycleConfig, ProjectConfig, ResourceDefinition,
    ResourceId, ResourceMode, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, find_config_file, DEFAULT_CONFIG_FILES};
pub use validator::{ConfigValidator, ValidationResult};
pub use hash::ConfigHasher;
