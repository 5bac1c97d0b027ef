//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of definitions so a saved plan
//! can be tied to the configuration it was computed from, and of raw payloads
//! for state checksums.

use sha2::{Digest, Sha256};

use super::spec::{ConvergeConfig, ResourceDefinition};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire project configuration.
    ///
    /// Resource order in the file does not affect the result.
    #[must_use]
    pub fn hash_config(&self, config: &ConvergeConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by_key(|r| r.id());
        for resource in resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource definition.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceDefinition) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update(resource.name.as_bytes());
        hasher.update(resource.mode.to_string().as_bytes());

        // Attribute maps are BTreeMaps so serialization order is stable.
        for (key, value) in &resource.attributes {
            hasher.update(key.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }

        let mut deps: Vec<String> = resource.depends_on.iter().map(ToString::to_string).collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        for attribute in &resource.lifecycle.replace_on_change {
            hasher.update(attribute.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the SHA-256 hex digest of raw bytes.
    #[must_use]
    pub fn checksum(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{ExecutionConfig, LifecycleConfig, ProjectConfig, ResourceMode, StateConfig};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn create_test_resource(name: &str) -> ResourceDefinition {
        ResourceDefinition {
            resource_type: String::from("null_resource"),
            name: name.to_string(),
            mode: ResourceMode::Managed,
            attributes: BTreeMap::from([(String::from("size"), json!("Standard_M32ts"))]),
            depends_on: vec![],
            lifecycle: LifecycleConfig::default(),
        }
    }

    fn config_with(resources: Vec<ResourceDefinition>) -> ConvergeConfig {
        ConvergeConfig {
            project: ProjectConfig {
                name: String::from("hana"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            execution: ExecutionConfig::default(),
            resources,
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let resource = create_test_resource("vm");

        assert_eq!(hasher.hash_resource(&resource), hasher.hash_resource(&resource));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();

        let hash1 = hasher.hash_resource(&create_test_resource("vm-1"));
        let hash2 = hasher.hash_resource(&create_test_resource("vm-2"));

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_config_hash_ignores_declaration_order() {
        let hasher = ConfigHasher::new();
        let a = config_with(vec![create_test_resource("a"), create_test_resource("b")]);
        let b = config_with(vec![create_test_resource("b"), create_test_resource("a")]);

        assert_eq!(hasher.hash_config(&a), hasher.hash_config(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
