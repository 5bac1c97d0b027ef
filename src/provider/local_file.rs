//! The `local_file` provider.
//!
//! Manages a file on the local filesystem. As a data source it reads the
//! file's current content, which also makes drift visible.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::config::{ConfigHasher, ResourceId};
use crate::error::ProviderError;
use crate::planner::{ActionKind, ChangeAction};
use crate::state::ResourceState;

use super::{required_str, Provider};

const FILENAME: &str = "filename";
const CONTENT: &str = "content";

/// Provider for `local_file`.
#[derive(Debug, Default)]
pub struct LocalFileProvider;

impl LocalFileProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// State as observed on disk.
    fn observed(id: &ResourceId, filename: &str, content: &str) -> ResourceState {
        ResourceState::new(
            id.clone(),
            BTreeMap::from([
                (String::from(FILENAME), json!(filename)),
                (String::from(CONTENT), json!(content)),
            ]),
            BTreeMap::from([(
                String::from("id"),
                json!(ConfigHasher::checksum(content.as_bytes())),
            )]),
        )
    }

    async fn write(id: &ResourceId, attributes: &BTreeMap<String, Value>) -> Result<ResourceState, ProviderError> {
        let filename = required_str(id, attributes, FILENAME)?;
        let content = match attributes.get(CONTENT) {
            None => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ProviderError::invalid_attribute(id, CONTENT, "expected a string")),
        };

        if let Some(parent) = Path::new(filename).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::failed(id, format!("Failed to create {}: {e}", parent.display())))?;
        }

        debug!("Writing {} bytes to {filename}", content.len());
        fs::write(filename, content)
            .await
            .map_err(|e| ProviderError::failed(id, format!("Failed to write {filename}: {e}")))?;

        Ok(ResourceState::new(
            id.clone(),
            attributes.clone(),
            BTreeMap::from([(
                String::from("id"),
                json!(ConfigHasher::checksum(content.as_bytes())),
            )]),
        ))
    }

    async fn remove(id: &ResourceId, before: Option<&ResourceState>) -> Result<(), ProviderError> {
        let Some(filename) = before
            .and_then(|b| b.attributes.get(FILENAME))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };

        match fs::remove_file(filename).await {
            Ok(()) => {
                debug!("Removed {filename}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::failed(id, format!("Failed to remove {filename}: {e}"))),
        }
    }
}

#[async_trait]
impl Provider for LocalFileProvider {
    async fn apply(&self, action: &ChangeAction) -> Result<Option<ResourceState>, ProviderError> {
        match action.kind {
            ActionKind::Destroy => {
                Self::remove(&action.id, action.before.as_ref()).await?;
                Ok(None)
            }
            _ => {
                let attributes = action
                    .after
                    .as_ref()
                    .map(|d| d.attributes.clone())
                    .unwrap_or_default();
                Self::write(&action.id, &attributes).await.map(Some)
            }
        }
    }

    async fn read(
        &self,
        id: &ResourceId,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<ResourceState, ProviderError> {
        let filename = required_str(id, attributes, FILENAME)?;

        match fs::read_to_string(filename).await {
            Ok(content) => Ok(Self::observed(id, filename, &content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(ProviderError::failed(id, format!("Failed to read {filename}: {e}"))),
        }
    }

    fn update_in_place_safe(&self, attribute: &str) -> bool {
        attribute != FILENAME
    }

    // The id is a checksum of the content.
    fn keeps_computed_on_update(&self, _attribute: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDefinition;
    use tempfile::TempDir;

    fn create(path: &Path, content: &str) -> ChangeAction {
        let definition = ResourceDefinition::new("local_file", "inventory")
            .with_attribute(FILENAME, json!(path.to_string_lossy()))
            .with_attribute(CONTENT, json!(content));
        ChangeAction {
            kind: ActionKind::Create,
            id: definition.id(),
            before: None,
            after: Some(definition),
            changes: Vec::new(),
            replacement: false,
        }
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/hosts.ini");
        let provider = LocalFileProvider::new();

        let action = create(&path, "[hana]\n10.0.0.4\n");
        let state = provider.apply(&action).await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[hana]\n10.0.0.4\n");
        assert_eq!(
            state.computed_str("id"),
            Some(ConfigHasher::checksum(b"[hana]\n10.0.0.4\n").as_str())
        );

        std::fs::write(&path, "edited").unwrap();
        let observed = provider.read(&action.id, &state.attributes).await.unwrap();
        assert_eq!(observed.attributes[CONTENT], json!("edited"));

        let destroy = ChangeAction {
            kind: ActionKind::Destroy,
            before: Some(state.clone()),
            after: None,
            ..action
        };
        assert!(provider.apply(&destroy).await.unwrap().is_none());
        assert!(!path.exists());

        let err = provider.read(&destroy.id, &state.attributes).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_filename() {
        let provider = LocalFileProvider::new();
        let definition = ResourceDefinition::new("local_file", "x");
        let action = ChangeAction {
            kind: ActionKind::Create,
            id: definition.id(),
            before: None,
            after: Some(definition),
            changes: Vec::new(),
            replacement: false,
        };

        let err = provider.apply(&action).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_filename_forces_replacement() {
        let provider = LocalFileProvider::new();
        assert!(!provider.update_in_place_safe(FILENAME));
        assert!(provider.update_in_place_safe(CONTENT));
        assert!(!provider.keeps_computed_on_update("id"));
    }
}
