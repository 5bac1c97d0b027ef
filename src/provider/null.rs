//! The `null_resource` provider.
//!
//! Manages nothing outside the state. Useful for wiring values between
//! resources and for grouping dependencies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ResourceId;
use crate::error::ProviderError;
use crate::planner::{ActionKind, ChangeAction};
use crate::state::ResourceState;

use super::Provider;

/// Attribute whose change always replaces the resource.
const TRIGGERS: &str = "triggers";

/// Provider for `null_resource`.
#[derive(Debug, Default)]
pub struct NullProvider;

impl NullProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for NullProvider {
    async fn apply(&self, action: &ChangeAction) -> Result<Option<ResourceState>, ProviderError> {
        if action.kind == ActionKind::Destroy {
            return Ok(None);
        }

        let attributes = action
            .after
            .as_ref()
            .map(|d| d.attributes.clone())
            .unwrap_or_default();

        // Updates keep the identity handed out at creation.
        let id = action
            .before
            .as_ref()
            .filter(|_| action.kind == ActionKind::Update)
            .and_then(|b| b.computed.get("id").cloned())
            .unwrap_or_else(|| json!(Uuid::new_v4().to_string()));

        Ok(Some(ResourceState::new(
            action.id.clone(),
            attributes,
            BTreeMap::from([(String::from("id"), id)]),
        )))
    }

    async fn read(
        &self,
        id: &ResourceId,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<ResourceState, ProviderError> {
        Ok(ResourceState::new(id.clone(), attributes.clone(), BTreeMap::new()))
    }

    fn update_in_place_safe(&self, attribute: &str) -> bool {
        attribute != TRIGGERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDefinition;

    fn action(kind: ActionKind, before: Option<ResourceState>) -> ChangeAction {
        let definition = ResourceDefinition::new("null_resource", "vm").with_attribute("size", json!("M32ts"));
        ChangeAction {
            kind,
            id: definition.id(),
            before,
            after: Some(definition),
            changes: Vec::new(),
            replacement: false,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_update_keeps_it() {
        let provider = NullProvider::new();

        let created = provider.apply(&action(ActionKind::Create, None)).await.unwrap().unwrap();
        let id = created.computed_str("id").unwrap().to_string();
        assert_eq!(created.attributes["size"], json!("M32ts"));

        let updated = provider
            .apply(&action(ActionKind::Update, Some(created)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.computed_str("id"), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_destroy_returns_none() {
        let provider = NullProvider::new();
        assert!(provider.apply(&action(ActionKind::Destroy, None)).await.unwrap().is_none());
    }

    #[test]
    fn test_triggers_force_replacement() {
        let provider = NullProvider::new();
        assert!(!provider.update_in_place_safe("triggers"));
        assert!(provider.update_in_place_safe("size"));
    }
}
