//! Resource providers.
//!
//! A provider knows how to create, update, destroy and read one resource
//! type. Providers are registered by type name in a [`ProviderRegistry`]
//! that is built once at process start.

mod exec;
mod local_file;
mod null;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::ResourceId;
use crate::error::{DefinitionError, ProviderError};
use crate::planner::ChangeAction;
use crate::state::ResourceState;

pub use exec::ExecProvider;
pub use local_file::LocalFileProvider;
pub use null::NullProvider;

/// Operations every resource type supports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies a Create, Update or Destroy action.
    ///
    /// The action's attributes are already fully resolved. Returns the new
    /// state, or `None` when the resource no longer exists.
    async fn apply(&self, action: &ChangeAction) -> Result<Option<ResourceState>, ProviderError>;

    /// Observes the current state of a resource.
    ///
    /// Returns [`ProviderError::NotFound`] if it does not exist.
    async fn read(
        &self,
        id: &ResourceId,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<ResourceState, ProviderError>;

    /// Whether a change to `attribute` can be applied without replacing
    /// the resource.
    fn update_in_place_safe(&self, _attribute: &str) -> bool {
        true
    }

    /// Whether the computed `attribute` keeps its value across an
    /// in-place update. Dependents can then resolve it at plan time.
    fn keeps_computed_on_update(&self, _attribute: &str) -> bool {
        true
    }
}

/// Maps resource type names to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in providers.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("null_resource", Arc::new(NullProvider::new()));
        registry.register("local_file", Arc::new(LocalFileProvider::new()));
        registry.register("exec", Arc::new(ExecProvider::new()));
        registry
    }

    /// Registers a provider, replacing any previous one for the type.
    pub fn register(&mut self, resource_type: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(resource_type.into(), provider);
    }

    /// Gets the provider for a type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(resource_type).cloned()
    }

    /// Gets the provider for a resource.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::UnknownResourceType`] if none is registered.
    pub fn require(&self, id: &ResourceId) -> Result<Arc<dyn Provider>, DefinitionError> {
        self.get(&id.resource_type)
            .ok_or_else(|| DefinitionError::UnknownResourceType {
                resource_type: id.resource_type.clone(),
                id: id.to_string(),
            })
    }

    /// Returns true if a provider is registered for the type.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Returns the registered type names, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Reads a required string attribute.
fn required_str<'a>(
    id: &ResourceId,
    attributes: &'a BTreeMap<String, Value>,
    name: &str,
) -> Result<&'a str, ProviderError> {
    attributes
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::invalid_attribute(id, name, "expected a string"))
}

/// Reads an optional list of strings.
fn string_list(
    id: &ResourceId,
    attributes: &BTreeMap<String, Value>,
    name: &str,
) -> Result<Option<Vec<String>>, ProviderError> {
    let Some(value) = attributes.get(name) else {
        return Ok(None);
    };

    let items = value
        .as_array()
        .ok_or_else(|| ProviderError::invalid_attribute(id, name, "expected a list of strings"))?;

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(ProviderError::invalid_attribute(id, name, "expected a list of strings")),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
