//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of every managed resource and
//! the document that persists them. Unknown fields are kept in `extra` maps
//! so documents written by newer versions survive a round trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::{ResourceId, ResourceMode};
use crate::graph::{navigate, Lookup};

/// Current version of the state schema.
pub const STATE_VERSION: u32 = 1;

/// The persisted state of one key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    /// State schema version.
    pub version: u32,
    /// Global serial, bumped on every commit.
    pub serial: u64,
    /// Identifier fixed when the document is first created.
    pub lineage: String,
    /// Applied resources keyed by identity.
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceState>,
    /// When the document was last committed.
    pub last_updated: DateTime<Utc>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Last-applied state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Resource identity.
    pub id: ResourceId,
    /// Managed resource or data source.
    #[serde(default)]
    pub mode: ResourceMode,
    /// Concrete values of the configured attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Values computed by the provider (ids, addresses, ...).
    #[serde(default)]
    pub computed: BTreeMap<String, Value>,
    /// Identities this resource depended on when it was last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Per-resource version, bumped on every commit of this resource.
    #[serde(default)]
    pub version: u64,
    /// When this resource was last committed.
    pub updated_at: DateTime<Utc>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A change to one entry of a state document.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// Insert or replace the entry.
    Put(ResourceState),
    /// Remove the entry.
    Tombstone,
}

impl StateDocument {
    /// Creates a new empty document with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Applies updates in place and bumps the serial.
    pub fn apply_updates(&mut self, updates: BTreeMap<ResourceId, StateUpdate>) {
        for (id, update) in updates {
            match update {
                StateUpdate::Put(state) => {
                    self.resources.insert(id, state);
                }
                StateUpdate::Tombstone => {
                    self.resources.remove(&id);
                }
            }
        }
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Returns the managed resources.
    #[must_use]
    pub fn managed(&self) -> Vec<&ResourceState> {
        self.resources
            .values()
            .filter(|r| r.mode == ResourceMode::Managed)
            .collect()
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceState {
    /// Creates a state from applied attributes and provider outputs.
    #[must_use]
    pub fn new(
        id: ResourceId,
        attributes: BTreeMap<String, Value>,
        computed: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id,
            mode: ResourceMode::Managed,
            attributes,
            computed,
            dependencies: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Marks this state as belonging to a data source.
    #[must_use]
    pub fn data_source(mut self) -> Self {
        self.mode = ResourceMode::Data;
        self
    }

    /// Looks up an attribute path, configured values first, then computed.
    #[must_use]
    pub fn lookup(&self, path: &[String]) -> Lookup {
        let Some((head, rest)) = path.split_first() else {
            return Lookup::Missing;
        };

        self.attributes
            .get(head)
            .or_else(|| self.computed.get(head))
            .and_then(|value| navigate(value, rest))
            .map_or(Lookup::Missing, |value| Lookup::Known(value.clone()))
    }

    /// Returns a computed value as a string, if present.
    #[must_use]
    pub fn computed_str(&self, key: &str) -> Option<&str> {
        self.computed.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(name: &str) -> ResourceState {
        ResourceState::new(
            ResourceId::new("null_resource", name),
            BTreeMap::from([(String::from("size"), json!("M32ts"))]),
            BTreeMap::from([(String::from("id"), json!("abc"))]),
        )
    }

    #[test]
    fn test_apply_updates_bumps_serial() {
        let mut doc = StateDocument::new();
        let id = ResourceId::new("null_resource", "vm");

        doc.apply_updates(BTreeMap::from([(id.clone(), StateUpdate::Put(state("vm")))]));
        assert_eq!(doc.serial, 1);
        assert!(doc.get(&id).is_some());

        doc.apply_updates(BTreeMap::from([(id.clone(), StateUpdate::Tombstone)]));
        assert_eq!(doc.serial, 2);
        assert!(doc.get(&id).is_none());
    }

    #[test]
    fn test_lookup_prefers_attributes_then_computed() {
        let s = state("vm");
        assert_eq!(s.lookup(&[String::from("size")]), Lookup::Known(json!("M32ts")));
        assert_eq!(s.lookup(&[String::from("id")]), Lookup::Known(json!("abc")));
        assert_eq!(s.lookup(&[String::from("nope")]), Lookup::Missing);
        assert_eq!(s.computed_str("id"), Some("abc"));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = json!({
            "version": 1,
            "serial": 3,
            "lineage": "l-1",
            "last_updated": "2024-01-01T00:00:00Z",
            "future_field": {"a": 1},
            "resources": {
                "null_resource.vm": {
                    "id": "null_resource.vm",
                    "updated_at": "2024-01-01T00:00:00Z",
                    "annotation": "kept"
                }
            }
        });
        let doc: StateDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.extra.get("future_field"), Some(&json!({"a": 1})));

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["future_field"], json!({"a": 1}));
        assert_eq!(back["resources"]["null_resource.vm"]["annotation"], json!("kept"));
    }
}
