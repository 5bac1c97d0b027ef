//! Diff engine for comparing declared definitions against stored state.
//!
//! This module computes one [`ChangeAction`] per resource identity. A
//! replacement is a single change carrying the `replacement` marker; it is
//! expanded into an ordered destroy/create pair by [`ChangeAction::expand`].
//!
//! Data sources whose inputs are already known are read before diffing
//! (see [`Differ::observe`]), so resources that reference them are planned
//! against what the data source returns now rather than the last stored read.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

use crate::config::{ResourceDefinition, ResourceId};
use crate::error::{ConvergeError, DefinitionError, Result};
use crate::graph::{evaluate, navigate, DependencyGraph, EvalError, Evaluated, Lookup, Reference};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceState, StateDocument};

/// Kind of change applied to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Resource is torn down.
    Destroy,
    /// Resource is created.
    Create,
    /// Resource is updated in place.
    Update,
    /// Data source is read.
    Read,
    /// Nothing to do.
    #[serde(rename = "noop")]
    NoOp,
}

/// The planned new value of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Known now.
    Known(Value),
    /// Only known after apply.
    Unknown,
    /// Attribute is removed from the definition.
    Removed,
}

/// Change to a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Last-applied value.
    pub before: Option<Value>,
    /// Planned value.
    pub after: PlannedValue,
    /// Whether this change alone forces a replacement.
    pub forces_replacement: bool,
}

/// A change to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAction {
    /// Kind of change.
    pub kind: ActionKind,
    /// Resource identity.
    pub id: ResourceId,
    /// Last-applied state, if any.
    pub before: Option<ResourceState>,
    /// Declared definition, if any.
    pub after: Option<ResourceDefinition>,
    /// Attribute-level details.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// Part of a destroy-then-create pair.
    #[serde(default)]
    pub replacement: bool,
}

/// Output of the differ.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// One change per identity.
    pub changes: BTreeMap<ResourceId, ChangeAction>,
}

/// A data source read taken while planning.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Resolved attributes the read was made with.
    pub inputs: BTreeMap<String, Value>,
    /// What the provider returned.
    pub state: ResourceState,
}

/// How a resolved identity can be referenced by later resources.
enum Resolved {
    /// Unchanged: read from state.
    Stable,
    /// Changing: declared attributes come from the plan, computed ones from
    /// `carried` when the provider keeps them, otherwise they are unknown.
    Planned {
        attributes: BTreeMap<String, Evaluated>,
        carried: BTreeMap<String, Value>,
    },
    /// Data source read while planning.
    Observed(ResourceState),
}

/// Engine for computing per-resource changes.
#[derive(Debug)]
pub struct Differ<'a> {
    /// Providers, consulted for update-in-place safety.
    registry: &'a ProviderRegistry,
    /// Data source reads taken while planning.
    observations: BTreeMap<ResourceId, Observation>,
}

impl<'a> Differ<'a> {
    /// Creates a new differ.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            observations: BTreeMap::new(),
        }
    }

    /// Uses data source reads taken by [`Differ::observe`].
    #[must_use]
    pub fn with_observations(mut self, observations: BTreeMap<ResourceId, Observation>) -> Self {
        self.observations = observations;
        self
    }

    /// Reads every data source whose inputs resolve from stored state and
    /// earlier reads.
    ///
    /// Data sources that depend on unknown values, or whose read fails, are
    /// left out and read during apply instead.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown types or a cyclic graph.
    pub async fn observe(
        &self,
        graph: &DependencyGraph,
        definitions: &[ResourceDefinition],
        state: &StateDocument,
    ) -> Result<BTreeMap<ResourceId, Observation>> {
        let data_sources: BTreeMap<ResourceId, &ResourceDefinition> = definitions
            .iter()
            .filter(|d| d.is_data_source())
            .map(|d| (d.id(), d))
            .collect();
        let mut observations: BTreeMap<ResourceId, Observation> = BTreeMap::new();

        for id in graph.topological_order()? {
            let Some(definition) = data_sources.get(&id) else {
                continue;
            };
            let provider = self.registry.require(&id)?;

            let lookup = |reference: &Reference| match observations.get(&reference.target) {
                Some(observed) => observed.state.lookup(&reference.path),
                None => state
                    .get(&reference.target)
                    .map_or(Lookup::Missing, |s| s.lookup(&reference.path)),
            };
            let inputs: Option<BTreeMap<String, Value>> = definition
                .attributes
                .iter()
                .map(|(name, value)| match evaluate(value, &lookup) {
                    Ok(Evaluated::Known(v)) => Some((name.clone(), v)),
                    _ => None,
                })
                .collect();

            let Some(inputs) = inputs else {
                debug!("{id}: inputs not known yet, reading during apply");
                continue;
            };

            match provider.read(&id, &inputs).await {
                Ok(observed) => {
                    debug!("{id}: read while planning");
                    observations.insert(id, Observation { inputs, state: observed });
                }
                Err(e) => warn!("{id}: read failed while planning, retrying during apply: {e}"),
            }
        }

        Ok(observations)
    }

    /// Computes the change for every defined or stored resource.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] for unknown types, malformed expressions
    /// or references to missing attributes, and a cyclic-dependency error
    /// if the graph is not acyclic.
    pub fn diff(
        &self,
        graph: &DependencyGraph,
        definitions: &[ResourceDefinition],
        state: &StateDocument,
    ) -> Result<DiffResult> {
        let by_id: BTreeMap<ResourceId, &ResourceDefinition> =
            definitions.iter().map(|d| (d.id(), d)).collect();

        for id in by_id.keys() {
            self.registry.require(id)?;
        }

        let mut resolved: BTreeMap<ResourceId, Resolved> = BTreeMap::new();
        let mut changes = BTreeMap::new();

        for id in graph.topological_order()? {
            let Some(definition) = by_id.get(&id) else {
                continue;
            };

            let attributes = Self::resolve(definition, &resolved, state)?;
            let observation = self.observation(&id, &attributes);
            let before = state.get(&id);
            let change = self.diff_resource(definition, before, &attributes, observation);

            debug!("{}: {}", id, change.kind);
            let entry = match (change.kind, observation) {
                (ActionKind::NoOp, _) => Resolved::Stable,
                (ActionKind::Read, Some(observed)) => Resolved::Observed(observed.state.clone()),
                (ActionKind::Update, _) => Resolved::Planned {
                    carried: self.carried_computed(&id, before),
                    attributes,
                },
                _ => Resolved::Planned {
                    attributes,
                    carried: BTreeMap::new(),
                },
            };
            resolved.insert(id.clone(), entry);
            changes.insert(id, change);
        }

        for (id, stored) in &state.resources {
            if !by_id.contains_key(id) {
                debug!("{id}: destroy (removed from configuration)");
                changes.insert(
                    id.clone(),
                    ChangeAction {
                        kind: ActionKind::Destroy,
                        id: id.clone(),
                        before: Some(stored.clone()),
                        after: None,
                        changes: Vec::new(),
                        replacement: false,
                    },
                );
            }
        }

        Ok(DiffResult { changes })
    }

    /// Returns the planning-time read of a data source, if it was made with
    /// the same inputs the diff resolved.
    fn observation(&self, id: &ResourceId, attributes: &BTreeMap<String, Evaluated>) -> Option<&Observation> {
        self.observations.get(id).filter(|observed| {
            observed.inputs.len() == attributes.len()
                && attributes.iter().all(|(name, evaluated)| {
                    matches!(evaluated, Evaluated::Known(v) if observed.inputs.get(name) == Some(v))
                })
        })
    }

    /// Computed values an in-place update leaves untouched.
    fn carried_computed(&self, id: &ResourceId, before: Option<&ResourceState>) -> BTreeMap<String, Value> {
        let (Some(provider), Some(before)) = (self.registry.get(&id.resource_type), before) else {
            return BTreeMap::new();
        };
        before
            .computed
            .iter()
            .filter(|(name, _)| provider.keeps_computed_on_update(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Evaluates every attribute of a definition.
    fn resolve(
        definition: &ResourceDefinition,
        resolved: &BTreeMap<ResourceId, Resolved>,
        state: &StateDocument,
    ) -> Result<BTreeMap<String, Evaluated>> {
        let from = definition.id();
        let lookup = |reference: &Reference| Self::lookup(reference, resolved, state);

        definition
            .attributes
            .iter()
            .map(|(name, value)| {
                evaluate(value, &lookup)
                    .map(|evaluated| (name.clone(), evaluated))
                    .map_err(|e| match e {
                        EvalError::Malformed(expression) => {
                            ConvergeError::Definition(DefinitionError::MalformedExpression {
                                resource: from.to_string(),
                                attribute: name.clone(),
                                expression,
                            })
                        }
                        EvalError::Missing(reference) => {
                            ConvergeError::Definition(DefinitionError::MissingAttribute {
                                from: from.to_string(),
                                target: reference.to_string(),
                            })
                        }
                    })
            })
            .collect()
    }

    fn lookup(
        reference: &Reference,
        resolved: &BTreeMap<ResourceId, Resolved>,
        state: &StateDocument,
    ) -> Lookup {
        let stored = state.get(&reference.target);

        match resolved.get(&reference.target) {
            Some(Resolved::Stable) => stored.map_or(Lookup::Missing, |s| s.lookup(&reference.path)),
            Some(Resolved::Observed(observed)) => observed.lookup(&reference.path),
            Some(Resolved::Planned { attributes, carried }) => {
                let declared = attributes.get(reference.attribute());
                match declared {
                    Some(Evaluated::Known(value)) => navigate(value, &reference.path[1..])
                        .map_or(Lookup::Missing, |v| Lookup::Known(v.clone())),
                    Some(Evaluated::Unknown) => Lookup::Unknown,
                    // Not declared: computed by the provider during apply.
                    None => carried.get(reference.attribute()).map_or(Lookup::Unknown, |value| {
                        navigate(value, &reference.path[1..])
                            .map_or(Lookup::Missing, |v| Lookup::Known(v.clone()))
                    }),
                }
            }
            None => Lookup::Missing,
        }
    }

    /// Applies the diff rules to one defined resource.
    fn diff_resource(
        &self,
        definition: &ResourceDefinition,
        before: Option<&ResourceState>,
        attributes: &BTreeMap<String, Evaluated>,
        observation: Option<&Observation>,
    ) -> ChangeAction {
        let id = definition.id();

        if definition.is_data_source() {
            // Shows what the read will change, when that is known already.
            let changes = match (before, observation) {
                (Some(before), Some(observed)) => {
                    let now: BTreeMap<String, Evaluated> = observed
                        .state
                        .attributes
                        .iter()
                        .map(|(name, value)| (name.clone(), Evaluated::Known(value.clone())))
                        .collect();
                    self.attribute_changes(definition, before, &now)
                        .into_iter()
                        .map(|change| AttributeChange {
                            forces_replacement: false,
                            ..change
                        })
                        .collect()
                }
                _ => Vec::new(),
            };
            return ChangeAction {
                kind: ActionKind::Read,
                id,
                before: before.cloned(),
                after: Some(definition.clone()),
                changes,
                replacement: false,
            };
        }

        let Some(before) = before else {
            let changes = attributes
                .iter()
                .map(|(name, evaluated)| AttributeChange {
                    name: name.clone(),
                    before: None,
                    after: PlannedValue::from(evaluated),
                    forces_replacement: false,
                })
                .collect();

            return ChangeAction {
                kind: ActionKind::Create,
                id,
                before: None,
                after: Some(definition.clone()),
                changes,
                replacement: false,
            };
        };

        let changes = self.attribute_changes(definition, before, attributes);
        let replacement = changes.iter().any(|c| c.forces_replacement);
        let kind = if changes.is_empty() {
            ActionKind::NoOp
        } else if replacement {
            ActionKind::Create
        } else {
            ActionKind::Update
        };

        ChangeAction {
            kind,
            id,
            before: Some(before.clone()),
            after: Some(definition.clone()),
            changes,
            replacement,
        }
    }

    /// Lists attributes whose planned value differs from the stored one.
    fn attribute_changes(
        &self,
        definition: &ResourceDefinition,
        before: &ResourceState,
        attributes: &BTreeMap<String, Evaluated>,
    ) -> Vec<AttributeChange> {
        let provider = self.registry.get(&definition.resource_type);
        let forces = |name: &str| {
            definition.replaces_on_change(name)
                || provider.as_ref().is_some_and(|p| !p.update_in_place_safe(name))
        };

        let names: BTreeSet<&String> = attributes.keys().chain(before.attributes.keys()).collect();
        let mut changes = Vec::new();

        for name in names {
            let old = before.attributes.get(name);
            let after = match attributes.get(name) {
                Some(Evaluated::Known(value)) if old == Some(value) => continue,
                Some(evaluated) => PlannedValue::from(evaluated),
                None => PlannedValue::Removed,
            };

            changes.push(AttributeChange {
                name: name.clone(),
                before: old.cloned(),
                after,
                forces_replacement: forces(name),
            });
        }
        changes
    }
}

impl From<&Evaluated> for PlannedValue {
    fn from(evaluated: &Evaluated) -> Self {
        match evaluated {
            Evaluated::Known(value) => Self::Known(value.clone()),
            Evaluated::Unknown => Self::Unknown,
        }
    }
}

impl ChangeAction {
    /// Creates a destroy action for a stored resource.
    #[must_use]
    pub fn destroy(state: &ResourceState) -> Self {
        Self {
            kind: ActionKind::Destroy,
            id: state.id.clone(),
            before: Some(state.clone()),
            after: None,
            changes: Vec::new(),
            replacement: false,
        }
    }

    /// Expands this change into the actions that carry it out.
    ///
    /// A replacement becomes a destroy followed by a create; a no-op
    /// becomes nothing.
    #[must_use]
    pub fn expand(&self) -> Vec<Self> {
        match self.kind {
            ActionKind::NoOp => Vec::new(),
            ActionKind::Create if self.replacement => {
                let destroy = Self {
                    kind: ActionKind::Destroy,
                    after: None,
                    ..self.clone()
                };
                vec![destroy, self.clone()]
            }
            _ => vec![self.clone()],
        }
    }

    /// Returns true if this action brings a resource up (create, update or read).
    #[must_use]
    pub const fn is_stand_up(&self) -> bool {
        matches!(
            self.kind,
            ActionKind::Create | ActionKind::Update | ActionKind::Read
        )
    }
}

impl DiffResult {
    /// Gets the change for an identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ChangeAction> {
        self.changes.get(id)
    }

    /// Returns the expanded actions for an identity, in execution order.
    #[must_use]
    pub fn actions_for(&self, id: &ResourceId) -> Vec<ActionKind> {
        self.changes
            .get(id)
            .map(|c| c.expand().into_iter().map(|a| a.kind).collect())
            .unwrap_or_default()
    }

    /// Returns true if any resource changes. Data-source reads do not count.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes
            .values()
            .any(|c| !matches!(c.kind, ActionKind::NoOp | ActionKind::Read))
    }

    /// Counts changes of a kind. Replacements count as creates.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.changes.values().filter(|c| c.kind == kind).count()
    }

    /// Number of replacements.
    #[must_use]
    pub fn replacements(&self) -> usize {
        self.changes.values().filter(|c| c.replacement).count()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Read => "read",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl ActionKind {
    /// Symbol used when rendering plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Destroy => "-",
            Self::Read => "<=",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => write!(f, "(known after apply)"),
            Self::Removed => write!(f, "null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::state::StateUpdate;
    use serde_json::json;

    fn net() -> ResourceDefinition {
        ResourceDefinition::new("null_resource", "net").with_attribute("cidr", json!("10.0.0.0/16"))
    }

    fn vm(size: &str) -> ResourceDefinition {
        ResourceDefinition::new("null_resource", "vm")
            .with_attribute("size", json!(size))
            .with_attribute("subnet", json!("${null_resource.net.cidr}"))
            .replace_on_change("size")
    }

    fn diff(definitions: &[ResourceDefinition], state: &StateDocument) -> Result<DiffResult> {
        let registry = ProviderRegistry::builtin();
        let graph = GraphBuilder::new().build(definitions)?;
        Differ::new(&registry).diff(&graph, definitions, state)
    }

    fn stored(id: &ResourceId, attributes: &[(&str, Value)]) -> ResourceState {
        ResourceState::new(
            id.clone(),
            attributes.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
            BTreeMap::from([(String::from("id"), json!(format!("{}-id", id.name)))]),
        )
    }

    fn state_of(resources: Vec<ResourceState>) -> StateDocument {
        let mut doc = StateDocument::new();
        doc.apply_updates(
            resources
                .into_iter()
                .map(|r| (r.id.clone(), StateUpdate::Put(r)))
                .collect(),
        );
        doc
    }

    fn applied() -> StateDocument {
        state_of(vec![
            stored(&net().id(), &[("cidr", json!("10.0.0.0/16"))]),
            stored(
                &vm("M32ts").id(),
                &[("size", json!("M32ts")), ("subnet", json!("10.0.0.0/16"))],
            ),
        ])
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let result = diff(&[net(), vm("M32ts")], &StateDocument::new()).unwrap();

        assert_eq!(result.count(ActionKind::Create), 2);
        let vm_change = result.get(&vm("M32ts").id()).unwrap();
        let subnet = vm_change.changes.iter().find(|c| c.name == "subnet").unwrap();
        // net is pending creation but declares cidr, so the value is known.
        assert_eq!(subnet.after, PlannedValue::Known(json!("10.0.0.0/16")));
    }

    #[test]
    fn test_unchanged_is_noop() {
        let result = diff(&[net(), vm("M32ts")], &applied()).unwrap();

        assert!(!result.has_changes());
        assert_eq!(result.count(ActionKind::NoOp), 2);
    }

    #[test]
    fn test_replace_on_change() {
        let result = diff(&[net(), vm("M64s")], &applied()).unwrap();

        assert_eq!(result.get(&net().id()).unwrap().kind, ActionKind::NoOp);
        assert_eq!(
            result.actions_for(&vm("M64s").id()),
            vec![ActionKind::Destroy, ActionKind::Create]
        );
        assert_eq!(result.replacements(), 1);
    }

    #[test]
    fn test_safe_change_is_update() {
        let definitions = [
            net().with_attribute("cidr", json!("10.1.0.0/16")),
            vm("M32ts"),
        ];
        let result = diff(&definitions, &applied()).unwrap();

        assert_eq!(result.get(&net().id()).unwrap().kind, ActionKind::Update);
        // subnet follows the new cidr but is not replace-on-change.
        assert_eq!(result.get(&vm("M32ts").id()).unwrap().kind, ActionKind::Update);
    }

    #[test]
    fn test_in_place_update_keeps_upstream_id() {
        let vm = ResourceDefinition::new("null_resource", "vm")
            .with_attribute("subnet", json!("${null_resource.net.id}"))
            .replace_on_change("subnet");
        let state = state_of(vec![
            stored(&net().id(), &[("cidr", json!("10.0.0.0/16")), ("tag", json!("a"))]),
            stored(&vm.id(), &[("subnet", json!("net-id"))]),
        ]);

        let definitions = [net().with_attribute("tag", json!("b")), vm.clone()];
        let result = diff(&definitions, &state).unwrap();

        assert_eq!(result.get(&net().id()).unwrap().kind, ActionKind::Update);
        assert_eq!(result.get(&vm.id()).unwrap().kind, ActionKind::NoOp);
        assert_eq!(result.replacements(), 0);
    }

    #[test]
    fn test_replaced_upstream_id_is_unknown() {
        let vm = ResourceDefinition::new("null_resource", "vm")
            .with_attribute("subnet", json!("${null_resource.net.id}"))
            .replace_on_change("subnet");
        let state = state_of(vec![
            stored(&net().id(), &[("cidr", json!("10.0.0.0/16")), ("triggers", json!("1"))]),
            stored(&vm.id(), &[("subnet", json!("net-id"))]),
        ]);

        let definitions = [net().with_attribute("triggers", json!("2")), vm.clone()];
        let result = diff(&definitions, &state).unwrap();

        assert!(result.get(&net().id()).unwrap().replacement);
        let vm_change = result.get(&vm.id()).unwrap();
        assert_eq!(vm_change.changes[0].after, PlannedValue::Unknown);
        assert_eq!(result.actions_for(&vm.id()), vec![ActionKind::Destroy, ActionKind::Create]);
    }

    #[test]
    fn test_checksum_id_not_carried_across_update() {
        let file = ResourceDefinition::new("local_file", "inventory")
            .with_attribute("filename", json!("/tmp/hosts"))
            .with_attribute("content", json!("new"));
        let reader = ResourceDefinition::new("null_resource", "reader")
            .with_attribute("checksum", json!("${local_file.inventory.id}"));
        let state = state_of(vec![
            stored(&file.id(), &[("filename", json!("/tmp/hosts")), ("content", json!("old"))]),
            stored(&reader.id(), &[("checksum", json!("inventory-id"))]),
        ]);

        let result = diff(&[file.clone(), reader.clone()], &state).unwrap();
        assert_eq!(result.get(&file.id()).unwrap().kind, ActionKind::Update);
        assert_eq!(result.get(&reader.id()).unwrap().changes[0].after, PlannedValue::Unknown);
    }

    #[test]
    fn test_removed_resource_is_destroyed() {
        let result = diff(&[net()], &applied()).unwrap();
        assert_eq!(result.get(&vm("M32ts").id()).unwrap().kind, ActionKind::Destroy);
    }

    #[test]
    fn test_provider_unsafe_attribute_forces_replacement() {
        let file = |name: &str| {
            ResourceDefinition::new("local_file", "cfg")
                .with_attribute("filename", json!(name))
                .with_attribute("content", json!("x"))
        };
        let state = state_of(vec![stored(
            &file("a").id(),
            &[("filename", json!("/tmp/a")), ("content", json!("x"))],
        )]);

        let result = diff(&[file("/tmp/b")], &state).unwrap();
        assert!(result.get(&file("a").id()).unwrap().replacement);
    }

    #[test]
    fn test_data_source_always_read() {
        let data = ResourceDefinition::new("local_file", "image")
            .with_attribute("filename", json!("/etc/hostname"))
            .as_data_source();
        let state = state_of(vec![stored(&data.id(), &[("filename", json!("/etc/hostname"))]).data_source()]);

        let result = diff(&[data.clone()], &state).unwrap();
        assert_eq!(result.get(&data.id()).unwrap().kind, ActionKind::Read);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_missing_attribute_reference() {
        let definitions = [
            net(),
            ResourceDefinition::new("null_resource", "vm").with_attribute("x", json!("${null_resource.net.nope}")),
        ];
        let err = diff(&definitions, &applied()).unwrap_err();
        assert!(matches!(err, ConvergeError::Definition(DefinitionError::MissingAttribute { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let definitions = [ResourceDefinition::new("azurerm_linux_virtual_machine", "vm")];
        let err = diff(&definitions, &StateDocument::new()).unwrap_err();
        assert!(matches!(err, ConvergeError::Definition(DefinitionError::UnknownResourceType { .. })));
    }

    fn source() -> ResourceDefinition {
        ResourceDefinition::new("local_file", "sid")
            .with_attribute("filename", json!("/srv/sid"))
            .as_data_source()
    }

    fn reader() -> ResourceDefinition {
        ResourceDefinition::new("null_resource", "reader").with_attribute("sid", json!("${local_file.sid.content}"))
    }

    fn read_state(filename: &str, content: &str) -> ResourceState {
        ResourceState::new(
            source().id(),
            BTreeMap::from([
                (String::from("filename"), json!(filename)),
                (String::from("content"), json!(content)),
            ]),
            BTreeMap::new(),
        )
    }

    fn read_before() -> StateDocument {
        state_of(vec![
            read_state("/srv/sid", "HN1").data_source(),
            stored(&reader().id(), &[("sid", json!("HN1"))]),
        ])
    }

    #[test]
    fn test_dependents_follow_fresh_read() {
        let observed = Observation {
            inputs: BTreeMap::from([(String::from("filename"), json!("/srv/sid"))]),
            state: read_state("/srv/sid", "HN2"),
        };
        let definitions = [source(), reader()];
        let registry = ProviderRegistry::builtin();
        let graph = GraphBuilder::new().build(&definitions).unwrap();

        let result = Differ::new(&registry)
            .with_observations(BTreeMap::from([(source().id(), observed)]))
            .diff(&graph, &definitions, &read_before())
            .unwrap();

        let read = result.get(&source().id()).unwrap();
        assert_eq!(read.kind, ActionKind::Read);
        assert_eq!(read.changes[0].after, PlannedValue::Known(json!("HN2")));
        assert!(!read.changes[0].forces_replacement);

        let dependent = result.get(&reader().id()).unwrap();
        assert_eq!(dependent.kind, ActionKind::Update);
        assert_eq!(dependent.changes[0].after, PlannedValue::Known(json!("HN2")));
    }

    #[test]
    fn test_unread_data_source_is_unknown() {
        // A read taken with other inputs does not count.
        let observed = Observation {
            inputs: BTreeMap::from([(String::from("filename"), json!("/srv/other"))]),
            state: read_state("/srv/other", "HN1"),
        };
        let definitions = [source(), reader()];
        let registry = ProviderRegistry::builtin();
        let graph = GraphBuilder::new().build(&definitions).unwrap();

        let result = Differ::new(&registry)
            .with_observations(BTreeMap::from([(source().id(), observed)]))
            .diff(&graph, &definitions, &read_before())
            .unwrap();

        let dependent = result.get(&reader().id()).unwrap();
        assert_eq!(dependent.changes[0].after, PlannedValue::Unknown);
    }

    #[tokio::test]
    async fn test_observe_reads_known_inputs_only() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("sid");
        std::fs::write(&path, "HN1").unwrap();

        let present = ResourceDefinition::new("local_file", "present")
            .with_attribute("filename", json!(path.to_string_lossy()))
            .as_data_source();
        // The path comes from a resource that does not exist yet.
        let pending = ResourceDefinition::new("local_file", "pending")
            .with_attribute("filename", json!("${null_resource.net.cidr}"))
            .as_data_source();
        let definitions = [net(), present.clone(), pending.clone()];
        let registry = ProviderRegistry::builtin();
        let graph = GraphBuilder::new().build(&definitions).unwrap();

        let observations = Differ::new(&registry)
            .observe(&graph, &definitions, &StateDocument::new())
            .await
            .unwrap();

        assert_eq!(observations.len(), 1);
        let observed = &observations[&present.id()];
        assert_eq!(observed.state.attributes["content"], json!("HN1"));
        assert!(!observations.contains_key(&pending.id()));
    }
}
