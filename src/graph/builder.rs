//! Dependency graph construction.
//!
//! Edges point from a referencing resource to the resource it references,
//! i.e. "depends on". The referenced resource must exist first.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{ResourceDefinition, ResourceId};
use crate::error::{ConvergeError, DefinitionError, PlanError, Result};

use super::expr::references_in;

/// Directed dependency graph over resource identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Node -> the nodes it depends on.
    dependencies: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// Node -> the nodes that depend on it.
    dependents: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

/// Builds a [`DependencyGraph`] from resource definitions.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Resolves references between definitions into dependency edges.
    ///
    /// The order of `definitions` does not affect the result.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] for duplicate identities, malformed
    /// expressions or references to undefined resources.
    pub fn build(&self, definitions: &[ResourceDefinition]) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();

        for definition in definitions {
            let id = definition.id();
            if graph.contains(&id) {
                return Err(DefinitionError::DuplicateIdentity { id: id.to_string() }.into());
            }
            graph.add_node(id);
        }

        for definition in definitions {
            let from = definition.id();

            for (attribute, value) in &definition.attributes {
                for reference in Self::attribute_references(&from, attribute, value)? {
                    Self::link(&mut graph, &from, &reference.target, &reference.to_string())?;
                }
            }

            for target in &definition.depends_on {
                Self::link(&mut graph, &from, target, &target.to_string())?;
            }
        }

        debug!(
            "Built dependency graph with {} nodes and {} edges",
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Returns the identities a single definition depends on.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::MalformedExpression`] for a bad template.
    pub fn direct_dependencies(definition: &ResourceDefinition) -> Result<BTreeSet<ResourceId>> {
        let from = definition.id();
        let mut targets: BTreeSet<ResourceId> = definition.depends_on.iter().cloned().collect();

        for (attribute, value) in &definition.attributes {
            for reference in Self::attribute_references(&from, attribute, value)? {
                targets.insert(reference.target);
            }
        }
        Ok(targets)
    }

    fn attribute_references(
        from: &ResourceId,
        attribute: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<super::expr::Reference>> {
        references_in(value).map_err(|expression| {
            ConvergeError::Definition(DefinitionError::MalformedExpression {
                resource: from.to_string(),
                attribute: attribute.to_string(),
                expression,
            })
        })
    }

    fn link(
        graph: &mut DependencyGraph,
        from: &ResourceId,
        target: &ResourceId,
        reference: &str,
    ) -> Result<()> {
        if !graph.contains(target) {
            return Err(DefinitionError::UnresolvedReference {
                from: from.to_string(),
                target: reference.to_string(),
            }
            .into());
        }
        graph.add_dependency(from.clone(), target.clone());
        Ok(())
    }
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no edges. Existing nodes are left untouched.
    pub fn add_node(&mut self, id: ResourceId) {
        self.dependents.entry(id.clone()).or_default();
        self.dependencies.entry(id).or_default();
    }

    /// Records that `from` depends on `to`, adding both nodes if needed.
    pub fn add_dependency(&mut self, from: ResourceId, to: ResourceId) {
        self.add_node(from.clone());
        self.add_node(to.clone());
        self.dependents.entry(to.clone()).or_default().insert(from.clone());
        self.dependencies.entry(from).or_default().insert(to);
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.dependencies.contains_key(id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    /// Iterates over all nodes in identity order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceId> {
        self.dependencies.keys()
    }

    /// Returns the direct dependencies of a node.
    #[must_use]
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the direct dependents of a node.
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.dependents
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every node that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependents_of(id);

        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(&next));
            }
        }
        seen
    }

    /// Returns the nodes in an order where dependencies come first.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] naming the cycle.
    pub fn topological_order(&self) -> Result<Vec<ResourceId>> {
        let layers = layer(&self.dependencies).map_err(|cycle| {
            ConvergeError::Plan(PlanError::CyclicDependency {
                cycle: cycle.iter().map(ToString::to_string).collect(),
            })
        })?;
        Ok(layers.into_iter().flatten().collect())
    }
}

/// Kahn layering over a "node -> dependencies" map.
///
/// Each returned layer only contains nodes whose dependencies are all in
/// earlier layers. Dependencies that are not keys of the map are ignored.
/// On failure returns one cycle, with its first node repeated at the end.
pub fn layer<N>(dependencies: &BTreeMap<N, BTreeSet<N>>) -> std::result::Result<Vec<Vec<N>>, Vec<N>>
where
    N: Ord + Clone,
{
    let mut remaining: BTreeMap<&N, usize> = dependencies
        .iter()
        .map(|(node, deps)| {
            let in_graph = deps.iter().filter(|d| dependencies.contains_key(*d)).count();
            (node, in_graph)
        })
        .collect();

    let mut dependents: BTreeMap<&N, Vec<&N>> = BTreeMap::new();
    for (node, deps) in dependencies {
        for dep in deps.iter().filter(|d| dependencies.contains_key(*d)) {
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut layers = Vec::new();
    let mut ready: Vec<&N> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();

    while !ready.is_empty() {
        for node in &ready {
            remaining.remove(*node);
        }

        let mut next = BTreeSet::new();
        for node in &ready {
            for dependent in dependents.get(*node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(*dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }

        layers.push(ready.into_iter().cloned().collect());
        ready = next.into_iter().collect();
    }

    if remaining.is_empty() {
        Ok(layers)
    } else {
        Err(extract_cycle(dependencies, &remaining.keys().copied().collect()))
    }
}

/// Walks dependencies inside the unresolved set until a node repeats.
fn extract_cycle<N>(dependencies: &BTreeMap<N, BTreeSet<N>>, stuck: &BTreeSet<&N>) -> Vec<N>
where
    N: Ord + Clone,
{
    let mut path: Vec<&N> = Vec::new();
    let mut current = stuck.iter().next().copied();

    while let Some(node) = current {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<N> = path[pos..].iter().map(|n| (*n).clone()).collect();
            cycle.push(node.clone());
            return cycle;
        }
        path.push(node);
        // Every stuck node has at least one stuck dependency.
        current = dependencies
            .get(node)
            .and_then(|deps| deps.iter().find(|d| stuck.contains(d)));
    }

    path.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, ResourceMode};
    use serde_json::{json, Value};

    fn def(name: &str, attributes: &[(&str, Value)]) -> ResourceDefinition {
        ResourceDefinition {
            resource_type: String::from("null_resource"),
            name: name.to_string(),
            mode: ResourceMode::Managed,
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            depends_on: vec![],
            lifecycle: LifecycleConfig::default(),
        }
    }

    fn id(name: &str) -> ResourceId {
        ResourceId::new("null_resource", name)
    }

    #[test]
    fn test_reference_creates_edge() {
        let defs = vec![
            def("vm", &[("subnet", json!("${null_resource.net.id}"))]),
            def("net", &[]),
        ];
        let graph = GraphBuilder::new().build(&defs).unwrap();

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.dependencies_of(&id("vm")), vec![id("net")]);
        assert_eq!(graph.dependents_of(&id("net")), vec![id("vm")]);
        assert_eq!(graph.topological_order().unwrap(), vec![id("net"), id("vm")]);
    }

    #[test]
    fn test_depends_on_creates_edge() {
        let mut vm = def("vm", &[]);
        vm.depends_on.push(id("net"));
        let graph = GraphBuilder::new().build(&[vm, def("net", &[])]).unwrap();

        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_unresolved_reference() {
        let defs = vec![def("vm", &[("subnet", json!("${null_resource.missing.id}"))])];
        let err = GraphBuilder::new().build(&defs).unwrap_err();

        assert!(matches!(
            err,
            ConvergeError::Definition(DefinitionError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn test_duplicate_identity() {
        let defs = vec![def("vm", &[]), def("vm", &[])];
        let err = GraphBuilder::new().build(&defs).unwrap_err();

        assert!(matches!(
            err,
            ConvergeError::Definition(DefinitionError::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn test_malformed_expression() {
        let defs = vec![def("vm", &[("subnet", json!("${broken"))])];
        let err = GraphBuilder::new().build(&defs).unwrap_err();

        assert!(matches!(
            err,
            ConvergeError::Definition(DefinitionError::MalformedExpression { .. })
        ));
    }

    #[test]
    fn test_cycle_is_named() {
        let defs = vec![
            def("a", &[("x", json!("${null_resource.b.id}"))]),
            def("b", &[("x", json!("${null_resource.c.id}"))]),
            def("c", &[("x", json!("${null_resource.a.id}"))]),
            def("d", &[]),
        ];
        let graph = GraphBuilder::new().build(&defs).unwrap();
        let err = graph.topological_order().unwrap_err();

        let ConvergeError::Plan(PlanError::CyclicDependency { cycle }) = err else {
            panic!("expected cycle error");
        };
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&String::from("null_resource.d")));
    }

    #[test]
    fn test_transitive_dependents() {
        let defs = vec![
            def("net", &[]),
            def("subnet", &[("n", json!("${null_resource.net.id}"))]),
            def("vm", &[("s", json!("${null_resource.subnet.id}"))]),
            def("other", &[]),
        ];
        let graph = GraphBuilder::new().build(&defs).unwrap();

        let dependents = graph.transitive_dependents(&id("net"));
        assert_eq!(dependents, BTreeSet::from([id("subnet"), id("vm")]));
    }

    #[test]
    fn test_layers_group_independent_nodes() {
        let deps = BTreeMap::from([
            (1, BTreeSet::new()),
            (2, BTreeSet::new()),
            (3, BTreeSet::from([1, 2])),
            (4, BTreeSet::from([3, 99])),
        ]);
        let layers = layer(&deps).unwrap();

        assert_eq!(layers, vec![vec![1, 2], vec![3], vec![4]]);
    }
}
