//! Execution plan types and construction.
//!
//! A plan is a sequence of waves. Every action in a wave only depends on
//! actions in earlier waves, so the members of a wave can run concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use crate::config::ResourceId;
use crate::error::{ConvergeError, PlanError, Result, StateError};
use crate::graph::{layer, DependencyGraph};
use crate::state::StateDocument;

use super::diff::{ActionKind, ChangeAction, DiffResult};

/// Identifies one action inside a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    /// Resource identity.
    pub id: ResourceId,
    /// Kind of action.
    pub kind: ActionKind,
}

/// An action placed in a wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    /// The change to carry out.
    pub action: ChangeAction,
    /// Actions that must succeed before this one may start.
    #[serde(default)]
    pub depends_on: Vec<ActionKey>,
}

/// A batch of mutually independent actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    /// Position of the wave, starting at zero.
    pub index: usize,
    /// Actions, sorted by key.
    pub actions: Vec<PlannedAction>,
}

/// Counts of planned actions by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Resources created (replacements excluded).
    pub create: usize,
    /// Resources updated in place.
    pub update: usize,
    /// Resources replaced.
    pub replace: usize,
    /// Resources destroyed (replacements excluded).
    pub destroy: usize,
    /// Data sources read.
    pub read: usize,
}

/// An ordered, immutable execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique plan identifier.
    pub id: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// State key the plan applies to.
    pub state_key: String,
    /// Serial of the state the plan was computed against.
    pub base_serial: u64,
    /// Hash of the configuration the plan was computed from.
    pub config_hash: String,
    /// True for plans that tear everything down.
    #[serde(default)]
    pub destroy: bool,
    /// Waves in execution order.
    pub waves: Vec<Wave>,
}

/// Orders change actions into waves.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    /// State key recorded in produced plans.
    state_key: String,
    /// Configuration hash recorded in produced plans.
    config_hash: String,
}

impl Planner {
    /// Creates a planner for a state key.
    #[must_use]
    pub fn new(state_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
            config_hash: String::new(),
        }
    }

    /// Sets the configuration hash recorded in plans.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Builds the execution plan for a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] if the actions cannot be
    /// ordered. No partial plan is returned.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        diff: &DiffResult,
        state: &StateDocument,
    ) -> Result<ExecutionPlan> {
        self.build(graph, diff, state, false)
    }

    /// Builds a plan that destroys every stored resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] if recorded dependencies form
    /// a cycle.
    pub fn destroy_plan(&self, state: &StateDocument) -> Result<ExecutionPlan> {
        let diff = DiffResult {
            changes: state
                .resources
                .values()
                .map(|r| (r.id.clone(), ChangeAction::destroy(r)))
                .collect(),
        };
        self.build(&DependencyGraph::new(), &diff, state, true)
    }

    fn build(
        &self,
        graph: &DependencyGraph,
        diff: &DiffResult,
        state: &StateDocument,
        destroy: bool,
    ) -> Result<ExecutionPlan> {
        let actions: BTreeMap<ActionKey, ChangeAction> = diff
            .changes
            .values()
            .flat_map(ChangeAction::expand)
            .map(|a| (ActionKey::of(&a), a))
            .collect();

        let edges = Self::ordering_edges(graph, &actions, state);

        let layers = layer(&edges).map_err(|cycle| {
            ConvergeError::Plan(PlanError::CyclicDependency {
                cycle: cycle.iter().map(|k| k.id.to_string()).collect(),
            })
        })?;

        let mut actions = actions;
        let waves: Vec<Wave> = layers
            .into_iter()
            .enumerate()
            .map(|(index, keys)| Wave {
                index,
                actions: keys
                    .into_iter()
                    .filter_map(|key| {
                        let depends_on = edges.get(&key).map(|d| d.iter().cloned().collect()).unwrap_or_default();
                        actions
                            .remove(&key)
                            .map(|action| PlannedAction { action, depends_on })
                    })
                    .collect(),
            })
            .collect();

        let plan = ExecutionPlan {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state_key: self.state_key.clone(),
            base_serial: state.serial,
            config_hash: self.config_hash.clone(),
            destroy,
            waves,
        };

        info!(
            "Planned {} action(s) in {} wave(s)",
            plan.action_count(),
            plan.waves.len()
        );
        Ok(plan)
    }

    /// Computes "must run after" edges between actions.
    fn ordering_edges(
        graph: &DependencyGraph,
        actions: &BTreeMap<ActionKey, ChangeAction>,
        state: &StateDocument,
    ) -> BTreeMap<ActionKey, BTreeSet<ActionKey>> {
        let mut edges: BTreeMap<ActionKey, BTreeSet<ActionKey>> =
            actions.keys().map(|k| (k.clone(), BTreeSet::new())).collect();

        let stand_up: BTreeMap<&ResourceId, &ActionKey> = actions
            .iter()
            .filter(|(_, a)| a.is_stand_up())
            .map(|(k, _)| (&k.id, k))
            .collect();
        let destroys: BTreeMap<&ResourceId, &ActionKey> = actions
            .keys()
            .filter(|k| k.kind == ActionKind::Destroy)
            .map(|k| (&k.id, k))
            .collect();

        // Dependencies a stored resource was applied with, plus current ones.
        let previous = |id: &ResourceId| -> BTreeSet<ResourceId> {
            let mut deps: BTreeSet<ResourceId> = state
                .get(id)
                .map(|s| s.dependencies.iter().cloned().collect())
                .unwrap_or_default();
            if graph.contains(id) {
                deps.extend(graph.dependencies_of(id));
            }
            deps
        };

        for (id, key) in &stand_up {
            for upstream in Self::nearest_stand_ups(graph, id, &stand_up) {
                if let Some(upstream_key) = stand_up.get(&upstream) {
                    Self::add_edge(&mut edges, key, upstream_key);
                }
            }

            if let Some(destroy) = destroys.get(id) {
                Self::add_edge(&mut edges, key, destroy);
            }
        }

        for (id, key) in &destroys {
            for upstream in previous(*id) {
                if let Some(upstream_destroy) = destroys.get(&upstream) {
                    Self::add_edge(&mut edges, upstream_destroy, key);
                }
            }
        }

        // An update that drops a reference must run before the target goes away.
        for (id, key) in &stand_up {
            if key.kind != ActionKind::Update {
                continue;
            }
            for upstream in state.get(id).map(|s| s.dependencies.clone()).unwrap_or_default() {
                if let Some(upstream_destroy) = destroys.get(&upstream)
                    && !stand_up.contains_key(&upstream)
                {
                    Self::add_edge(&mut edges, upstream_destroy, key);
                }
            }
        }

        debug!(
            "Ordering {} action(s) with {} edge(s)",
            edges.len(),
            edges.values().map(BTreeSet::len).sum::<usize>()
        );
        edges
    }

    /// Finds the closest upstream resources that have a stand-up action,
    /// looking through resources that do not change.
    fn nearest_stand_ups(
        graph: &DependencyGraph,
        id: &ResourceId,
        stand_up: &BTreeMap<&ResourceId, &ActionKey>,
    ) -> BTreeSet<ResourceId> {
        let mut found = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = graph.dependencies_of(id);

        while let Some(next) = stack.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }
            if stand_up.contains_key(&next) {
                found.insert(next);
            } else {
                stack.extend(graph.dependencies_of(&next));
            }
        }
        found
    }

    fn add_edge(
        edges: &mut BTreeMap<ActionKey, BTreeSet<ActionKey>>,
        after: &ActionKey,
        before: &ActionKey,
    ) {
        if after != before {
            edges.entry(after.clone()).or_default().insert(before.clone());
        }
    }
}

impl ActionKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(id: ResourceId, kind: ActionKind) -> Self {
        Self { id, kind }
    }

    /// Returns the key of an action.
    #[must_use]
    pub fn of(action: &ChangeAction) -> Self {
        Self::new(action.id.clone(), action.kind)
    }
}

impl ExecutionPlan {
    /// Returns true if the plan has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waves.iter().all(|w| w.actions.is_empty())
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.waves.iter().map(|w| w.actions.len()).sum()
    }

    /// Iterates all actions in execution order.
    pub fn actions(&self) -> impl Iterator<Item = &PlannedAction> {
        self.waves.iter().flat_map(|w| w.actions.iter())
    }

    /// Returns true if the plan changes any managed resource.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions().any(|a| a.action.kind != ActionKind::Read)
    }

    /// Counts actions by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for planned in self.actions() {
            let action = &planned.action;
            match (action.kind, action.replacement) {
                (ActionKind::Create, true) => summary.replace += 1,
                (ActionKind::Create, false) => summary.create += 1,
                (ActionKind::Update, _) => summary.update += 1,
                (ActionKind::Destroy, false) => summary.destroy += 1,
                (ActionKind::Read, _) => summary.read += 1,
                (ActionKind::Destroy, true) | (ActionKind::NoOp, _) => {}
            }
        }
        summary
    }

    /// Checks that this plan can still be applied to the given state.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::KeyMismatch`] or [`PlanError::StalePlan`].
    pub fn check_current(&self, state_key: &str, serial: u64) -> Result<()> {
        if self.state_key != state_key {
            return Err(PlanError::KeyMismatch {
                planned: self.state_key.clone(),
                current: state_key.to_string(),
            }
            .into());
        }
        if self.base_serial != serial {
            return Err(PlanError::StalePlan {
                planned: self.base_serial,
                current: serial,
            }
            .into());
        }
        Ok(())
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize plan: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Reads a plan written by [`ExecutionPlan::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| {
            StateError::serialization(format!(
                "Failed to parse plan {}: {e}",
                path.as_ref().display()
            ))
            .into()
        })
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.kind.symbol(), self.action.id)?;
        if self.action.replacement {
            write!(f, " (replace)")?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} actions):", self.action_count())?;
        for wave in &self.waves {
            writeln!(f, "  wave {}:", wave.index + 1)?;
            for action in &wave.actions {
                writeln!(f, "    {action}")?;
            }
        }
        write!(f, "Plan: {}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDefinition;
    use crate::graph::GraphBuilder;
    use crate::planner::Differ;
    use crate::provider::ProviderRegistry;
    use crate::state::{ResourceState, StateUpdate};
    use serde_json::json;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("null_resource", name)
    }

    fn def(name: &str) -> ResourceDefinition {
        ResourceDefinition::new("null_resource", name).with_attribute("size", json!("s"))
    }

    fn plan_for(definitions: &[ResourceDefinition], state: &StateDocument) -> Result<ExecutionPlan> {
        let registry = ProviderRegistry::builtin();
        let graph = GraphBuilder::new().build(definitions)?;
        let diff = Differ::new(&registry).diff(&graph, definitions, state)?;
        Planner::new("test").plan(&graph, &diff, state)
    }

    fn wave_keys(plan: &ExecutionPlan) -> Vec<Vec<String>> {
        plan.waves
            .iter()
            .map(|w| w.actions.iter().map(|a| ActionKey::of(&a.action).to_string()).collect())
            .collect()
    }

    fn stored(name: &str, deps: &[&str], size: &str) -> ResourceState {
        let mut state = ResourceState::new(
            id(name),
            BTreeMap::from([(String::from("size"), json!(size))]),
            BTreeMap::new(),
        );
        state.dependencies = deps.iter().map(|d| id(d)).collect();
        state
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

    /// Every action appears after all actions it depends on.
    fn assert_topological(plan: &ExecutionPlan) {
        let mut seen: BTreeSet<ActionKey> = BTreeSet::new();
        for wave in &plan.waves {
            for action in &wave.actions {
                for dep in &action.depends_on {
                    assert!(seen.contains(dep), "{dep} must precede {}", ActionKey::of(&action.action));
                }
            }
            seen.extend(wave.actions.iter().map(|a| ActionKey::of(&a.action)));
        }
    }

    #[test]
    fn test_two_waves_for_chain() {
        let definitions = [def("net"), def("vm").with_dependency(id("net"))];
        let plan = plan_for(&definitions, &StateDocument::new()).unwrap();

        assert_eq!(
            wave_keys(&plan),
            vec![vec!["create null_resource.net"], vec!["create null_resource.vm"]]
        );
        assert_topological(&plan);
    }

    #[test]
    fn test_independent_resources_share_wave() {
        let definitions = [
            def("net"),
            def("disk"),
            def("vm").with_dependency(id("net")).with_dependency(id("disk")),
        ];
        let plan = plan_for(&definitions, &StateDocument::new()).unwrap();

        assert_eq!(plan.waves.len(), 2);
        assert_eq!(plan.waves[0].actions.len(), 2);
        assert_topological(&plan);
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let definitions = [def("net"), def("vm").with_dependency(id("net"))];
        let state = state_of(vec![stored("net", &[], "s"), stored("vm", &["net"], "s")]);

        let plan = plan_for(&definitions, &state).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.base_serial, state.serial);
    }

    #[test]
    fn test_replacement_is_two_sequential_waves() {
        let definitions = [
            def("net"),
            def("vm")
                .with_attribute("size", json!("m"))
                .with_dependency(id("net"))
                .replace_on_change("size"),
        ];
        let state = state_of(vec![stored("net", &[], "s"), stored("vm", &["net"], "s")]);

        let plan = plan_for(&definitions, &state).unwrap();
        assert_eq!(
            wave_keys(&plan),
            vec![vec!["destroy null_resource.vm"], vec!["create null_resource.vm"]]
        );
        assert_eq!(plan.summary().replace, 1);
    }

    #[test]
    fn test_teardown_reverses_standup() {
        let state = state_of(vec![
            stored("net", &[], "s"),
            stored("subnet", &["net"], "s"),
            stored("vm", &["subnet"], "s"),
        ]);

        let plan = plan_for(&[], &state).unwrap();
        assert_eq!(
            wave_keys(&plan),
            vec![
                vec!["destroy null_resource.vm"],
                vec!["destroy null_resource.subnet"],
                vec!["destroy null_resource.net"],
            ]
        );
        assert_topological(&plan);
    }

    #[test]
    fn test_destroy_plan_matches_reverse_order() {
        let state = state_of(vec![stored("net", &[], "s"), stored("vm", &["net"], "s")]);

        let plan = Planner::new("test").destroy_plan(&state).unwrap();
        assert!(plan.destroy);
        assert_eq!(
            wave_keys(&plan),
            vec![vec!["destroy null_resource.vm"], vec!["destroy null_resource.net"]]
        );
    }

    #[test]
    fn test_ordering_looks_through_unchanged_resources() {
        let definitions = [
            def("net").with_attribute("size", json!("m")),
            def("subnet").with_dependency(id("net")),
            def("vm").with_attribute("size", json!("m")).with_dependency(id("subnet")),
        ];
        let state = state_of(vec![
            stored("net", &[], "s"),
            stored("subnet", &["net"], "s"),
            stored("vm", &["subnet"], "s"),
        ]);

        let plan = plan_for(&definitions, &state).unwrap();
        assert_eq!(
            wave_keys(&plan),
            vec![vec!["update null_resource.net"], vec!["update null_resource.vm"]]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("b"));
        graph.add_dependency(id("b"), id("a"));

        let diff = DiffResult {
            changes: [def("a"), def("b")]
                .into_iter()
                .map(|d| {
                    (
                        d.id(),
                        ChangeAction {
                            kind: ActionKind::Create,
                            id: d.id(),
                            before: None,
                            after: Some(d),
                            changes: Vec::new(),
                            replacement: false,
                        },
                    )
                })
                .collect(),
        };

        let err = Planner::new("test")
            .plan(&graph, &diff, &StateDocument::new())
            .unwrap_err();
        match err {
            ConvergeError::Plan(PlanError::CyclicDependency { cycle }) => {
                assert!(cycle.contains(&String::from("null_resource.a")));
                assert!(cycle.contains(&String::from("null_resource.b")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_save_load_and_staleness() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plan.json");
        let plan = plan_for(&[def("net")], &StateDocument::new()).unwrap();

        plan.save(&path).unwrap();
        let loaded = ExecutionPlan::load(&path).unwrap();
        assert_eq!(loaded, plan);

        assert!(loaded.check_current("test", plan.base_serial).is_ok());
        assert!(matches!(
            loaded.check_current("test", plan.base_serial + 1),
            Err(ConvergeError::Plan(PlanError::StalePlan { .. }))
        ));
        assert!(matches!(
            loaded.check_current("other", plan.base_serial),
            Err(ConvergeError::Plan(PlanError::KeyMismatch { .. }))
        ));
    }
}
