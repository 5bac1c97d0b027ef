//! Reconciler for converging declared resources and stored state.
//!
//! This module ties the pieces together: it takes the state lock, loads the
//! state, diffs, plans and executes, and releases the lock on every exit
//! path. It also offers read-only drift detection.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConvergeConfig, ResourceId};
use crate::error::{ProviderError, Result};
use crate::graph::GraphBuilder;
use crate::planner::{ApplyReport, CancelSignal, Differ, ExecutionPlan, PlanExecutor, Planner};
use crate::provider::ProviderRegistry;
use crate::state::{generate_holder_id, StateLock, StateStore};

/// Reconciler for one configuration and state key.
pub struct Reconciler<'a, S: StateStore + ?Sized> {
    /// Configuration.
    config: &'a ConvergeConfig,
    /// State store.
    state_store: &'a S,
    /// Providers by resource type.
    registry: &'a ProviderRegistry,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Cancellation flag passed to the executor.
    cancel: CancelSignal,
    /// Lock holder identity.
    holder: String,
}

/// Drift found for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Observed values match the stored ones.
    InSync,
    /// Some attributes changed outside of converge.
    Drifted {
        /// Changed attributes.
        fields: Vec<DriftField>,
    },
    /// The resource no longer exists.
    Missing,
    /// The provider could not read the resource.
    Error {
        /// Provider message.
        message: String,
    },
}

/// One drifted attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftField {
    /// Attribute name.
    pub name: String,
    /// Value recorded in state.
    pub stored: Value,
    /// Value observed now.
    pub observed: Value,
}

/// Drift for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    /// Resource identity.
    pub id: ResourceId,
    /// What was found.
    #[serde(flatten)]
    pub status: DriftStatus,
    /// Declared resources that depend on this one, directly or not.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub affected: Vec<ResourceId>,
}

/// Result of a drift check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// One entry per managed resource in state.
    pub entries: Vec<DriftEntry>,
}

impl<'a, S: StateStore + ?Sized> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(config: &'a ConvergeConfig, state_store: &'a S, registry: &'a ProviderRegistry) -> Self {
        Self {
            config,
            state_store,
            registry,
            hasher: ConfigHasher::new(),
            cancel: CancelSignal::new(),
            holder: generate_holder_id(),
        }
    }

    /// Uses a shared cancellation signal.
    #[must_use]
    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the state key.
    #[must_use]
    pub fn state_key(&self) -> String {
        self.config.state_key()
    }

    /// Computes a plan without changing anything.
    ///
    /// # Errors
    ///
    /// Returns a definition, state or plan error.
    pub async fn plan(&self) -> Result<ExecutionPlan> {
        let lock = self.lock().await?;
        let result = self.plan_locked(&lock).await;
        self.release(&lock).await;
        result
    }

    /// Computes a fresh plan and applies it.
    ///
    /// # Errors
    ///
    /// Returns a structural error before anything is applied. Provider
    /// failures are reported in the [`ApplyReport`].
    pub async fn apply(&self) -> Result<(ExecutionPlan, ApplyReport)> {
        let mut lock = self.lock().await?;
        let result = match self.plan_locked(&lock).await {
            Ok(plan) => self
                .execute(&plan, &mut lock)
                .await
                .map(|report| (plan, report)),
            Err(e) => Err(e),
        };
        self.release(&lock).await;
        result
    }

    /// Applies a previously saved plan.
    ///
    /// # Errors
    ///
    /// Returns a stale-plan error if the state changed since the plan was
    /// computed.
    pub async fn apply_plan(&self, plan: &ExecutionPlan) -> Result<ApplyReport> {
        let mut lock = self.lock().await?;
        let result = match plan.check_current(&self.state_key(), lock.serial()) {
            Ok(()) => self.execute(plan, &mut lock).await,
            Err(e) => Err(e),
        };
        self.release(&lock).await;
        result
    }

    /// Computes a plan that destroys every stored resource.
    ///
    /// # Errors
    ///
    /// Returns a state or plan error.
    pub async fn destroy_plan(&self) -> Result<ExecutionPlan> {
        let lock = self.lock().await?;
        let result = self.destroy_plan_locked().await;
        self.release(&lock).await;
        result
    }

    /// Destroys every stored resource.
    ///
    /// # Errors
    ///
    /// Returns a structural error before anything is destroyed.
    pub async fn destroy(&self) -> Result<(ExecutionPlan, ApplyReport)> {
        let mut lock = self.lock().await?;
        let result = match self.destroy_plan_locked().await {
            Ok(plan) => self
                .execute(&plan, &mut lock)
                .await
                .map(|report| (plan, report)),
            Err(e) => Err(e),
        };
        self.release(&lock).await;
        result
    }

    /// Reads every managed resource through its provider and compares it
    /// with the stored state. Does not take the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn detect_drift(&self) -> Result<DriftReport> {
        let state = self.state_store.load(&self.state_key()).await?;
        let graph = GraphBuilder::new().build(&self.config.resources)?;
        let mut report = DriftReport::default();

        for stored in state.managed() {
            let status = match self.registry.get(&stored.id.resource_type) {
                None => DriftStatus::Error {
                    message: format!("no provider for type '{}'", stored.id.resource_type),
                },
                Some(provider) => match provider.read(&stored.id, &stored.attributes).await {
                    Ok(observed) => {
                        let fields: Vec<DriftField> = stored
                            .attributes
                            .iter()
                            .filter_map(|(name, value)| {
                                observed
                                    .attributes
                                    .get(name)
                                    .filter(|now| *now != value)
                                    .map(|now| DriftField {
                                        name: name.clone(),
                                        stored: value.clone(),
                                        observed: now.clone(),
                                    })
                            })
                            .collect();
                        if fields.is_empty() {
                            DriftStatus::InSync
                        } else {
                            DriftStatus::Drifted { fields }
                        }
                    }
                    Err(ProviderError::NotFound { .. }) => DriftStatus::Missing,
                    Err(e) => DriftStatus::Error { message: e.to_string() },
                },
            };

            debug!("Drift check {}: {:?}", stored.id, status);
            let affected = if status == DriftStatus::InSync || !graph.contains(&stored.id) {
                Vec::new()
            } else {
                graph.transitive_dependents(&stored.id).into_iter().collect()
            };
            report.entries.push(DriftEntry {
                id: stored.id.clone(),
                status,
                affected,
            });
        }

        info!(
            "Drift check finished: {} of {} resource(s) out of sync",
            report.drifted_count(),
            report.entries.len()
        );
        Ok(report)
    }

    async fn lock(&self) -> Result<StateLock> {
        let timeout = Duration::from_secs(self.config.state.lock_timeout_secs);
        self.state_store
            .acquire_lock(&self.state_key(), &self.holder, timeout)
            .await
    }

    async fn release(&self, lock: &StateLock) {
        if let Err(e) = self.state_store.release(lock).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id());
        }
    }

    async fn plan_locked(&self, lock: &StateLock) -> Result<ExecutionPlan> {
        info!(
            "Planning {} ({} resource(s))",
            self.config.qualified_name(),
            self.config.resources.len()
        );

        let graph = GraphBuilder::new().build(&self.config.resources)?;
        let state = self.state_store.load(lock.key()).await?;
        let differ = Differ::new(self.registry);
        let observations = differ.observe(&graph, &self.config.resources, &state).await?;
        let diff = differ
            .with_observations(observations)
            .diff(&graph, &self.config.resources, &state)?;

        Planner::new(self.state_key())
            .with_config_hash(self.hasher.hash_config(self.config))
            .plan(&graph, &diff, &state)
    }

    async fn destroy_plan_locked(&self) -> Result<ExecutionPlan> {
        let state = self.state_store.load(&self.state_key()).await?;
        Planner::new(self.state_key())
            .with_config_hash(self.hasher.hash_config(self.config))
            .destroy_plan(&state)
    }

    async fn execute(&self, plan: &ExecutionPlan, lock: &mut StateLock) -> Result<ApplyReport> {
        let timeout = self.config.execution.action_timeout_secs.map(Duration::from_secs);

        PlanExecutor::new(self.registry)
            .with_concurrency(self.config.execution.concurrency)
            .with_action_timeout(timeout)
            .with_cancel_signal(self.cancel.clone())
            .execute(plan, self.state_store, lock)
            .await
    }
}

impl DriftReport {
    /// Returns true if any resource drifted, disappeared or failed to read.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.drifted_count() > 0
    }

    /// Number of resources not in sync.
    #[must_use]
    pub fn drifted_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status != DriftStatus::InSync)
            .count()
    }
}
