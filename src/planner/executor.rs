//! Plan executor for applying execution plans.
//!
//! Waves run strictly in sequence. Inside a wave, actions run concurrently
//! on a [`JoinSet`], bounded by a semaphore. Every successful action is
//! committed to the state store on its own before the wave completes, so a
//! later failure never loses earlier work. Failures are contained: dependents
//! of a failed action are skipped, independent branches keep going.
//!
//! While actions are in flight the executor refreshes the state lock on an
//! interval, so a long provider call does not let the lock expire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ResourceId, ResourceMode};
use crate::error::{ProviderError, Result, StateError};
use crate::graph::{evaluate, EvalError, Evaluated, GraphBuilder, Lookup, Reference};
use crate::provider::{Provider, ProviderRegistry};
use crate::state::{ResourceState, StateDocument, StateLock, StateStore, StateUpdate, LOCK_REFRESH_INTERVAL};

use super::diff::{ActionKind, ChangeAction};
use super::plan::{ActionKey, ExecutionPlan, PlannedAction};

/// Shared cancellation flag.
///
/// Once set, no new action is dispatched. Actions already running are
/// allowed to finish or time out.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Creates an unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Applied and committed.
    Succeeded,
    /// The provider or the commit failed.
    Failed {
        /// Error message.
        error: String,
    },
    /// Not attempted because something it depends on failed.
    Skipped {
        /// Resource whose failure caused the skip.
        caused_by: ResourceId,
    },
    /// Not attempted because the apply was cancelled.
    Cancelled,
}

/// Result of executing a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Action that was executed.
    pub key: ActionKey,
    /// Part of a replacement.
    pub replacement: bool,
    /// Wave the action belonged to.
    pub wave: usize,
    /// What happened.
    pub status: ActionStatus,
    /// Time spent in the provider, in milliseconds.
    pub duration_ms: u64,
}

/// Aggregate outcome of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Every action succeeded.
    Success,
    /// At least one action failed or was skipped.
    PartialFailure,
    /// The apply was cancelled before finishing.
    Cancelled,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Plan that was executed.
    pub plan_id: String,
    /// Individual action results, in completion order per wave.
    pub results: Vec<ActionResult>,
    /// Aggregate outcome.
    pub outcome: ApplyOutcome,
    /// State serial after the last commit.
    pub final_serial: u64,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
}

/// What a spawned task reports back. `result` is `None` when the task saw
/// cancellation before calling the provider.
struct TaskOutput {
    planned: PlannedAction,
    resolved: ChangeAction,
    result: Option<std::result::Result<Option<ResourceState>, ProviderError>>,
    duration: Duration,
}

/// Executor for execution plans.
#[derive(Debug)]
pub struct PlanExecutor<'a> {
    /// Providers by resource type.
    registry: &'a ProviderRegistry,
    /// Maximum concurrent provider calls.
    concurrency: usize,
    /// Per-action timeout.
    action_timeout: Option<Duration>,
    /// Cancellation flag.
    cancel: CancelSignal,
    /// How often the lock is refreshed while actions run.
    lock_refresh: Duration,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            concurrency: 4,
            action_timeout: None,
            cancel: CancelSignal::new(),
            lock_refresh: LOCK_REFRESH_INTERVAL,
        }
    }

    /// Sets the concurrency limit. Values below one are treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the per-action timeout.
    #[must_use]
    pub const fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Uses a shared cancellation signal.
    #[must_use]
    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets how often the lock is refreshed while actions run.
    #[must_use]
    pub fn with_lock_refresh(mut self, interval: Duration) -> Self {
        self.lock_refresh = interval.max(Duration::from_millis(1));
        self
    }

    /// Executes a plan against the store while holding `lock`.
    ///
    /// Provider failures are reported in the returned [`ApplyReport`] and
    /// never returned as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or has moved since
    /// the lock was taken. Nothing has been applied in that case.
    pub async fn execute<S>(
        &self,
        plan: &ExecutionPlan,
        store: &S,
        lock: &mut StateLock,
    ) -> Result<ApplyReport>
    where
        S: StateStore + ?Sized,
    {
        let started_at = Utc::now();
        let key = lock.key().to_string();
        info!(
            "Executing plan {} with {} action(s) in {} wave(s)",
            plan.id,
            plan.action_count(),
            plan.waves.len()
        );

        let mut snapshot = store.load(&key).await?;
        if snapshot.serial != lock.serial() {
            return Err(StateError::stale(
                &key,
                format!("expected serial {}, found {}", lock.serial(), snapshot.serial),
            )
            .into());
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut results: Vec<ActionResult> = Vec::new();
        // Failed, skipped or cancelled actions, mapped to the root cause.
        let mut blocked: BTreeMap<ActionKey, ResourceId> = BTreeMap::new();
        let mut halted = false;

        for wave in &plan.waves {
            debug!("Starting wave {} ({} action(s))", wave.index + 1, wave.actions.len());
            let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
            let mut in_flight: BTreeSet<ActionKey> = BTreeSet::new();

            for planned in &wave.actions {
                let action_key = ActionKey::of(&planned.action);

                if halted || self.cancel.is_cancelled() {
                    blocked.insert(action_key.clone(), planned.action.id.clone());
                    results.push(Self::result(planned, wave.index, ActionStatus::Cancelled, Duration::ZERO));
                    continue;
                }

                if let Some(cause) = planned.depends_on.iter().find_map(|d| blocked.get(d)) {
                    warn!("Skipping {action_key}: depends on failed {cause}");
                    let status = ActionStatus::Skipped { caused_by: cause.clone() };
                    blocked.insert(action_key, cause.clone());
                    results.push(Self::result(planned, wave.index, status, Duration::ZERO));
                    continue;
                }

                let prepared = Self::prepare(&planned.action, &snapshot).and_then(|action| {
                    let provider = self
                        .registry
                        .require(&action.id)
                        .map_err(|e| ProviderError::failed(&action.id, e.to_string()))?;
                    Ok((action, provider))
                });

                let (action, provider) = match prepared {
                    Ok(ready) => ready,
                    Err(e) => {
                        error!("{action_key} failed: {e}");
                        blocked.insert(action_key, planned.action.id.clone());
                        let status = ActionStatus::Failed { error: e.to_string() };
                        results.push(Self::result(planned, wave.index, status, Duration::ZERO));
                        continue;
                    }
                };

                in_flight.insert(action_key);
                tasks.spawn(run_action(
                    planned.clone(),
                    action,
                    provider,
                    Arc::clone(&semaphore),
                    self.cancel.clone(),
                    self.action_timeout,
                ));
            }

            let mut heartbeat = tokio::time::interval_at(
                tokio::time::Instant::now() + self.lock_refresh,
                self.lock_refresh,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let next = tokio::select! {
                    joined = tasks.join_next() => Some(joined),
                    _ = heartbeat.tick() => None,
                };

                let Some(next) = next else {
                    if !halted && let Err(e) = store.refresh_lock(lock).await {
                        error!("Could not refresh the state lock, stopping dispatch: {e}");
                        halted = true;
                    }
                    continue;
                };
                let Some(joined) = next else {
                    break;
                };

                let output = match joined {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Action task failed: {e}");
                        continue;
                    }
                };

                let action_key = ActionKey::of(&output.planned.action);
                in_flight.remove(&action_key);

                let status = match output.result {
                    None => ActionStatus::Cancelled,
                    Some(Err(e)) => {
                        error!("{action_key} failed: {e}");
                        ActionStatus::Failed { error: e.to_string() }
                    }
                    Some(Ok(new_state)) if halted => {
                        // Applied but the store is no longer writable.
                        warn!("{action_key} applied but not committed: {new_state:?}");
                        ActionStatus::Failed {
                            error: String::from("applied but not committed after an earlier commit failure"),
                        }
                    }
                    Some(Ok(new_state)) => match Self::commit(&output.planned.action, &output.resolved, new_state, store, lock, &mut snapshot).await {
                        Ok(()) => {
                            info!("{action_key} succeeded");
                            ActionStatus::Succeeded
                        }
                        Err(e) => {
                            error!("Commit of {action_key} failed, stopping dispatch: {e}");
                            halted = true;
                            ActionStatus::Failed { error: e.to_string() }
                        }
                    },
                };

                if status != ActionStatus::Succeeded {
                    blocked.insert(action_key, output.planned.action.id.clone());
                }
                results.push(Self::result(&output.planned, wave.index, status, output.duration));
            }

            // Tasks that panicked never reported back.
            for action_key in in_flight {
                let planned = wave
                    .actions
                    .iter()
                    .find(|p| ActionKey::of(&p.action) == action_key);
                if let Some(planned) = planned {
                    blocked.insert(action_key, planned.action.id.clone());
                    let status = ActionStatus::Failed { error: String::from("action task panicked") };
                    results.push(Self::result(planned, wave.index, status, Duration::ZERO));
                }
            }
        }

        let report = ApplyReport {
            plan_id: plan.id.clone(),
            outcome: ApplyReport::outcome_of(&results),
            results,
            final_serial: snapshot.serial,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            "Apply finished: {} succeeded, {} failed, {} skipped, {} cancelled",
            report.succeeded(),
            report.failed(),
            report.skipped(),
            report.cancelled()
        );
        Ok(report)
    }

    /// Resolves an action's expressions against committed state.
    fn prepare(
        action: &ChangeAction,
        snapshot: &StateDocument,
    ) -> std::result::Result<ChangeAction, ProviderError> {
        let Some(definition) = &action.after else {
            return Ok(action.clone());
        };
        if action.kind == ActionKind::Destroy {
            return Ok(action.clone());
        }

        let lookup = |reference: &Reference| {
            snapshot
                .get(&reference.target)
                .map_or(Lookup::Missing, |s| s.lookup(&reference.path))
        };

        let mut resolved = definition.clone();
        for (name, value) in &mut resolved.attributes {
            *value = match evaluate(value, &lookup) {
                Ok(Evaluated::Known(v)) => v,
                Ok(Evaluated::Unknown) => {
                    return Err(ProviderError::invalid_attribute(&action.id, name, "value is still unknown"));
                }
                Err(EvalError::Missing(reference)) => {
                    return Err(ProviderError::invalid_attribute(
                        &action.id,
                        name,
                        format!("{reference} is not available"),
                    ));
                }
                Err(EvalError::Malformed(text)) => {
                    return Err(ProviderError::invalid_attribute(&action.id, name, format!("malformed expression '{text}'")));
                }
            };
        }

        Ok(ChangeAction {
            after: Some(resolved),
            ..action.clone()
        })
    }

    /// Commits the outcome of one action and mirrors it in the snapshot.
    ///
    /// Stored attributes are the resolved configured values for managed
    /// resources and the observed values for data sources.
    async fn commit<S>(
        action: &ChangeAction,
        resolved: &ChangeAction,
        new_state: Option<ResourceState>,
        store: &S,
        lock: &mut StateLock,
        snapshot: &mut StateDocument,
    ) -> Result<()>
    where
        S: StateStore + ?Sized,
    {
        if action.kind == ActionKind::NoOp {
            return Ok(());
        }

        let update = match new_state {
            Some(mut state) => {
                state.id = action.id.clone();
                state.version = action.before.as_ref().map_or(1, |b| b.version + 1);
                state.updated_at = Utc::now();
                if action.kind == ActionKind::Read {
                    state.mode = ResourceMode::Data;
                } else if let Some(definition) = &resolved.after {
                    state.attributes.clone_from(&definition.attributes);
                }
                if let Some(definition) = &action.after {
                    state.dependencies = GraphBuilder::direct_dependencies(definition)?
                        .into_iter()
                        .collect();
                }
                StateUpdate::Put(state)
            }
            None => StateUpdate::Tombstone,
        };

        let key = lock.key().to_string();
        let updates = BTreeMap::from([(action.id.clone(), update)]);
        store.commit(&key, lock, updates.clone()).await?;
        snapshot.apply_updates(updates);
        Ok(())
    }

    fn result(planned: &PlannedAction, wave: usize, status: ActionStatus, duration: Duration) -> ActionResult {
        ActionResult {
            key: ActionKey::of(&planned.action),
            replacement: planned.action.replacement,
            wave,
            status,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Runs one provider call inside a spawned task.
async fn run_action(
    planned: PlannedAction,
    action: ChangeAction,
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
    cancel: CancelSignal,
    timeout: Option<Duration>,
) -> TaskOutput {
    let cancelled = TaskOutput {
        planned: planned.clone(),
        resolved: action.clone(),
        result: None,
        duration: Duration::ZERO,
    };

    let Ok(_permit) = semaphore.acquire_owned().await else {
        return cancelled;
    };

    // Cancellation may arrive while waiting for a permit.
    if cancel.is_cancelled() {
        return cancelled;
    }

    debug!("Dispatching {} {}", action.kind, action.id);
    let started = Instant::now();
    let call = call_provider(&action, provider.as_ref());
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(ProviderError::Timeout {
                id: action.id.to_string(),
                secs: limit.as_secs(),
            })
        }),
        None => call.await,
    };

    TaskOutput {
        planned,
        resolved: action,
        result: Some(result),
        duration: started.elapsed(),
    }
}

async fn call_provider(
    action: &ChangeAction,
    provider: &dyn Provider,
) -> std::result::Result<Option<ResourceState>, ProviderError> {
    match action.kind {
        ActionKind::Read => {
            let attributes = action
                .after
                .as_ref()
                .map(|d| d.attributes.clone())
                .unwrap_or_default();
            provider.read(&action.id, &attributes).await.map(Some)
        }
        // Forgetting a data source touches nothing outside the state.
        ActionKind::Destroy
            if action.before.as_ref().is_some_and(|b| b.mode == ResourceMode::Data) =>
        {
            Ok(None)
        }
        ActionKind::Destroy => provider.apply(action).await.map(|_| None),
        ActionKind::Create | ActionKind::Update => match provider.apply(action).await? {
            Some(state) => Ok(Some(state)),
            None => Err(ProviderError::failed(&action.id, "provider returned no state")),
        },
        ActionKind::NoOp => Ok(action.before.clone()),
    }
}

impl ApplyReport {
    fn outcome_of(results: &[ActionResult]) -> ApplyOutcome {
        let any = |pred: fn(&ActionStatus) -> bool| results.iter().any(|r| pred(&r.status));

        if any(|s| matches!(s, ActionStatus::Cancelled)) {
            ApplyOutcome::Cancelled
        } else if any(|s| matches!(s, ActionStatus::Failed { .. } | ActionStatus::Skipped { .. })) {
            ApplyOutcome::PartialFailure
        } else {
            ApplyOutcome::Success
        }
    }

    fn count(&self, pred: fn(&ActionStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }

    /// Number of succeeded actions.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Succeeded))
    }

    /// Number of failed actions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed { .. }))
    }

    /// Number of skipped actions.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Skipped { .. }))
    }

    /// Number of cancelled actions.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Cancelled))
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == ApplyOutcome::Success
    }

    /// Gets the results for a resource, in execution order.
    #[must_use]
    pub fn results_for(&self, id: &ResourceId) -> Vec<&ActionResult> {
        self.results.iter().filter(|r| &r.key.id == id).collect()
    }

    /// Gets the status of the last action for a resource.
    #[must_use]
    pub fn status_of(&self, id: &ResourceId) -> Option<&ActionStatus> {
        self.results_for(id).last().map(|r| &r.status)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped { caused_by } => write!(f, "skipped (caused by {caused_by})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
