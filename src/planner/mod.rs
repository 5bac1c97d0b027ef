//! Planning module.
//!
//! This module computes per-resource changes, orders them into waves and
//! executes the resulting plan.

mod diff;
mod executor;
mod plan;

pub use diff::{ActionKind, AttributeChange, ChangeAction, DiffResult, Differ, Observation, PlannedValue};
pub use executor::{ActionResult, ActionStatus, ApplyOutcome, ApplyReport, CancelSignal, PlanExecutor};
pub use plan::{ActionKey, ExecutionPlan, PlanSummary, PlannedAction, Planner, Wave};
