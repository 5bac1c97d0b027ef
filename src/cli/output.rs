//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ConvergeConfig, ValidationResult};
use crate::planner::{
    ActionKind, ActionStatus, ApplyOutcome, ApplyReport, ExecutionPlan, PlannedValue,
};
use crate::reconciler::{DriftReport, DriftStatus};
use crate::state::{LockInfo, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Apply result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Time")]
    duration: String,
}

/// Stored resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = if plan.destroy { "Destroy Plan" } else { "Execution Plan" };
        let _ = writeln!(output, "\n{title}");
        let _ = writeln!(
            output,
            "   State: {} (serial {})",
            plan.state_key, plan.base_serial
        );
        if !plan.config_hash.is_empty() {
            let _ = writeln!(
                output,
                "   Config hash: {}",
                ConfigHasher::new().short_hash(&plan.config_hash)
            );
        }
        output.push('\n');

        let rows: Vec<PlanActionRow> = plan
            .waves
            .iter()
            .flat_map(|wave| {
                wave.actions.iter().map(move |planned| {
                    let action = &planned.action;
                    let changed = action
                        .changes
                        .iter()
                        .filter(|c| c.before.as_ref() != known(&c.after))
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    PlanActionRow {
                        wave: wave.index + 1,
                        action: Self::format_action(action.kind, action.replacement),
                        resource: action.id.to_string(),
                        after: Self::truncate(&changed, 40),
                    }
                })
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for planned in plan.actions() {
                let action = &planned.action;
                if action.changes.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n  {} {}", action.kind.symbol(), action.id);
                for change in &action.changes {
                    let before = change
                        .before
                        .as_ref()
                        .map_or_else(|| String::from("null"), ToString::to_string);
                    let marker = if change.forces_replacement {
                        " # forces replacement".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "      {}: {before} -> {}{marker}",
                        change.name, change.after
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to add, {} to change, {} to replace, {} to destroy, {} to read.",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red(),
            summary.read
        );

        output
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                if !report.results.is_empty() {
                    let rows: Vec<ResultRow> = report
                        .results
                        .iter()
                        .map(|r| ResultRow {
                            wave: r.wave + 1,
                            action: Self::format_action(r.key.kind, r.replacement),
                            resource: r.key.id.to_string(),
                            status: Self::format_status(&r.status),
                            duration: format!("{}ms", r.duration_ms),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let headline = match report.outcome {
                    ApplyOutcome::Success => format!("{} Apply complete", "✓".green()),
                    ApplyOutcome::PartialFailure => {
                        format!("{} Apply finished with failures", "✗".red())
                    }
                    ApplyOutcome::Cancelled => format!("{} Apply cancelled", "⚠".yellow()),
                };
                let _ = writeln!(
                    output,
                    "\n{headline}: {} succeeded, {} failed, {} skipped, {} cancelled (serial {})",
                    report.succeeded(),
                    report.failed(),
                    report.skipped(),
                    report.cancelled(),
                    report.final_serial
                );

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!("{} No drift detected.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in report.entries.iter().filter(|e| e.status != DriftStatus::InSync) {
                    match &entry.status {
                        DriftStatus::InSync => {}
                        DriftStatus::Missing => {
                            let _ = writeln!(output, "   - {} {}", entry.id, "missing".red());
                        }
                        DriftStatus::Error { message } => {
                            let _ = writeln!(output, "   - {} {message}", entry.id);
                        }
                        DriftStatus::Drifted { fields } => {
                            let _ = writeln!(output, "   ~ {}", entry.id);
                            for field in fields {
                                let _ = writeln!(
                                    output,
                                    "       {}: {} -> {}",
                                    field.name, field.stored, field.observed
                                );
                            }
                        }
                    }
                    if !entry.affected.is_empty() {
                        let affected: Vec<String> =
                            entry.affected.iter().map(ToString::to_string).collect();
                        let _ = writeln!(output, "       affects: {}", affected.join(", "));
                    }
                }
                let _ = writeln!(
                    output,
                    "\n{}/{} resources have drifted.",
                    report.drifted_count(),
                    report.entries.len()
                );
                output
            }
        }
    }

    /// Formats a state document.
    #[must_use]
    pub fn format_state(&self, key: &str, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {key}\n");
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            resource: r.id.to_string(),
                            mode: r.mode.to_string(),
                            version: r.version,
                            dependencies: r
                                .dependencies
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, info: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&info).unwrap_or_default(),
            OutputFormat::Text => info.map_or_else(
                || String::from("State is not locked."),
                |info| {
                    format!(
                        "Locked by {} since {} (lock {}, expires in {}s)",
                        info.holder,
                        info.acquired_at,
                        info.lock_id,
                        info.remaining_secs()
                    )
                },
            ),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &ConvergeConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resources.len(),
                "data_sources": config.data_source_count(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid.\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "  Project: {}", config.project.name);
                let _ = writeln!(output, "  Environment: {}", config.project.environment);
                let _ = writeln!(output, "  Resources: {}", config.resources.len());
                let _ = writeln!(output, "  Data sources: {}", config.data_source_count());
                output
            }
        }
    }

    /// Formats an action kind with color.
    fn format_action(kind: ActionKind, replacement: bool) -> String {
        let label = match kind {
            ActionKind::Create if replacement => "+replace".green(),
            ActionKind::Destroy if replacement => "-replace".red(),
            ActionKind::Create => "+create".green(),
            ActionKind::Update => "~update".yellow(),
            ActionKind::Destroy => "-destroy".red(),
            ActionKind::Read => "<=read".cyan(),
            ActionKind::NoOp => "noop".dimmed(),
        };
        label.to_string()
    }

    /// Formats an action status with color.
    fn format_status(status: &ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded => "ok".green().to_string(),
            ActionStatus::Failed { error } => {
                format!("{} {}", "failed".red(), Self::truncate(error, 60))
            }
            ActionStatus::Skipped { caused_by } => {
                format!("{} ({caused_by})", "skipped".yellow())
            }
            ActionStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// Known planned value, if any.
const fn known(value: &PlannedValue) -> Option<&serde_json::Value> {
    match value {
        PlannedValue::Known(v) => Some(v),
        PlannedValue::Unknown | PlannedValue::Removed => None,
    }
}
