//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - Declarative infrastructure planner and executor.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format on stderr (text, json).
    #[arg(long, global = true, default_value = "text", env = "CONVERGE_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the execution plan.
    Plan {
        /// Save the plan to a file for a later `apply`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply a fresh plan, or a saved one.
    Apply {
        /// Saved plan file.
        plan: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show a saved plan, or the current state if none is given.
    Show {
        /// Saved plan file.
        plan: Option<PathBuf>,
    },

    /// Destroy every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check for drift between stored state and real resources.
    Drift,

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Take the state lock and hold it until the lock expires.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Show or remove the state lock.
    Unlock {
        /// Remove the lock regardless of holder (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_with_saved_plan() {
        let cli = Cli::try_parse_from(["converge", "apply", "plan.json", "--yes"]).unwrap();
        match cli.command {
            Commands::Apply { plan, yes } => {
                assert_eq!(plan, Some(PathBuf::from("plan.json")));
                assert!(yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["converge", "plan", "--out", "p.json", "--output", "json", "-v"])
            .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Plan { out: Some(_), detailed: false }));
    }

    #[test]
    fn test_json_log_format() {
        let cli = Cli::try_parse_from(["converge", "drift", "--log-format", "json"]).unwrap();
        assert!(matches!(cli.log_format, OutputFormat::Json));
        assert!(matches!(cli.output, OutputFormat::Text));
    }

    #[test]
    fn test_state_unlock_force() {
        let cli = Cli::try_parse_from(["converge", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State { command: StateCommands::Unlock { force: true } }
        ));
    }
}
