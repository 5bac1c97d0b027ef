//! CLI module for the converge tool.
//!
//! This module provides the command-line interface for planning and
//! applying declared resources.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
