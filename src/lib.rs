// ============================================================================
// Linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![forbid(unsafe_code)]               // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative, dependency-ordered plan and apply engine for
//! infrastructure resources.
//!
//! ## Overview
//!
//! Converge compares declared resources with the last-applied state and
//! computes the minimal set of changes that makes reality match the
//! declaration:
//!
//! - Resources reference each other's attributes with `${type.name.attr}`
//! - References and `depends_on` form a dependency graph
//! - Changes are grouped into waves; a wave runs concurrently
//! - Every successful change is committed to locked, versioned state
//!
//! ## Architecture
//!
//! 1. **Graph**: definitions and their references
//! 2. **Differ**: definitions against stored state, per resource
//! 3. **Planner**: changes ordered into waves
//! 4. **Executor**: waves applied through providers, failures contained
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Reference expressions and the dependency graph
//! - [`state`]: State storage backends (local, memory) and locking
//! - [`planner`]: Diff computation, planning and execution
//! - [`provider`]: Resource providers and their registry
//! - [`reconciler`]: Lock, plan, apply, release; drift detection
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: hana
//!   environment: prod
//!
//! resources:
//!   - type: null_resource
//!     name: vm
//!     attributes:
//!       size: M32ts
//!   - type: local_file
//!     name: inventory
//!     attributes:
//!       filename: ./out/hosts.ini
//!       content: "[hana]\n${null_resource.vm.id}\n"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, ConvergeConfig};
pub use error::{ConvergeError, Result};
pub use graph::{DependencyGraph, GraphBuilder};
pub use planner::{ApplyReport, Differ, ExecutionPlan, PlanExecutor, Planner};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{DriftReport, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, StateDocument, StateStore};
