//! Resource graph module.
//!
//! This module turns declared definitions into a dependency graph by
//! resolving the references embedded in their attribute values. Resolution
//! runs once, before diffing; nothing evaluates expressions lazily.

mod builder;
mod expr;

pub use builder::{layer, DependencyGraph, GraphBuilder};
pub use expr::{evaluate, navigate, references_in, EvalError, Evaluated, Lookup, Reference};
