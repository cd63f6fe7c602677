//! Stage registry: static stage definitions and dependency queries.
//!
//! This module provides:
//! - Stage specifications (dependencies, outputs, owning role)
//! - Registry construction with cycle and duplicate detection
//! - Topological and runnable-stage queries used by the orchestrator

mod builder;
mod graph;
mod spec;

pub use builder::RegistryBuilder;
pub use graph::StageRegistry;
pub use spec::{StageSpec, DEFAULT_ROLE};
