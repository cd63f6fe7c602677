//! # Handoff
//!
//! Runs a dependency-ordered graph of generation stages and hands each
//! stage's markdown artifacts to the stages that depend on it.
//!
//! - **Stage registry**: stages, their dependencies and expected outputs,
//!   checked for cycles before any run starts
//! - **Artifact store**: write-once, checksummed documents keyed by run,
//!   stage and name, in memory or on disk
//! - **Validation gate**: a stage only completes when its outputs pass
//!   structural checks
//! - **Orchestrator**: bounded parallel dispatch, retries with backoff,
//!   per-call deadlines, failure containment and cancellation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use handoff::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = RegistryBuilder::new()
//!     .stage("metrics", &[], &["report"])
//!     .stage("insights", &[], &["report"])
//!     .synthesis(StageSpec::new("summary").with_output("report"))
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(
//!     registry,
//!     Arc::new(InMemoryArtifactStore::new()),
//!     Arc::new(TemplateGenerationPort::new()),
//! );
//! let report = orchestrator.run(RunRequest::new()).await?;
//! assert!(report.is_completed());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod generation;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod testing;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::core::{Artifact, GeneratedArtifact, RunId, RunOutcome, StageStatus};
    pub use crate::errors::{
        GenerationError, HandoffError, RegistryError, StoreError, ValidationError,
        ValidationIssue,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::generation::{
        CommandGenerationPort, GenerationPort, GenerationRequest, TemplateGenerationPort,
    };
    pub use crate::orchestrator::{
        Orchestrator, OrchestratorConfig, RetryConfig, RunReport, RunRequest,
    };
    pub use crate::registry::{RegistryBuilder, StageRegistry, StageSpec};
    pub use crate::store::{ArtifactStore, FileArtifactStore, InMemoryArtifactStore};
    pub use crate::validation::{ValidationGate, ValidationRules};
}
