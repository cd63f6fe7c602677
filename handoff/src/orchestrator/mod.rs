//! Pipeline run orchestration.
//!
//! This module provides:
//! - The [`Orchestrator`] coordinating loop and its [`OrchestratorConfig`]
//! - Per-run state ([`PipelineRun`]) with monotone status transitions
//! - Bounded retry for generation calls
//! - The terminal [`RunReport`]

mod engine;
mod report;
mod retry;
mod run;

#[cfg(test)]
mod integration_tests;

pub use engine::{Orchestrator, OrchestratorConfig, RunRequest};
pub use report::{ArtifactRef, ErrorCategory, RunReport, StageFailure, StageReport};
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig, Retryable};
pub use run::PipelineRun;
