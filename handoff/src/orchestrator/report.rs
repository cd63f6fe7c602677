//! The terminal report of a pipeline run.

use crate::core::{Artifact, RunId, RunOutcome, StageStatus};
use crate::errors::{DeadlockError, ValidationIssue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The generation port failed after the retry budget, or permanently.
    Generation,
    /// Outputs were written but rejected by the validation gate.
    Validation,
    /// The run was cancelled while the stage was in flight.
    Cancelled,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Validation => write!(f, "validation"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed stage and its terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The failed stage.
    pub stage: String,
    /// Error category.
    pub category: ErrorCategory,
    /// Human-readable terminal error.
    pub message: String,
    /// Generation attempts used.
    pub attempts: u32,
    /// Validation issues, for validation failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
}

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// The stage id.
    pub stage: String,
    /// The owning role.
    pub role: String,
    /// Terminal (or still pending) status.
    pub status: StageStatus,
    /// Generation attempts used.
    pub attempts: u32,
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Producing stage.
    pub stage: String,
    /// Artifact name.
    pub name: String,
    /// Content checksum.
    pub checksum: String,
}

impl From<&Artifact> for ArtifactRef {
    fn from(artifact: &Artifact) -> Self {
        Self {
            stage: artifact.stage_id.clone(),
            name: artifact.name.clone(),
            checksum: artifact.checksum.clone(),
        }
    }
}

/// Everything known about a run once it reached a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run id.
    pub run_id: RunId,
    /// `Completed` iff every stage completed.
    pub outcome: RunOutcome,
    /// Every stage in topological order.
    pub stages: Vec<StageReport>,
    /// Failed stages with their error category.
    pub failures: Vec<StageFailure>,
    /// Pending stages that depend, transitively, on a failed stage.
    pub blocked: Vec<String>,
    /// Pending stages that never ran for another reason (cancellation).
    pub not_started: Vec<String>,
    /// Set only if the graph stopped making progress without a failure.
    pub deadlock: Option<DeadlockError>,
    /// Cancellation reason, if the run was cancelled.
    pub cancelled: Option<String>,
    /// Outputs of the synthesis stage, when it completed.
    pub final_artifacts: Vec<ArtifactRef>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal outcome.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    /// Returns true if every stage completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Status of a stage, if it exists.
    #[must_use]
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| s.status)
    }

    /// Attempts used by a stage (zero if it never ran).
    #[must_use]
    pub fn attempts_of(&self, stage: &str) -> u32 {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map_or(0, |s| s.attempts)
    }

    /// The failure record of a stage, if it failed.
    #[must_use]
    pub fn failure_of(&self, stage: &str) -> Option<&StageFailure> {
        self.failures.iter().find(|f| f.stage == stage)
    }

    /// Ids of failed stages.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.stage.as_str()).collect()
    }

    /// A short multi-line summary for terminals.
    #[must_use]
    pub fn summary(&self) -> String {
        let completed = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count();
        let mut out = format!(
            "Run {} {}: {}/{} stages completed in {}ms\n",
            self.run_id,
            self.outcome,
            completed,
            self.stages.len(),
            self.duration_ms
        );
        for failure in &self.failures {
            let _ = writeln!(
                out,
                "  failed {} [{}] after {} attempt(s): {}",
                failure.stage, failure.category, failure.attempts, failure.message
            );
        }
        if !self.blocked.is_empty() {
            let _ = writeln!(out, "  blocked: {}", self.blocked.join(", "));
        }
        if !self.not_started.is_empty() {
            let _ = writeln!(out, "  not started: {}", self.not_started.join(", "));
        }
        if let Some(reason) = &self.cancelled {
            let _ = writeln!(out, "  cancelled: {reason}");
        }
        if let Some(deadlock) = &self.deadlock {
            let _ = writeln!(out, "  {deadlock}");
        }
        for artifact in &self.final_artifacts {
            let _ = writeln!(
                out,
                "  final {}_{} sha256:{}",
                artifact.stage, artifact.name, artifact.checksum
            );
        }
        out
    }
}
