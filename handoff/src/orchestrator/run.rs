//! Per-run state owned by the coordinator.

use crate::core::{RunId, RunOutcome, StageStatus};
use crate::errors::HandoffError;
use crate::registry::StageRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// The mutable state of one pipeline run.
///
/// Only the coordinating loop holds this, so every status change is
/// serialized through [`PipelineRun::transition`].
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: RunId,
    created_at: DateTime<Utc>,
    statuses: HashMap<String, StageStatus>,
    attempts: HashMap<String, u32>,
    outcome: RunOutcome,
}

impl PipelineRun {
    /// Creates a run with every stage `Pending`.
    #[must_use]
    pub fn new(run_id: RunId, registry: &StageRegistry) -> Self {
        Self {
            run_id,
            created_at: Utc::now(),
            statuses: registry
                .topological_order()
                .iter()
                .map(|id| (id.clone(), StageStatus::Pending))
                .collect(),
            attempts: HashMap::new(),
            outcome: RunOutcome::Running,
        }
    }

    /// The run id, which is also the artifact namespace.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// When the run was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status of every stage.
    #[must_use]
    pub fn statuses(&self) -> &HashMap<String, StageStatus> {
        &self.statuses
    }

    /// Status of one stage; unknown stages read as `Pending`.
    #[must_use]
    pub fn status(&self, stage: &str) -> StageStatus {
        self.statuses.get(stage).copied().unwrap_or_default()
    }

    /// Generation attempts recorded for a stage.
    #[must_use]
    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    /// Records the number of generation attempts a stage used.
    pub fn record_attempts(&mut self, stage: &str, attempts: u32) {
        self.attempts.insert(stage.to_string(), attempts);
    }

    /// The overall outcome.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        self.outcome
    }

    /// Sets the terminal outcome.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
    }

    /// Number of stages currently in `status`.
    #[must_use]
    pub fn count(&self, status: StageStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Returns true if every stage is `Completed`.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.statuses.values().all(|s| *s == StageStatus::Completed)
    }

    /// Moves a stage to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Internal`] if the stage is unknown or the
    /// transition would break `Pending → Running → {Completed, Failed}`.
    pub fn transition(&mut self, stage: &str, next: StageStatus) -> Result<(), HandoffError> {
        let current = self
            .statuses
            .get_mut(stage)
            .ok_or_else(|| HandoffError::Internal(format!("unknown stage '{stage}'")))?;
        if !current.can_transition_to(next) {
            return Err(HandoffError::Internal(format!(
                "illegal transition for stage '{stage}': {current} -> {next}"
            )));
        }
        *current = next;
        Ok(())
    }
}
