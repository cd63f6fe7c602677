//! The generation port trait and request type.

use crate::core::{Artifact, GeneratedArtifact, RunId};
use crate::errors::GenerationError;
use crate::registry::StageSpec;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Everything a port receives for one stage invocation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The run being executed.
    pub run_id: RunId,
    /// The stage to generate.
    pub stage_id: String,
    /// The role owning the stage.
    pub role: String,
    /// Stage instructions from configuration.
    pub instructions: String,
    /// Declared output names, in order.
    pub outputs: Vec<String>,
    /// Run-level inputs such as `dataset`.
    pub inputs: BTreeMap<String, String>,
    /// Artifacts of the direct dependencies, in dependency declaration order
    /// and insertion order within each dependency.
    pub context: Vec<Artifact>,
}

impl GenerationRequest {
    /// Creates a request for `spec` with no inputs or context.
    #[must_use]
    pub fn new(run_id: &RunId, spec: &StageSpec) -> Self {
        Self {
            run_id: run_id.clone(),
            stage_id: spec.id.clone(),
            role: spec.role.clone(),
            instructions: spec.instructions.clone(),
            outputs: spec.outputs.clone(),
            inputs: BTreeMap::new(),
            context: Vec::new(),
        }
    }

    /// Sets the run inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: BTreeMap<String, String>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the dependency artifacts.
    #[must_use]
    pub fn with_context(mut self, context: Vec<Artifact>) -> Self {
        self.context = context;
        self
    }

    /// The ordered concatenation of all dependency artifacts.
    ///
    /// Each document is preceded by a `<!-- source: <stage>_<name> -->` line.
    #[must_use]
    pub fn context_text(&self) -> String {
        self.context
            .iter()
            .map(|a| format!("<!-- source: {}_{} -->\n{}", a.stage_id, a.name, a.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Renders the full prompt handed to text-based backends.
    #[must_use]
    pub fn prompt(&self) -> String {
        let mut prompt = format!("# Stage: {}\n\nRole: {}\n", self.stage_id, self.role);
        if !self.instructions.is_empty() {
            let _ = write!(prompt, "\n{}\n", self.instructions.trim_end());
        }

        if !self.inputs.is_empty() {
            prompt.push_str("\n## Inputs\n\n");
            for (key, value) in &self.inputs {
                let _ = writeln!(prompt, "- {key}: {value}");
            }
        }

        prompt.push_str("\n## Required outputs\n\n");
        for name in &self.outputs {
            let _ = writeln!(prompt, "- {name}");
        }
        if self.outputs.len() > 1 {
            prompt.push_str("\nStart each output with a line `<!-- artifact: NAME -->`.\n");
        }

        if !self.context.is_empty() {
            prompt.push_str("\n## Context\n\n");
            prompt.push_str(&self.context_text());
            prompt.push('\n');
        }
        prompt
    }
}

/// Produces artifact content for a stage.
///
/// Implementations return one [`GeneratedArtifact`] per declared output.
/// Transient failures should be reported as [`GenerationError::Failed`] so
/// the orchestrator's retry budget applies.
#[async_trait]
pub trait GenerationPort: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str {
        "generation"
    }

    /// Generates the stage's documents.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<GeneratedArtifact>, GenerationError>;
}
