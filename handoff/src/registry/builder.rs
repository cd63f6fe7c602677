//! Registry builder with synthesis-stage expansion.

use super::{StageRegistry, StageSpec};
use crate::errors::RegistryError;

/// Builder for creating validated registries.
///
/// Validation happens in [`RegistryBuilder::build`], so stages may be added
/// in any order.
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    /// Stage specifications in declaration order.
    stages: Vec<StageSpec>,
    /// Stages marked as the terminal synthesis stage.
    synthesis: Vec<String>,
}

impl RegistryBuilder {
    /// Creates a new registry builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage from ids and output names.
    #[must_use]
    pub fn stage(self, id: &str, dependencies: &[&str], outputs: &[&str]) -> Self {
        self.add(
            StageSpec::new(id)
                .with_dependencies(dependencies.iter().copied())
                .with_outputs(outputs.iter().copied()),
        )
    }

    /// Adds a stage specification.
    #[must_use]
    pub fn add(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Adds the terminal synthesis stage.
    ///
    /// At build time its dependencies are expanded to every other stage, so it
    /// only becomes runnable once the whole graph has completed.
    #[must_use]
    pub fn synthesis(mut self, spec: StageSpec) -> Self {
        self.synthesis.push(spec.id.clone());
        self.stages.push(spec);
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidSynthesis`] if more than one synthesis
    /// stage was added, and any error from [`StageRegistry::new`].
    pub fn build(self) -> Result<StageRegistry, RegistryError> {
        if self.synthesis.len() > 1 {
            return Err(RegistryError::InvalidSynthesis {
                stages: self.synthesis,
            });
        }

        let all_ids: Vec<String> = self.stages.iter().map(|s| s.id.clone()).collect();
        let stages = self
            .stages
            .into_iter()
            .map(|spec| {
                if self.synthesis.contains(&spec.id) {
                    let others: Vec<String> = all_ids
                        .iter()
                        .filter(|id| **id != spec.id)
                        .cloned()
                        .collect();
                    spec.with_dependencies(others)
                } else {
                    spec
                }
            })
            .collect();

        StageRegistry::new(stages)
    }
}
