//! Stage specifications.

use crate::core::is_valid_identifier;
use crate::errors::RegistryError;
use crate::validation::ValidationRules;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role assigned to stages that do not name one.
pub const DEFAULT_ROLE: &str = "worker";

/// Specification for a single stage.
///
/// Immutable once the registry is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// The unique stage identifier.
    pub id: String,
    /// Stages this stage depends on, in declaration order.
    pub dependencies: Vec<String>,
    /// Expected output artifact names, in order.
    pub outputs: Vec<String>,
    /// The worker role that produces this stage.
    pub role: String,
    /// Opaque instructions handed to the generation port.
    #[serde(default)]
    pub instructions: String,
    /// Stage-specific validation rules; the gate default applies if unset.
    #[serde(default)]
    pub validation: Option<ValidationRules>,
}

impl StageSpec {
    /// Creates a new stage specification with the default role.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            outputs: Vec::new(),
            role: DEFAULT_ROLE.to_string(),
            instructions: String::new(),
            validation: None,
        }
    }

    /// Adds a dependency. Repeated dependencies are ignored.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    /// Adds several dependencies.
    #[must_use]
    pub fn with_dependencies(self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        deps.into_iter().fold(self, |spec, dep| spec.with_dependency(dep))
    }

    /// Adds an expected output artifact.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Adds several expected outputs.
    #[must_use]
    pub fn with_outputs(self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        names.into_iter().fold(self, |spec, name| spec.with_output(name))
    }

    /// Sets the owning role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the generation instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Overrides the validation rules for this stage.
    #[must_use]
    pub fn with_validation(mut self, rules: ValidationRules) -> Self {
        self.validation = Some(rules);
        self
    }

    /// Returns true if `stage` is a direct dependency.
    #[must_use]
    pub fn depends_on(&self, stage: &str) -> bool {
        self.dependencies.iter().any(|d| d == stage)
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers, a self-dependency (reported
    /// as a one-stage cycle), a repeated dependency, missing outputs, or
    /// repeated outputs.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !is_valid_identifier(&self.id) {
            return Err(RegistryError::InvalidIdentifier {
                kind: "stage",
                value: self.id.clone(),
            });
        }

        if self.depends_on(&self.id) {
            return Err(RegistryError::CyclicDependency {
                cycle: vec![self.id.clone(), self.id.clone()],
            });
        }

        let mut deps = HashSet::new();
        for dep in &self.dependencies {
            if !deps.insert(dep.as_str()) {
                return Err(RegistryError::DuplicateDependency {
                    stage: self.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if self.outputs.is_empty() {
            return Err(RegistryError::NoOutputs {
                stage: self.id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !is_valid_identifier(output) {
                return Err(RegistryError::InvalidIdentifier {
                    kind: "artifact",
                    value: output.clone(),
                });
            }
            if !seen.insert(output.as_str()) {
                return Err(RegistryError::DuplicateOutput {
                    stage: self.id.clone(),
                    artifact: output.clone(),
                });
            }
        }

        Ok(())
    }
}
