//! Error types for the handoff engine.
//!
//! Errors are split by the component that raises them. Stage-local errors
//! ([`GenerationError`], [`ValidationError`]) are contained to a stage and its
//! dependents; everything folded into [`HandoffError`] aborts a run (or
//! prevents it from starting).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for handoff operations.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The stage registry could not be constructed.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// An artifact store integrity or I/O error.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The pipeline configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// No stage could make progress.
    #[error("{0}")]
    Deadlock(#[from] DeadlockError),

    /// A worker task panicked or was torn down unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while constructing a stage registry.
///
/// All of these are fatal before any run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// The stages forming the cycle, first stage repeated at the end.
        cycle: Vec<String>,
    },

    /// Two stages share an identifier.
    #[error("Duplicate stage '{stage}'")]
    DuplicateStage {
        /// The duplicated identifier.
        stage: String,
    },

    /// A stage depends on a stage that is not declared.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The dependent stage.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A stage lists the same dependency twice.
    #[error("Stage '{stage}' depends on '{dependency}' more than once")]
    DuplicateDependency {
        /// The stage.
        stage: String,
        /// The repeated dependency.
        dependency: String,
    },

    /// A stage id or artifact name contains characters outside `[A-Za-z0-9_-]`.
    #[error("Invalid {kind} identifier '{value}'")]
    InvalidIdentifier {
        /// What was being named ("stage", "artifact").
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// A stage declares no output artifacts.
    #[error("Stage '{stage}' declares no output artifacts")]
    NoOutputs {
        /// The stage.
        stage: String,
    },

    /// A stage lists the same output name twice.
    #[error("Stage '{stage}' declares output '{artifact}' more than once")]
    DuplicateOutput {
        /// The stage.
        stage: String,
        /// The repeated artifact name.
        artifact: String,
    },

    /// Two (stage, artifact) pairs flatten to the same on-disk name.
    #[error("Artifacts {first} and {second} both map to '{file_stem}'")]
    ArtifactPathCollision {
        /// The flattened `<stage>_<artifact>` name.
        file_stem: String,
        /// First `stage/artifact` pair.
        first: String,
        /// Second `stage/artifact` pair.
        second: String,
    },

    /// More than one stage is marked as the terminal synthesis stage.
    #[error("Only one synthesis stage is allowed, found: {}", .stages.join(", "))]
    InvalidSynthesis {
        /// The stages marked as synthesis.
        stages: Vec<String>,
    },

    /// The registry has no stages.
    #[error("Registry has no stages")]
    Empty,
}

impl RegistryError {
    /// Stable error code for diagnostics.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CyclicDependency { .. } => "REGISTRY-CYCLE",
            Self::DuplicateStage { .. } => "REGISTRY-DUPLICATE_STAGE",
            Self::UnknownDependency { .. } => "REGISTRY-MISSING_DEP",
            Self::DuplicateDependency { .. } => "REGISTRY-DUPLICATE_DEP",
            Self::InvalidIdentifier { .. } => "REGISTRY-INVALID_ID",
            Self::NoOutputs { .. } => "REGISTRY-NO_OUTPUTS",
            Self::DuplicateOutput { .. } => "REGISTRY-DUPLICATE_OUTPUT",
            Self::ArtifactPathCollision { .. } => "REGISTRY-PATH_COLLISION",
            Self::InvalidSynthesis { .. } => "REGISTRY-SYNTHESIS",
            Self::Empty => "REGISTRY-EMPTY",
        }
    }

    /// A hint for fixing the configuration.
    #[must_use]
    pub fn fix_hint(&self) -> &'static str {
        match self {
            Self::CyclicDependency { .. } => {
                "Remove one of the dependencies in the cycle to break it."
            }
            Self::DuplicateStage { .. } => "Give every stage a unique id.",
            Self::UnknownDependency { .. } => {
                "Check for typos in depends_on or declare the missing stage."
            }
            Self::DuplicateDependency { .. } => "Remove the repeated depends_on entry.",
            Self::InvalidIdentifier { .. } => {
                "Use only letters, digits, '_' and '-', starting with a letter or digit."
            }
            Self::NoOutputs { .. } => "Declare at least one output artifact for the stage.",
            Self::DuplicateOutput { .. } => "Remove the repeated output name.",
            Self::ArtifactPathCollision { .. } => {
                "Rename a stage or artifact so their '<stage>_<artifact>' names differ."
            }
            Self::InvalidSynthesis { .. } => "Mark at most one stage with synthesis = true.",
            Self::Empty => "Add at least one stage to the pipeline.",
        }
    }
}

/// Errors raised by an artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key already holds content for this run.
    #[error("Artifact {key} already exists")]
    DuplicateArtifact {
        /// `run/stage/name`.
        key: String,
    },

    /// The key holds no content.
    #[error("Artifact {key} not found")]
    NotFound {
        /// `run/stage/name`.
        key: String,
    },

    /// A key component is not a valid identifier.
    #[error("Invalid artifact key component '{value}'")]
    InvalidKey {
        /// The rejected component.
        value: String,
    },

    /// Underlying filesystem failure.
    #[error("Artifact store I/O error at {path}: {source}")]
    Io {
        /// The path being accessed.
        path: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A run manifest could not be read or written.
    #[error("Artifact manifest error at {path}: {source}")]
    Manifest {
        /// The manifest path.
        path: String,
        /// The serialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Errors returned by a generation port call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The backend failed; the call may succeed if retried.
    #[error("Generation failed: {0}")]
    Failed(String),

    /// The call exceeded its deadline.
    #[error("Generation timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The deadline that expired.
        after: Duration,
    },

    /// The backend cannot serve this request at all.
    #[error("Generation unavailable: {0}")]
    Permanent(String),

    /// The run was cancelled while the call was in flight.
    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Creates a transient failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Returns true if the retry budget applies to this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout { .. })
    }
}

/// A single structural problem found by the validation gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// A declared output was not produced.
    MissingArtifact {
        /// The artifact name.
        name: String,
    },
    /// The artifact is empty or whitespace-only.
    EmptyArtifact {
        /// The artifact name.
        name: String,
    },
    /// Fewer non-whitespace characters than required.
    TooShort {
        /// The artifact name.
        name: String,
        /// Non-whitespace characters found.
        chars: usize,
        /// Required minimum.
        min_chars: usize,
    },
    /// Fewer markdown sections than required.
    TooFewSections {
        /// The artifact name.
        name: String,
        /// Heading lines found.
        sections: usize,
        /// Required minimum.
        min_sections: usize,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingArtifact { name } => write!(f, "missing artifact '{name}'"),
            Self::EmptyArtifact { name } => write!(f, "artifact '{name}' is empty"),
            Self::TooShort {
                name,
                chars,
                min_chars,
            } => write!(
                f,
                "artifact '{name}' has {chars} non-whitespace characters, need {min_chars}"
            ),
            Self::TooFewSections {
                name,
                sections,
                min_sections,
            } => write!(
                f,
                "artifact '{name}' has {sections} sections, need {min_sections}"
            ),
        }
    }
}

/// A stage's outputs failed the validation gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed for stage '{stage}': {}", join_issues(.issues))]
pub struct ValidationError {
    /// The stage that was validated.
    pub stage: String,
    /// Every problem found.
    pub issues: Vec<ValidationIssue>,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// No stage is runnable, none is running, and none has failed.
///
/// A validated registry makes this unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Deadlocked stage graph; stuck stages: {}", .stuck.join(", "))]
pub struct DeadlockError {
    /// Stages left pending.
    pub stuck: Vec<String>,
}

/// Errors raised while loading pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Cannot read config {path}: {source}")]
    Io {
        /// The config path.
        path: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for this schema.
    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
