//! Artifacts: immutable named text documents produced by stages.

use super::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Returns the lowercase hex SHA-256 of `content`.
///
/// The checksum depends on the content only, so regenerating a document
/// byte-for-byte yields the same checksum.
#[must_use]
pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Typed address of an artifact: (run, stage, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The run namespace.
    pub run_id: RunId,
    /// The producing stage.
    pub stage_id: String,
    /// The artifact name within the stage.
    pub name: String,
}

impl ArtifactKey {
    /// Creates a new artifact key.
    #[must_use]
    pub fn new(run_id: &RunId, stage_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.clone(),
            stage_id: stage_id.into(),
            name: name.into(),
        }
    }

    /// The flattened `<stage>_<artifact>` name used by on-disk stores.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.stage_id, self.name)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.stage_id, self.name)
    }
}

/// A document returned by the generation port, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// The artifact name (one of the stage's declared outputs).
    pub name: String,
    /// The document text.
    pub content: String,
}

impl GeneratedArtifact {
    /// Creates a generated artifact.
    #[must_use]
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A stored artifact.
///
/// Never mutated once written for a given run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The run namespace.
    pub run_id: RunId,
    /// The producing stage.
    pub stage_id: String,
    /// The artifact name.
    pub name: String,
    /// The document text (markdown-compatible).
    pub content: String,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of `content`.
    pub checksum: String,
}

impl Artifact {
    /// Creates an artifact stamped with the current time.
    #[must_use]
    pub fn new(key: ArtifactKey, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            checksum: checksum(&content),
            run_id: key.run_id,
            stage_id: key.stage_id,
            name: key.name,
            content,
            created_at: Utc::now(),
        }
    }

    /// Returns the store key of this artifact.
    #[must_use]
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.run_id, &self.stage_id, &self.name)
    }

    /// Content length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Returns true if the content is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
