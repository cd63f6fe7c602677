//! Artifact store: durable, append-only hand-off between stages.
//!
//! This module provides:
//! - The [`ArtifactStore`] trait keyed by (run, stage, name)
//! - An in-memory store for tests and embedded use
//! - A file-backed store with atomic publication

mod fs;
mod memory;

pub use fs::{write_atomic, FileArtifactStore, MANIFEST_FILE};
pub use memory::InMemoryArtifactStore;

use crate::core::{is_valid_identifier, Artifact, ArtifactKey, RunId};
use crate::errors::StoreError;
use std::fmt::Debug;

/// Append-only store of named text documents.
///
/// Implementations must be safe to share between the coordinator and any
/// number of concurrent readers, and must never expose partially written
/// content.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Writes a new artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateArtifact`] if the key already holds
    /// content for the run.
    fn put(
        &self,
        run_id: &RunId,
        stage_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Artifact, StoreError>;

    /// Reads an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key is absent.
    fn get(&self, run_id: &RunId, stage_id: &str, name: &str) -> Result<Artifact, StoreError>;

    /// All artifacts of a stage in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error only on I/O failure; an unknown stage yields an empty list.
    fn list(&self, run_id: &RunId, stage_id: &str) -> Result<Vec<Artifact>, StoreError>;

    /// All artifacts of a run in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error only on I/O failure.
    fn list_run(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError>;

    /// Returns true if the key holds content.
    fn contains(&self, run_id: &RunId, stage_id: &str, name: &str) -> bool {
        self.get(run_id, stage_id, name).is_ok()
    }
}

/// Builds a key after checking that each component is a valid identifier.
pub(crate) fn checked_key(
    run_id: &RunId,
    stage_id: &str,
    name: &str,
) -> Result<ArtifactKey, StoreError> {
    for value in [run_id.as_str(), stage_id, name] {
        if !is_valid_identifier(value) {
            return Err(StoreError::InvalidKey {
                value: value.to_string(),
            });
        }
    }
    Ok(ArtifactKey::new(run_id, stage_id, name))
}
