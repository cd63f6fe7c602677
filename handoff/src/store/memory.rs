//! In-memory artifact store.

use super::{checked_key, ArtifactStore};
use crate::core::{Artifact, ArtifactKey, RunId};
use crate::errors::StoreError;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    /// Artifacts in insertion order.
    entries: Vec<Artifact>,
    /// Position of each key in `entries`.
    index: HashMap<ArtifactKey, usize>,
}

/// A process-local artifact store.
///
/// Writes take the lock exclusively, so a reader sees an artifact either not
/// at all or in full.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<Inner>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of artifacts across all runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(
        &self,
        run_id: &RunId,
        stage_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Artifact, StoreError> {
        let key = checked_key(run_id, stage_id, name)?;
        let mut inner = self.inner.write();

        if inner.index.contains_key(&key) {
            return Err(StoreError::DuplicateArtifact {
                key: key.to_string(),
            });
        }

        let artifact = Artifact::new(key.clone(), content);
        let position = inner.entries.len();
        inner.entries.push(artifact.clone());
        inner.index.insert(key, position);
        Ok(artifact)
    }

    fn get(&self, run_id: &RunId, stage_id: &str, name: &str) -> Result<Artifact, StoreError> {
        let key = checked_key(run_id, stage_id, name)?;
        let inner = self.inner.read();
        inner
            .index
            .get(&key)
            .and_then(|&position| inner.entries.get(position))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn list(&self, run_id: &RunId, stage_id: &str) -> Result<Vec<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .filter(|a| &a.run_id == run_id && a.stage_id == stage_id)
            .cloned()
            .collect())
    }

    fn list_run(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect())
    }
}
