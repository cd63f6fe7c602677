//! File-backed artifact store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<run_id>/<stage>_<artifact>.md
//! <root>/<run_id>/manifest.json
//! ```
//!
//! Content is written to a temporary file in the run directory, fsynced and
//! then published under its final name without overwriting. The manifest is
//! the index readers consult, and it is only updated after the content file
//! is in place, so a reader never observes a partially written document.

use super::{checked_key, ArtifactStore};
use crate::core::{Artifact, RunId};
use crate::errors::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Name of the per-run index file.
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    stage_id: String,
    name: String,
    file: String,
    checksum: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    run_id: RunId,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    fn empty(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
            entries: Vec::new(),
        }
    }

    fn find(&self, stage_id: &str, name: &str) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .find(|e| e.stage_id == stage_id && e.name == name)
    }
}

/// Atomically replaces `path` with `content` (temp file, fsync, rename).
///
/// # Errors
///
/// Returns [`StoreError::Io`] if any filesystem step fails.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir.display(), e))?;

    let temp = write_temp(dir, content)?;
    temp.persist(path)
        .map_err(|e| StoreError::io(path.display(), e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn write_temp(dir: &Path, content: &str) -> Result<NamedTempFile, StoreError> {
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir.display(), e))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| StoreError::io(temp.path().display(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(temp.path().display(), e))?;
    Ok(temp)
}

/// An artifact store rooted at a directory.
///
/// Writers are serialized by an internal lock; content reads happen outside
/// the lock.
#[derive(Debug)]
pub struct FileArtifactStore {
    root: PathBuf,
    manifests: Mutex<HashMap<RunId, Manifest>>,
}

impl FileArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Existing runs are loaded lazily from their manifests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(root.display(), e))?;
        Ok(Self {
            root,
            manifests: Mutex::new(HashMap::new()),
        })
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a run's artifacts.
    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    /// Path an artifact is (or would be) published at.
    #[must_use]
    pub fn artifact_path(&self, run_id: &RunId, stage_id: &str, name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{stage_id}_{name}.md"))
    }

    /// Runs with a manifest under the root, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the root cannot be read.
    pub fn runs(&self) -> Result<Vec<RunId>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(self.root.display(), e))?;
        let mut runs: Vec<RunId> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(MANIFEST_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().and_then(RunId::parse))
            .collect();
        runs.sort();
        Ok(runs)
    }

    fn load_manifest(&self, run_id: &RunId) -> Result<Manifest, StoreError> {
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Manifest {
                path: path.display().to_string(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::empty(run_id)),
            Err(e) => Err(StoreError::io(path.display(), e)),
        }
    }

    fn manifest_mut<'a>(
        &self,
        manifests: &'a mut HashMap<RunId, Manifest>,
        run_id: &RunId,
    ) -> Result<&'a mut Manifest, StoreError> {
        match manifests.entry(run_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(self.load_manifest(run_id)?)),
        }
    }

    fn save_manifest(&self, run_id: &RunId, manifest: &Manifest) -> Result<(), StoreError> {
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        let raw = serde_json::to_string_pretty(manifest).map_err(|source| StoreError::Manifest {
            path: path.display().to_string(),
            source,
        })?;
        write_atomic(&path, &raw)
    }

    /// Entries matching `filter`, copied out so files can be read unlocked.
    fn entries_where(
        &self,
        run_id: &RunId,
        filter: impl Fn(&ManifestEntry) -> bool,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut manifests = self.manifests.lock();
        let manifest = self.manifest_mut(&mut manifests, run_id)?;
        Ok(manifest.entries.iter().filter(|&e| filter(e)).cloned().collect())
    }

    fn read_entry(&self, run_id: &RunId, entry: ManifestEntry) -> Result<Artifact, StoreError> {
        let path = self.run_dir(run_id).join(&entry.file);
        let content = fs::read_to_string(&path).map_err(|e| StoreError::io(path.display(), e))?;
        Ok(Artifact {
            run_id: run_id.clone(),
            stage_id: entry.stage_id,
            name: entry.name,
            content,
            created_at: entry.created_at,
            checksum: entry.checksum,
        })
    }
}

impl ArtifactStore for FileArtifactStore {
    fn put(
        &self,
        run_id: &RunId,
        stage_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Artifact, StoreError> {
        let key = checked_key(run_id, stage_id, name)?;
        let mut manifests = self.manifests.lock();
        let manifest = self.manifest_mut(&mut manifests, run_id)?;

        if manifest.find(stage_id, name).is_some() {
            return Err(StoreError::DuplicateArtifact {
                key: key.to_string(),
            });
        }

        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir).map_err(|e| StoreError::io(run_dir.display(), e))?;

        let file = format!("{}.md", key.file_stem());
        let target = run_dir.join(&file);
        let temp = write_temp(&run_dir, content)?;
        if let Err(e) = temp.persist_noclobber(&target) {
            return Err(if e.error.kind() == ErrorKind::AlreadyExists {
                StoreError::DuplicateArtifact {
                    key: key.to_string(),
                }
            } else {
                StoreError::io(target.display(), e.error)
            });
        }

        let artifact = Artifact::new(key, content);
        manifest.entries.push(ManifestEntry {
            stage_id: artifact.stage_id.clone(),
            name: artifact.name.clone(),
            file,
            checksum: artifact.checksum.clone(),
            created_at: artifact.created_at,
        });
        if let Err(e) = self.save_manifest(run_id, manifest) {
            manifest.entries.pop();
            return Err(e);
        }

        debug!(
            run_id = %run_id,
            stage = stage_id,
            artifact = name,
            checksum = %artifact.checksum,
            "Artifact published"
        );
        Ok(artifact)
    }

    fn get(&self, run_id: &RunId, stage_id: &str, name: &str) -> Result<Artifact, StoreError> {
        let key = checked_key(run_id, stage_id, name)?;
        let entry = self
            .entries_where(run_id, |e| e.stage_id == stage_id && e.name == name)?
            .pop()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        self.read_entry(run_id, entry)
    }

    fn list(&self, run_id: &RunId, stage_id: &str) -> Result<Vec<Artifact>, StoreError> {
        checked_key(run_id, stage_id, "list")?;
        self.entries_where(run_id, |e| e.stage_id == stage_id)?
            .into_iter()
            .map(|entry| self.read_entry(run_id, entry))
            .collect()
    }

    fn list_run(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError> {
        checked_key(run_id, "run", "list")?;
        self.entries_where(run_id, |_| true)?
            .into_iter()
            .map(|entry| self.read_entry(run_id, entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn run(id: &str) -> RunId {
        RunId::parse(id).unwrap()
    }

    #[test]
    fn test_put_publishes_file_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();

        let artifact = store.put(&run("r1"), "load", "summary", "# Summary").unwrap();

        let path = dir.path().join("r1").join("load_summary.md");
        assert_eq!(fs::read_to_string(&path).unwrap(), "# Summary");
        assert_eq!(store.artifact_path(&run("r1"), "load", "summary"), path);
        assert!(dir.path().join("r1").join(MANIFEST_FILE).is_file());
        assert_eq!(store.get(&run("r1"), "load", "summary").unwrap(), artifact);
    }

    #[test]
    fn test_manifest_run_id_is_checked_on_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("r1")).unwrap();
        fs::write(
            dir.path().join("r1").join(MANIFEST_FILE),
            r#"{"run_id": "../elsewhere", "entries": []}"#,
        )
        .unwrap();

        let store = FileArtifactStore::open(dir.path()).unwrap();
        let err = store.put(&run("r1"), "load", "doc", "content").unwrap_err();
        assert!(matches!(err, StoreError::Manifest { .. }));
        assert!(!dir.path().join("elsewhere").exists());
    }

    #[test]
    fn test_manifest_saved_under_callers_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("r1")).unwrap();
        fs::write(
            dir.path().join("r1").join(MANIFEST_FILE),
            r#"{"run_id": "other", "entries": []}"#,
        )
        .unwrap();

        let store = FileArtifactStore::open(dir.path()).unwrap();
        store.put(&run("r1"), "load", "doc", "content").unwrap();
        assert!(!dir.path().join("other").exists());
        assert_eq!(store.list_run(&run("r1")).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();
        store.put(&run("r1"), "load", "doc", "first").unwrap();

        let err = store.put(&run("r1"), "load", "doc", "second").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateArtifact { .. }));
        assert_eq!(store.get(&run("r1"), "load", "doc").unwrap().content, "first");
    }

    #[test]
    fn test_reopen_preserves_artifacts_and_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileArtifactStore::open(dir.path()).unwrap();
            store.put(&run("r1"), "a", "second", "2").unwrap();
            store.put(&run("r1"), "a", "first", "1").unwrap();
            store.put(&run("r1"), "b", "doc", "b").unwrap();
        }

        let store = FileArtifactStore::open(dir.path()).unwrap();
        let names: Vec<String> = store
            .list(&run("r1"), "a")
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);
        assert_eq!(store.list_run(&run("r1")).unwrap().len(), 3);
        assert_eq!(store.runs().unwrap(), vec![run("r1")]);

        let err = store.put(&run("r1"), "b", "doc", "again").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateArtifact { .. }));
    }

    #[test]
    fn test_stale_file_without_manifest_entry_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("r1")).unwrap();
        fs::write(dir.path().join("r1").join("a_doc.md"), "foreign").unwrap();

        let err = store.put(&run("r1"), "a", "doc", "mine").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateArtifact { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("r1").join("a_doc.md")).unwrap(),
            "foreign"
        );
    }

    #[test]
    fn test_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get(&run("r1"), "a", "doc"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.list(&run("r1"), "a").unwrap().is_empty());
    }

    #[test]
    fn test_readers_never_observe_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileArtifactStore::open(dir.path()).unwrap());
        let content = Arc::new(format!("# Large\n{}", "x".repeat(512 * 1024)));
        let expected = crate::core::checksum(&content);
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let store = store.clone();
            let content = content.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut observed = 0;
                while !done.load(Ordering::SeqCst) {
                    for i in 0..4 {
                        match store.get(&run("r1"), &format!("writer{i}"), "doc") {
                            Ok(artifact) => {
                                assert_eq!(artifact.content.len(), content.len());
                                assert_eq!(crate::core::checksum(&artifact.content), expected);
                                observed += 1;
                            }
                            Err(StoreError::NotFound { .. }) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                }
                observed
            })
        };

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                let content = content.clone();
                std::thread::spawn(move || {
                    store
                        .put(&run("r1"), &format!("writer{i}"), "doc", &content)
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        reader.join().unwrap();

        assert_eq!(store.list_run(&run("r1")).unwrap().len(), 4);
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");

        write_atomic(&path, "{}").unwrap();
        write_atomic(&path, "{\"ok\":true}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"ok\":true}");
    }
}
