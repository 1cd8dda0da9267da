//! Durable plan document.
//!
//! Every save rewrites the whole document through a sibling temp file and an
//! atomic rename, so readers never observe a half-written plan.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::Plan;

/// Failure to read or write the plan document. Fatal to a run.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to serialize plan: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write plan to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read plan from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("plan at {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A plan document at a fixed path.
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `plan` and atomically replace the document.
    pub async fn save(&self, plan: &Plan) -> Result<(), PersistenceError> {
        let json = plan.to_json_pretty().map_err(PersistenceError::Serialize)?;
        let write_err = |source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
            }
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(json.as_bytes()).await.map_err(write_err)?;
        file.write_all(b"\n").await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }

        tracing::debug!(path = %self.path.display(), "plan saved");
        Ok(())
    }

    pub async fn load(&self) -> Result<Plan, PersistenceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PersistenceError::Read {
                path: self.path.clone(),
                source,
            })?;
        Plan::from_json(&content).map_err(|source| PersistenceError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// `.{name}.tmp` next to the document, on the same filesystem.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan.json".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Subtask, SubtaskStatus};

    fn plan() -> Plan {
        Plan::new(vec![Subtask::new("s1", "Survey", "Read the code", "coder", "local", 1)])
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path().join("nested/state/plan.json"));

        let mut plan = plan();
        store.save(&plan).await.unwrap();
        plan.subtasks[0].status = SubtaskStatus::Completed;
        store.save(&plan).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, plan);
        assert!(
            !dir.path().join("nested/state/.plan.json.tmp").exists(),
            "temp file should be renamed away"
        );
    }

    #[tokio::test]
    async fn save_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let store = PlanStore::new(blocker.join("plan.json"));
        let err = store.save(&plan()).await.unwrap_err();
        assert!(
            matches!(err, PersistenceError::Write { .. }),
            "expected Write, got: {err}"
        );
    }

    #[tokio::test]
    async fn load_reports_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let store = PlanStore::new(&path);

        assert!(matches!(
            store.load().await.unwrap_err(),
            PersistenceError::Read { .. }
        ));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            store.load().await.unwrap_err(),
            PersistenceError::Parse { .. }
        ));
    }
}
