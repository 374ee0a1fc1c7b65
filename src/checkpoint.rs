//! Durable task checkpoints.
//!
//! Checkpoints are written by the orchestrator at step boundaries only
//! (never mid tool-call) and read back on resume. Keys are
//! `(session_key, step_index)`; writes are append-only per key, so the
//! only discipline needed is write-to-temp-then-rename.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::task::Task;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage for task snapshots.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(
        &self,
        session_key: &str,
        step_index: usize,
        task: &Task,
    ) -> Result<(), CheckpointError>;

    async fn get(
        &self,
        session_key: &str,
        step_index: usize,
    ) -> Result<Option<Task>, CheckpointError>;

    /// The snapshot with the highest step index for the session, if any.
    async fn latest(&self, session_key: &str) -> Result<Option<Task>, CheckpointError>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: Mutex<HashMap<String, Vec<(usize, Task)>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        session_key: &str,
        step_index: usize,
        task: &Task,
    ) -> Result<(), CheckpointError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let entries = snapshots.entry(session_key.to_string()).or_default();
        entries.retain(|(idx, _)| *idx != step_index);
        entries.push((step_index, task.clone()));
        Ok(())
    }

    async fn get(
        &self,
        session_key: &str,
        step_index: usize,
    ) -> Result<Option<Task>, CheckpointError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(session_key).and_then(|entries| {
            entries
                .iter()
                .find(|(idx, _)| *idx == step_index)
                .map(|(_, task)| task.clone())
        }))
    }

    async fn latest(&self, session_key: &str) -> Result<Option<Task>, CheckpointError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(session_key).and_then(|entries| {
            entries
                .iter()
                .max_by_key(|(idx, _)| *idx)
                .map(|(_, task)| task.clone())
        }))
    }
}

/// File-backed store: one JSON file per `(session_key, step_index)` under
/// `<root>/<session_key>/step_<NNN>.json`.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, session_key: &str, step_index: usize) -> PathBuf {
        self.root
            .join(session_key)
            .join(format!("step_{:03}.json", step_index))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(
        &self,
        session_key: &str,
        step_index: usize,
        task: &Task,
    ) -> Result<(), CheckpointError> {
        let path = self.path_for(session_key, step_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(task)?;

        // Write to a temp file then rename so readers never observe a
        // half-written snapshot.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(session_key, step_index, "checkpoint written");
        Ok(())
    }

    async fn get(
        &self,
        session_key: &str,
        step_index: usize,
    ) -> Result<Option<Task>, CheckpointError> {
        let path = self.path_for(session_key, step_index);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest(&self, session_key: &str) -> Result<Option<Task>, CheckpointError> {
        let dir = self.root.join(session_key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<(usize, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(index) = name
                .strip_prefix("step_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<usize>().ok())
            else {
                continue;
            };
            if best.as_ref().map_or(true, |(b, _)| index > *b) {
                best = Some((index, path));
            }
        }

        match best {
            Some((_, path)) => {
                let json = tokio::fs::read_to_string(&path).await?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::{Goal, Phase, StepDescription};

    fn task_at_step(step: usize) -> Task {
        let mut task = Task::new(
            "cafebabe".to_string(),
            Goal::Brief {
                text: "a bridge".to_string(),
            },
        );
        task.plan = (0..5)
            .map(|i| StepDescription::new(i, format!("step {i}")))
            .collect();
        task.current_step = step;
        task.phase = Phase::Execute;
        task
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf());

        store.put("cafebabe", 0, &task_at_step(0)).await.unwrap();
        store.put("cafebabe", 2, &task_at_step(2)).await.unwrap();
        store.put("cafebabe", 1, &task_at_step(1)).await.unwrap();

        let fetched = store.get("cafebabe", 1).await.unwrap().unwrap();
        assert_eq!(fetched.current_step, 1);

        let latest = store.latest("cafebabe").await.unwrap().unwrap();
        assert_eq!(latest.current_step, 2);

        assert!(store.latest("unknown").await.unwrap().is_none());
        assert!(store.get("cafebabe", 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf());
        store.put("k", 0, &task_at_step(0)).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("k"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["step_000.json"]);
    }

    #[tokio::test]
    async fn memory_store_overwrites_same_key() {
        let store = InMemoryCheckpointStore::new();
        store.put("k", 0, &task_at_step(0)).await.unwrap();
        let mut updated = task_at_step(0);
        updated.iterations = 7;
        store.put("k", 0, &updated).await.unwrap();

        let fetched = store.get("k", 0).await.unwrap().unwrap();
        assert_eq!(fetched.iterations, 7);
        assert_eq!(store.latest("k").await.unwrap().unwrap().iterations, 7);
    }
}
