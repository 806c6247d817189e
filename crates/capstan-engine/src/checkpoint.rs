//! Checkpoint stores: append-only snapshots keyed by thread id.
//!
//! The engine writes a [`Checkpoint`] after every successful merge and
//! before every suspension, and only ever reads the latest one. History is
//! kept for audit and can be pruned by policy; pruning is never required
//! for correctness. Two backings ship behind the same contract: a
//! process-local in-memory map and an on-disk JSON store. The engine is
//! agnostic to which.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use capstan_types::{Checkpoint, Result, State, ThreadId, WorkflowError};

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint to the thread's history. Never overwrites.
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// The most recent checkpoint for a thread, if any.
    async fn latest(&self, thread: &ThreadId) -> Result<Option<Checkpoint>>;

    /// Full history, oldest first.
    async fn history(&self, thread: &ThreadId) -> Result<Vec<Checkpoint>>;

    /// Drop all but the `keep` most recent checkpoints. Storage-bound
    /// housekeeping only.
    async fn prune(&self, thread: &ThreadId, keep: usize) -> Result<()>;

    /// Reconstruct the latest state for a thread. Fails with `NoCheckpoint`
    /// when the thread has never been started.
    async fn restore(&self, thread: &ThreadId) -> Result<State> {
        self.latest(thread)
            .await?
            .map(|cp| cp.state)
            .ok_or_else(|| WorkflowError::NoCheckpoint {
                thread: thread.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Process-local backing: a map of per-thread checkpoint vectors.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: tokio::sync::RwLock<HashMap<ThreadId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn latest(&self, thread: &ThreadId) -> Result<Option<Checkpoint>> {
        let guard = self.inner.read().await;
        Ok(guard.get(thread).and_then(|v| v.last().cloned()))
    }

    async fn history(&self, thread: &ThreadId) -> Result<Vec<Checkpoint>> {
        let guard = self.inner.read().await;
        Ok(guard.get(thread).cloned().unwrap_or_default())
    }

    async fn prune(&self, thread: &ThreadId, keep: usize) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(history) = guard.get_mut(thread) {
            if history.len() > keep {
                let drop_count = history.len() - keep;
                history.drain(..drop_count);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Durable backing: one JSON file per checkpoint under
/// `<root>/<thread>/<index>.json`, indices strictly increasing.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn thread_dir(&self, thread: &ThreadId) -> PathBuf {
        self.root.join(thread.as_str())
    }

    /// Sorted list of checkpoint file indices for a thread.
    async fn indices(&self, dir: &Path) -> Result<Vec<u64>> {
        if !tokio::fs::try_exists(dir).await? {
            return Ok(Vec::new());
        }
        let mut indices = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(idx) = stem.parse::<u64>() {
                    indices.push(idx);
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn file_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("{index:08}.json"))
    }

    async fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let dir = self.thread_dir(&checkpoint.thread_id);
        tokio::fs::create_dir_all(&dir).await?;
        let next = self.indices(&dir).await?.last().map_or(0, |i| i + 1);
        let path = Self::file_path(&dir, next);
        let json = serde_json::to_string_pretty(&checkpoint)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), position = %checkpoint.position, "checkpoint saved");
        Ok(())
    }

    async fn latest(&self, thread: &ThreadId) -> Result<Option<Checkpoint>> {
        let dir = self.thread_dir(thread);
        match self.indices(&dir).await?.last() {
            None => Ok(None),
            Some(&idx) => Ok(Some(Self::read_checkpoint(&Self::file_path(&dir, idx)).await?)),
        }
    }

    async fn history(&self, thread: &ThreadId) -> Result<Vec<Checkpoint>> {
        let dir = self.thread_dir(thread);
        let mut out = Vec::new();
        for idx in self.indices(&dir).await? {
            out.push(Self::read_checkpoint(&Self::file_path(&dir, idx)).await?);
        }
        Ok(out)
    }

    async fn prune(&self, thread: &ThreadId, keep: usize) -> Result<()> {
        let dir = self.thread_dir(thread);
        let indices = self.indices(&dir).await?;
        if indices.len() > keep {
            for &idx in &indices[..indices.len() - keep] {
                tokio::fs::remove_file(Self::file_path(&dir, idx)).await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_types::{RunStatus, StateUpdate};
    use serde_json::json;

    fn checkpoint_at(thread: &str, position: &str, marker: u64) -> Checkpoint {
        let state = capstan_types::State::new()
            .with("marker", json!(marker))
            .merge(&StateUpdate::new());
        Checkpoint::new(
            ThreadId::new(thread),
            position,
            RunStatus::Running,
            state,
            Vec::new(),
        )
    }

    async fn exercise_store(store: &dyn CheckpointStore) {
        let t1 = ThreadId::new("t1");
        let t2 = ThreadId::new("t2");

        // Empty store: no latest, restore fails with NoCheckpoint.
        assert!(store.latest(&t1).await.unwrap().is_none());
        match store.restore(&t1).await.unwrap_err() {
            WorkflowError::NoCheckpoint { thread } => assert_eq!(thread, "t1"),
            other => panic!("expected NoCheckpoint, got: {other:?}"),
        }

        // Saves are append-only; latest sees the newest.
        store.save(checkpoint_at("t1", "load", 1)).await.unwrap();
        store.save(checkpoint_at("t1", "parse", 2)).await.unwrap();
        store.save(checkpoint_at("t2", "other", 9)).await.unwrap();

        let latest = store.latest(&t1).await.unwrap().unwrap();
        assert_eq!(latest.position, "parse");
        assert_eq!(latest.state.get_u64("marker"), Some(2));

        let history = store.history(&t1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].position, "load");

        // Threads never observe each other.
        let other = store.latest(&t2).await.unwrap().unwrap();
        assert_eq!(other.position, "other");

        // restore reconstructs the latest state.
        let restored = store.restore(&t1).await.unwrap();
        assert_eq!(restored.get_u64("marker"), Some(2));

        // prune keeps only the newest entries.
        store.save(checkpoint_at("t1", "extract", 3)).await.unwrap();
        store.prune(&t1, 1).await.unwrap();
        let history = store.history(&t1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].position, "extract");
        // Latest still intact after prune.
        assert_eq!(store.latest(&t1).await.unwrap().unwrap().position, "extract");
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryCheckpointStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::new(dir.path());
            store.save(checkpoint_at("t1", "load", 1)).await.unwrap();
            store.save(checkpoint_at("t1", "parse", 2)).await.unwrap();
        }

        // A fresh instance over the same root sees the same history.
        let store = FileCheckpointStore::new(dir.path());
        let latest = store.latest(&ThreadId::new("t1")).await.unwrap().unwrap();
        assert_eq!(latest.position, "parse");
        assert_eq!(store.history(&ThreadId::new("t1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prune_below_count_is_noop() {
        let store = MemoryCheckpointStore::new();
        let t1 = ThreadId::new("t1");
        store.save(checkpoint_at("t1", "a", 1)).await.unwrap();
        store.prune(&t1, 10).await.unwrap();
        assert_eq!(store.history(&t1).await.unwrap().len(), 1);
    }
}
