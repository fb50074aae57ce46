//! In-memory checkpoint backend
//!
//! Reference implementation of [`CheckpointSaver`] backed by a process-local
//! map. Checkpoints for each (thread, ns) live in an append-ordered vector
//! behind one `RwLock`, which gives the single-writer-per-key guarantee the
//! contract requires without any per-key lock table.

use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointTuple, PendingWrite};
use crate::error::{CheckpointError, Result};
use crate::saver::CheckpointSaver;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    writes: Vec<PendingWrite>,
}

/// Process-local checkpoint storage
///
/// Used by every test suite and by the server when no external backend is
/// configured. Threads are isolated; namespaces within a thread are
/// isolated.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointSaver {
    // (thread_id, ns) → checkpoints in insertion order
    threads: RwLock<HashMap<(String, String), Vec<StoredCheckpoint>>>,
}

impl InMemoryCheckpointSaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints stored across all threads (test helper)
    pub async fn checkpoint_count(&self) -> usize {
        self.threads.read().await.values().map(Vec::len).sum()
    }

    fn to_tuple(entries: &[StoredCheckpoint], index: usize) -> CheckpointTuple {
        let stored = &entries[index];
        let parent = stored.checkpoint.parent_id.as_ref().map(|pid| CheckpointRef {
            thread_id: stored.checkpoint.thread_id.clone(),
            ns: stored.checkpoint.ns.clone(),
            id: pid.clone(),
        });
        CheckpointTuple {
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent,
            pending_writes: stored.writes.clone(),
        }
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(
        &self,
        thread_id: &str,
        ns: &str,
        id: Option<&str>,
    ) -> Result<Option<CheckpointTuple>> {
        let threads = self.threads.read().await;
        let key = (thread_id.to_string(), ns.to_string());
        let Some(entries) = threads.get(&key) else {
            return Ok(None);
        };
        let index = match id {
            Some(id) => entries.iter().position(|s| s.checkpoint.id == id),
            None => entries.len().checked_sub(1),
        };
        Ok(index.map(|i| Self::to_tuple(entries, i)))
    }

    async fn put(
        &self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef> {
        let mut threads = self.threads.write().await;
        let key = (checkpoint.thread_id.clone(), checkpoint.ns.clone());
        let entries = threads.entry(key).or_default();

        if let Some(parent_id) = &checkpoint.parent_id {
            if !entries.iter().any(|s| &s.checkpoint.id == parent_id) {
                return Err(CheckpointError::Invalid(format!(
                    "parent checkpoint '{}' does not exist on thread '{}' ns '{}'",
                    parent_id, checkpoint.thread_id, checkpoint.ns
                )));
            }
        }

        let reference = checkpoint.as_ref();
        if let Some(existing) = entries.iter_mut().find(|s| s.checkpoint.id == checkpoint.id) {
            // Idempotent re-put on the primary key replaces the stored row.
            existing.checkpoint = checkpoint;
            existing.metadata = metadata;
        } else {
            entries.push(StoredCheckpoint {
                checkpoint,
                metadata,
                writes: Vec::new(),
            });
        }
        Ok(reference)
    }

    async fn put_writes(
        &self,
        thread_id: &str,
        ns: &str,
        id: &str,
        writes: Vec<PendingWrite>,
    ) -> Result<()> {
        let mut threads = self.threads.write().await;
        let key = (thread_id.to_string(), ns.to_string());
        let entries = threads.get_mut(&key).ok_or_else(|| {
            CheckpointError::NotFound(format!("thread '{thread_id}' ns '{ns}'"))
        })?;
        let stored = entries
            .iter_mut()
            .find(|s| s.checkpoint.id == id)
            .ok_or_else(|| CheckpointError::NotFound(format!("checkpoint '{id}'")))?;
        stored.writes = writes;
        Ok(())
    }

    async fn list(
        &self,
        thread_id: &str,
        ns: &str,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let threads = self.threads.read().await;
        let key = (thread_id.to_string(), ns.to_string());
        let Some(entries) = threads.get(&key) else {
            return Ok(Vec::new());
        };

        // Newest first; "before" cuts at the named checkpoint, exclusive.
        let end = match before {
            Some(id) => entries
                .iter()
                .position(|s| s.checkpoint.id == id)
                .unwrap_or(entries.len()),
            None => entries.len(),
        };
        let mut result: Vec<CheckpointTuple> = (0..end)
            .rev()
            .map(|i| Self::to_tuple(entries, i))
            .collect();
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads.retain(|(tid, _), _| tid != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ROOT_NS;
    use std::collections::HashMap;

    fn cp(thread: &str, ns: &str, parent: Option<&str>, marker: i64) -> Checkpoint {
        let mut values = HashMap::new();
        values.insert("marker".to_string(), serde_json::json!(marker));
        Checkpoint::new(thread, ns, parent.map(String::from), values)
    }

    #[tokio::test]
    async fn latest_is_returned_without_id() {
        let saver = InMemoryCheckpointSaver::new();
        let first = cp("t1", ROOT_NS, None, 1);
        let first_id = first.id.clone();
        saver.put(first, CheckpointMetadata::new()).await.unwrap();
        let second = cp("t1", ROOT_NS, Some(&first_id), 2);
        saver.put(second, CheckpointMetadata::new()).await.unwrap();

        let tuple = saver.get_tuple("t1", ROOT_NS, None).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.values["marker"], serde_json::json!(2));
        assert_eq!(tuple.parent.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn get_by_id_returns_exact_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let first = cp("t1", ROOT_NS, None, 1);
        let first_id = first.id.clone();
        saver.put(first, CheckpointMetadata::new()).await.unwrap();
        saver
            .put(cp("t1", ROOT_NS, Some(&first_id), 2), CheckpointMetadata::new())
            .await
            .unwrap();

        let tuple = saver
            .get_tuple("t1", ROOT_NS, Some(&first_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tuple.checkpoint.values["marker"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn missing_parent_is_rejected() {
        let saver = InMemoryCheckpointSaver::new();
        let orphan = cp("t1", ROOT_NS, Some("no-such-parent"), 1);
        let err = saver.put(orphan, CheckpointMetadata::new()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }

    #[tokio::test]
    async fn put_is_idempotent_on_key() {
        let saver = InMemoryCheckpointSaver::new();
        let mut checkpoint = cp("t1", ROOT_NS, None, 1);
        saver
            .put(checkpoint.clone(), CheckpointMetadata::new())
            .await
            .unwrap();
        checkpoint.values.insert("marker".into(), serde_json::json!(9));
        saver.put(checkpoint, CheckpointMetadata::new()).await.unwrap();

        assert_eq!(saver.checkpoint_count().await, 1);
        let tuple = saver.get_tuple("t1", ROOT_NS, None).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.values["marker"], serde_json::json!(9));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let saver = InMemoryCheckpointSaver::new();
        saver.put(cp("t1", ROOT_NS, None, 1), CheckpointMetadata::new()).await.unwrap();
        saver
            .put(cp("t1", "researcher", None, 2), CheckpointMetadata::new())
            .await
            .unwrap();

        let root = saver.get_tuple("t1", ROOT_NS, None).await.unwrap().unwrap();
        let sub = saver.get_tuple("t1", "researcher", None).await.unwrap().unwrap();
        assert_eq!(root.checkpoint.values["marker"], serde_json::json!(1));
        assert_eq!(sub.checkpoint.values["marker"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn pending_writes_roundtrip() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = cp("t1", ROOT_NS, None, 1);
        let id = checkpoint.id.clone();
        saver.put(checkpoint, CheckpointMetadata::new()).await.unwrap();

        let writes = vec![(
            "0:call_model".to_string(),
            "messages".to_string(),
            serde_json::json!([{"role": "assistant", "content": "hi"}]),
        )];
        saver.put_writes("t1", ROOT_NS, &id, writes.clone()).await.unwrap();

        let tuple = saver.get_tuple("t1", ROOT_NS, None).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes, writes);
    }

    #[tokio::test]
    async fn list_is_newest_first_with_pagination() {
        let saver = InMemoryCheckpointSaver::new();
        let mut prev: Option<String> = None;
        let mut ids = Vec::new();
        for i in 0..4 {
            let checkpoint = cp("t1", ROOT_NS, prev.as_deref(), i);
            prev = Some(checkpoint.id.clone());
            ids.push(checkpoint.id.clone());
            saver.put(checkpoint, CheckpointMetadata::new()).await.unwrap();
        }

        let all = saver.list("t1", ROOT_NS, None, None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].checkpoint.id, ids[3]);

        let page = saver.list("t1", ROOT_NS, Some(&ids[2]), Some(1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].checkpoint.id, ids[1]);
    }

    #[tokio::test]
    async fn delete_thread_removes_all_namespaces() {
        let saver = InMemoryCheckpointSaver::new();
        saver.put(cp("t1", ROOT_NS, None, 1), CheckpointMetadata::new()).await.unwrap();
        saver.put(cp("t1", "sub", None, 2), CheckpointMetadata::new()).await.unwrap();
        saver.put(cp("t2", ROOT_NS, None, 3), CheckpointMetadata::new()).await.unwrap();

        saver.delete_thread("t1").await.unwrap();
        assert!(saver.get_tuple("t1", ROOT_NS, None).await.unwrap().is_none());
        assert!(saver.get_tuple("t1", "sub", None).await.unwrap().is_none());
        assert!(saver.get_tuple("t2", ROOT_NS, None).await.unwrap().is_some());
    }
}
