//! Checkpoint data structures
//!
//! A [`Checkpoint`] is a durable snapshot of every state channel of a run,
//! keyed by `(thread_id, ns, id)`. Checkpoints form a chain through
//! `parent_id`; sub-agent runs store their snapshots under a dotted
//! namespace below the parent run's namespace (`"" → "researcher" →
//! "researcher.browser"`). Tentative channel writes recorded before the
//! step barrier travel with the checkpoint as [`PendingWrite`]s so an
//! interrupted step can be replayed safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint id type
pub type CheckpointId = String;

/// Root checkpoint namespace (the entry agent's run)
pub const ROOT_NS: &str = "";

/// A tentative channel write recorded before the step barrier
///
/// `(task_id, channel, value)`; `task_id` is `"{step}:{node}"` so replay
/// can attribute writes back to the node that produced them.
pub type PendingWrite = (String, String, serde_json::Value);

/// Durable snapshot of all channel values at one step boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Thread this checkpoint belongs to
    pub thread_id: String,

    /// Hierarchical namespace; dotted for sub-agent runs
    pub ns: String,

    /// Unique id within (thread_id, ns)
    pub id: CheckpointId,

    /// Previous checkpoint on the same (thread, ns), if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Channel name → snapshot value
    pub values: HashMap<String, serde_json::Value>,

    /// Writes recorded for the step in progress when this snapshot was taken
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_writes: Vec<PendingWrite>,

    /// Creation timestamp
    pub ts: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a fresh checkpoint with a generated id
    pub fn new(
        thread_id: impl Into<String>,
        ns: impl Into<String>,
        parent_id: Option<CheckpointId>,
        values: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            ns: ns.into(),
            id: Uuid::new_v4().to_string(),
            parent_id,
            values,
            pending_writes: Vec::new(),
            ts: Utc::now(),
        }
    }

    /// Reference to this checkpoint's key
    pub fn as_ref(&self) -> CheckpointRef {
        CheckpointRef {
            thread_id: self.thread_id.clone(),
            ns: self.ns.clone(),
            id: self.id.clone(),
        }
    }
}

/// Key identifying one stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub thread_id: String,
    pub ns: String,
    pub id: CheckpointId,
}

/// Metadata stored alongside a checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Step number within the run (-1 for the input snapshot)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Run that produced this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A checkpoint together with its metadata and parent linkage
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata recorded at `put` time
    pub metadata: CheckpointMetadata,

    /// Key of the parent checkpoint, if any
    pub parent: Option<CheckpointRef>,

    /// Writes recorded via `put_writes` after the checkpoint was stored
    pub pending_writes: Vec<PendingWrite>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_new_generates_id() {
        let cp = Checkpoint::new("t1", ROOT_NS, None, HashMap::new());
        assert!(!cp.id.is_empty());
        assert_eq!(cp.thread_id, "t1");
        assert!(cp.parent_id.is_none());
    }

    #[test]
    fn checkpoint_roundtrips_through_json() {
        let mut values = HashMap::new();
        values.insert("messages".to_string(), serde_json::json!([{"role": "human"}]));
        let cp = Checkpoint::new("t1", "researcher", Some("parent".into()), values);

        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, cp.id);
        assert_eq!(back.ns, "researcher");
        assert_eq!(back.parent_id.as_deref(), Some("parent"));
        assert_eq!(back.values, cp.values);
    }

    #[test]
    fn metadata_builder() {
        let meta = CheckpointMetadata::new()
            .with_step(3)
            .with_run_id("run-1")
            .with_extra("source", serde_json::json!("loop"));
        assert_eq!(meta.step, Some(3));
        assert_eq!(meta.run_id.as_deref(), Some("run-1"));
        assert_eq!(meta.extra.get("source"), Some(&serde_json::json!("loop")));
    }
}
