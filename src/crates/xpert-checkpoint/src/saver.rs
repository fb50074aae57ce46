//! The [`CheckpointSaver`] trait - storage backend abstraction
//!
//! The runtime persists state exclusively through this trait, so any
//! storage system (PostgreSQL, SQLite, Redis, object storage) can back the
//! runtime by implementing four async methods. The bundled
//! [`InMemoryCheckpointSaver`](crate::memory::InMemoryCheckpointSaver) is
//! the reference implementation and the default for tests and the dev
//! server.
//!
//! # Contract
//!
//! - `get_tuple(thread, ns, None)` returns the **latest** checkpoint on
//!   that (thread, ns); with an id it returns that exact checkpoint.
//! - `put` is idempotent on the `(thread_id, ns, id)` primary key and must
//!   reject a `parent_id` that does not reference a stored checkpoint.
//! - `put_writes` records tentative writes for a step before the barrier
//!   merges them; they are returned with the tuple on the next load.
//! - `list` returns newest-first and honors `before`/`limit` pagination.
//! - A failed write must leave no partially visible checkpoint.
//!
//! Implementations must be `Send + Sync`; a single writer per
//! (thread, ns) at a time is guaranteed by the runner, but reads may race
//! with writes freely.

use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointRef, CheckpointTuple, PendingWrite};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for run state snapshots
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint tuple; latest on the (thread, ns) when `id` is absent
    async fn get_tuple(
        &self,
        thread_id: &str,
        ns: &str,
        id: Option<&str>,
    ) -> Result<Option<CheckpointTuple>>;

    /// Store a checkpoint; idempotent on its `(thread_id, ns, id)` key
    async fn put(
        &self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef>;

    /// Record tentative writes for a step against a stored checkpoint
    async fn put_writes(
        &self,
        thread_id: &str,
        ns: &str,
        id: &str,
        writes: Vec<PendingWrite>,
    ) -> Result<()>;

    /// List checkpoints on a (thread, ns), newest first
    async fn list(
        &self,
        thread_id: &str,
        ns: &str,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>>;

    /// Drop every checkpoint and pending write belonging to a thread
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
