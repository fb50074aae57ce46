//! # xpert-checkpoint - durable state snapshots for the agent graph runtime
//!
//! This crate holds the persistence seam of the runtime: the checkpoint
//! data model, the [`CheckpointSaver`] trait that storage backends
//! implement, and the in-memory reference backend.
//!
//! Every step of a run crosses the checkpointer: the runner records
//! tentative writes with [`CheckpointSaver::put_writes`], merges them into
//! channels, and persists the merged snapshot with
//! [`CheckpointSaver::put`]. Sub-agent runs use dotted namespaces below
//! their parent so one thread carries an entire tree of snapshots.

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod saver;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointTuple, PendingWrite,
    ROOT_NS,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use saver::CheckpointSaver;
