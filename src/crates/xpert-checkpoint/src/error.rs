//! Error types for checkpoint storage operations

use thiserror::Error;

/// Convenience result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint storage backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint exists for the requested key
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// The operation violates a checkpoint invariant
    ///
    /// Raised for a missing parent, a duplicate primary key with conflicting
    /// content, or malformed channel values.
    #[error("Invalid checkpoint operation: {0}")]
    Invalid(String),

    /// Two writers raced on the same (thread, namespace) pair
    #[error("Checkpoint conflict on thread '{thread_id}' ns '{ns}': {detail}")]
    Conflict {
        thread_id: String,
        ns: String,
        detail: String,
    },

    /// Checkpoint payload could not be (de)serialized
    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store failed
    #[error("Checkpoint storage error: {0}")]
    Storage(String),
}
