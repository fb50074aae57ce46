//! Error types for graph compilation and execution
//!
//! Errors are grouped into the categories the runtime reacts to
//! differently: configuration errors are fatal at compile time, input
//! errors fail the run with no partial commit, tool errors are recovered
//! inside the tool node, model errors consult the agent's error-handling
//! policy, and infrastructure failures abort the run while leaving the
//! last checkpoint valid. Interrupts also travel through this enum; the
//! runner is the only catcher of [`GraphError::Interrupt`].

use crate::interrupt::Interrupt;
use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Error type for all graph operations
#[derive(Debug, Error)]
pub enum GraphError {
    /// Invalid graph, middleware or model configuration; fatal at compile time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid caller input (bad resume command, unknown tool in a
    /// selection, malformed arguments); fatal for the run
    #[error("Input error: {0}")]
    Input(String),

    /// The run exceeded its step ceiling
    #[error("{}", recursion_limit_message(*limit, language.as_deref()))]
    RecursionLimit { limit: usize, language: Option<String> },

    /// A run- or tool-level deadline expired
    #[error("{}", timeout_message(operation, *duration_ms, language.as_deref()))]
    Timeout {
        operation: String,
        duration_ms: u64,
        language: Option<String>,
    },

    /// A tool invocation failed and the tool node chose not to recover
    #[error("Tool '{tool}' failed: {error}")]
    Tool { tool: String, error: String },

    /// The model call failed after retries and fallback
    #[error("Model call failed for agent '{agent}': {error}")]
    Model { agent: String, error: String },

    /// A node handler failed outside the categories above
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution { node: String, error: String },

    /// Checkpoint store failure; run is aborted, last checkpoint stays valid
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] xpert_checkpoint::CheckpointError),

    /// The run was cancelled through its abort signal
    #[error("Run aborted")]
    Aborted,

    /// Execution paused for human or client input; caught by the runner
    #[error("Run interrupted: {}", .0.kind)]
    Interrupt(Interrupt),

    /// State (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub fn node(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            error: error.into(),
        }
    }

    /// True for errors that must not be converted into a recoverable
    /// ToolMessage by the tool node.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt(_))
    }
}

fn recursion_limit_message(limit: usize, language: Option<&str>) -> String {
    match primary_tag(language) {
        "zh" => format!("已达到递归上限（{limit} 步），执行终止"),
        _ => format!("Recursion limit of {limit} steps reached"),
    }
}

fn timeout_message(operation: &str, duration_ms: u64, language: Option<&str>) -> String {
    match primary_tag(language) {
        "zh" => format!("操作 {operation} 超时（{duration_ms} 毫秒）"),
        _ => format!("Operation '{operation}' timed out after {duration_ms}ms"),
    }
}

fn primary_tag(language: Option<&str>) -> &str {
    language
        .map(|l| l.split(['-', '_']).next().unwrap_or("en"))
        .unwrap_or("en")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursion_message_is_localized() {
        let en = GraphError::RecursionLimit { limit: 4, language: None };
        assert!(en.to_string().contains("Recursion limit of 4"));

        let zh = GraphError::RecursionLimit {
            limit: 4,
            language: Some("zh-Hans".to_string()),
        };
        assert!(zh.to_string().contains("递归上限"));
    }

    #[test]
    fn timeout_message_includes_operation() {
        let err = GraphError::Timeout {
            operation: "tool:search".to_string(),
            duration_ms: 1500,
            language: None,
        };
        assert!(err.to_string().contains("tool:search"));
        assert!(err.to_string().contains("1500ms"));
    }
}
