//! Interrupts and the resume manager
//!
//! Hooks and tool wrappers pause a run by raising an [`Interrupt`] (wrapped
//! in `GraphError::Interrupt`); the runner persists a checkpoint, stores an
//! [`InterruptRecord`] and finishes the run as `INTERRUPTED`. A later run
//! on the same thread carrying a resume `Command` consumes the record
//! (exactly once), and validation of the typed resume payload happens here.

use crate::messages::{Message, ToolCall};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of input the interrupt is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// Human review of tool calls (approve / edit / reject)
    Hitl,
    /// A tool executed by the calling client
    ClientTool,
    /// Confirmation gate before a sensitive node
    Confirm,
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hitl => "hitl",
            Self::ClientTool => "client_tool",
            Self::Confirm => "confirm",
        };
        f.write_str(s)
    }
}

/// The pause payload raised from inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    pub kind: InterruptKind,

    /// Structured payload shown to the reviewer / client
    pub payload: Value,

    /// Tool calls awaiting a decision or a client-side result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tool_calls: Vec<ToolCall>,
}

impl Interrupt {
    pub fn new(kind: InterruptKind, payload: Value, pending_tool_calls: Vec<ToolCall>) -> Self {
        Self {
            kind,
            payload,
            pending_tool_calls,
        }
    }
}

/// One tool call presented for human review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Decisions a reviewer may take on a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecisionKind {
    Approve,
    Edit,
    Reject,
}

/// Review surface for one intercepted tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewConfig {
    pub allowed_decisions: Vec<ReviewDecisionKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_schema: Option<Value>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            allowed_decisions: vec![
                ReviewDecisionKind::Approve,
                ReviewDecisionKind::Edit,
                ReviewDecisionKind::Reject,
            ],
            args_schema: None,
        }
    }
}

/// A reviewer's decision on one intercepted tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HitlDecision {
    /// Keep the call unchanged
    Approve,
    /// Replace name and args, keeping the original call id
    Edit { name: String, args: Value },
    /// Drop the call; the optional message becomes the error ToolMessage
    Reject {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl HitlDecision {
    pub fn kind(&self) -> ReviewDecisionKind {
        match self {
            Self::Approve => ReviewDecisionKind::Approve,
            Self::Edit { .. } => ReviewDecisionKind::Edit,
            Self::Reject { .. } => ReviewDecisionKind::Reject,
        }
    }
}

/// Resume payload for a HITL interrupt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlResume {
    pub decisions: Vec<HitlDecision>,
}

/// Resume payload answering a client-tool interrupt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientToolResponse {
    pub tool_messages: Vec<Message>,
}

/// A stored pending interrupt, consumed exactly once by a resume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub thread_id: String,
    pub run_id: String,
    /// Node to re-enter on resume; nested sub-agent nodes joined with '/'
    pub node: String,
    /// Per-level node payloads matching the segments of `node`
    #[serde(default)]
    pub node_payloads: Vec<Option<Value>>,
    pub kind: InterruptKind,
    pub payload: Value,
    #[serde(default)]
    pub pending_tool_calls: Vec<ToolCall>,
}

/// Pending interrupts keyed by thread
///
/// One pending interrupt per thread at a time: a run either completes or
/// leaves exactly one interrupt behind.
#[derive(Debug, Default)]
pub struct InterruptManager {
    records: DashMap<String, InterruptRecord>,
}

impl InterruptManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: InterruptRecord) {
        self.records.insert(record.thread_id.clone(), record);
    }

    /// Inspect without consuming
    pub fn peek(&self, thread_id: &str) -> Option<InterruptRecord> {
        self.records.get(thread_id).map(|r| r.clone())
    }

    /// Consume the pending interrupt for a thread
    pub fn take(&self, thread_id: &str) -> Option<InterruptRecord> {
        self.records.remove(thread_id).map(|(_, r)| r)
    }
}
