//! Runs and the agent execution ledger
//!
//! A [`Run`] is one invocation of a compiled graph against a thread. Every
//! agent step inside it (the model call of an agent, the entry of a
//! sub-agent, a workflow tool invocation) opens an [`ExecutionRow`] and
//! closes it with elapsed time, status, outputs and checkpoint linkage.
//! Parent/child rows mirror the graph; a tool turn records the calling
//! agent as its `predecessor` so the ledger stays acyclic even though the
//! execution graph is not. Rows are append-only: closing fills fields in,
//! nothing is ever deleted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a run or execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Interrupted,
    Aborted,
}

/// One invocation of a compiled graph against a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub checkpoint_ns: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,

    /// Parent run for sub-runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Calling agent key for tool/sub-agent runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,

    pub status: RunStatus,
    pub inputs: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Provider, model and usage metadata
    pub metadata: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(thread_id: impl Into<String>, inputs: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            parent_id: None,
            predecessor: None,
            status: RunStatus::Running,
            inputs,
            outputs: None,
            elapsed_ms: None,
            error: None,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-memory run registry
#[derive(Debug, Default)]
pub struct RunStore {
    runs: DashMap<String, Run>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: Run) {
        self.runs.insert(run.id.clone(), run);
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// Update a run in place; at most one durable update per node transition
    pub fn update<F: FnOnce(&mut Run)>(&self, run_id: &str, apply: F) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            apply(&mut run);
            run.updated_at = Utc::now();
        }
    }

    pub fn list_by_thread(&self, thread_id: &str) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|r| r.thread_id == thread_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }
}

/// One agent step recorded in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: String,
    pub run_id: String,
    pub thread_id: String,
    pub agent_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<String>,

    pub status: RunStatus,
    pub inputs: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,

    pub checkpoint_ns: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Provider, model, token usage
    pub metadata: Value,
}

/// Fields supplied when closing an execution row
#[derive(Debug, Clone, Default)]
pub struct ExecutionClose {
    pub status: Option<RunStatus>,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub checkpoint_id: Option<String>,
    pub metadata: Option<Value>,
}

/// Append-only record of agent steps
#[derive(Debug, Default)]
pub struct ExecutionLedger {
    rows: RwLock<Vec<ExecutionRow>>,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a row at the start of an agent step; returns its id
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        run_id: &str,
        thread_id: &str,
        agent_key: &str,
        checkpoint_ns: &str,
        parent_id: Option<String>,
        predecessor: Option<String>,
        inputs: Value,
    ) -> String {
        let row = ExecutionRow {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            agent_key: agent_key.to_string(),
            parent_id,
            predecessor,
            status: RunStatus::Running,
            inputs,
            outputs: None,
            error: None,
            checkpoint_id: None,
            checkpoint_ns: checkpoint_ns.to_string(),
            elapsed_ms: None,
            started_at: Utc::now(),
            finished_at: None,
            metadata: Value::Object(Default::default()),
        };
        let id = row.id.clone();
        self.rows.write().push(row);
        id
    }

    /// Close a row, recording elapsed time and outcome
    pub fn close(&self, execution_id: &str, close: ExecutionClose) -> Option<ExecutionRow> {
        let mut rows = self.rows.write();
        let row = rows.iter_mut().find(|r| r.id == execution_id)?;
        let finished = Utc::now();
        row.finished_at = Some(finished);
        row.elapsed_ms = Some(
            (finished - row.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        if let Some(status) = close.status {
            row.status = status;
        }
        if close.outputs.is_some() {
            row.outputs = close.outputs;
        }
        if close.error.is_some() {
            row.error = close.error;
        }
        if close.checkpoint_id.is_some() {
            row.checkpoint_id = close.checkpoint_id;
        }
        if let Some(metadata) = close.metadata {
            row.metadata = metadata;
        }
        Some(row.clone())
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionRow> {
        self.rows.read().iter().find(|r| r.id == execution_id).cloned()
    }

    pub fn by_run(&self, run_id: &str) -> Vec<ExecutionRow> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn children_of(&self, execution_id: &str) -> Vec<ExecutionRow> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.parent_id.as_deref() == Some(execution_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}
