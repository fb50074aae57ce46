//! Shared application state: threads, assistants and runtime services

use crate::auth::AuthService;
use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use xpert_checkpoint::InMemoryCheckpointSaver;
use xpert_core::{
    compile, CompileContext, CompiledGraph, ExecutionLedger, GraphRunner, InMemoryStore,
    InterruptManager, RunOptions, RunStore, RunnerServices, Xpert,
};

/// Thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Open,
    Interrupted,
    Closed,
}

/// A conversation identity owning runs and checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub status: ThreadStatus,

    #[serde(default)]
    pub metadata: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory thread registry
#[derive(Debug, Default)]
pub struct ThreadService {
    threads: DashMap<String, Thread>,
}

impl ThreadService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a thread; `raise` conflicts on duplicates, `do_nothing`
    /// makes creation idempotent
    pub fn create(
        &self,
        thread_id: Option<String>,
        metadata: Value,
        if_exists_do_nothing: bool,
    ) -> ApiResult<Thread> {
        let thread_id = thread_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = self.threads.get(&thread_id) {
            if if_exists_do_nothing {
                return Ok(existing.clone());
            }
            return Err(ApiError::Conflict(format!(
                "thread '{thread_id}' already exists"
            )));
        }
        let now = Utc::now();
        let thread = Thread {
            thread_id: thread_id.clone(),
            status: ThreadStatus::Open,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.threads.insert(thread_id, thread.clone());
        Ok(thread)
    }

    pub fn get(&self, thread_id: &str) -> ApiResult<Thread> {
        self.threads
            .get(thread_id)
            .map(|t| t.clone())
            .ok_or_else(|| ApiError::NotFound(format!("thread '{thread_id}'")))
    }

    pub fn set_status(&self, thread_id: &str, status: ThreadStatus) {
        if let Some(mut thread) = self.threads.get_mut(thread_id) {
            thread.status = status;
            thread.updated_at = Utc::now();
        }
    }

    pub fn remove(&self, thread_id: &str) {
        self.threads.remove(thread_id);
    }

    /// Metadata filter: server-side AND over all given conditions
    pub fn search(&self, conditions: &Value) -> Vec<Thread> {
        let conditions = conditions.as_object().cloned().unwrap_or_default();
        let mut matches: Vec<Thread> = self
            .threads
            .iter()
            .filter(|entry| {
                conditions
                    .iter()
                    .all(|(key, expected)| entry.metadata.get(key) == Some(expected))
            })
            .map(|entry| entry.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches
    }
}

/// Registered assistants, by id
#[derive(Default)]
pub struct AssistantRegistry {
    assistants: DashMap<String, Arc<Xpert>>,
}

impl AssistantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, xpert: Arc<Xpert>) {
        self.assistants.insert(xpert.id.clone(), xpert);
    }

    pub fn get(&self, id: &str) -> ApiResult<Arc<Xpert>> {
        self.assistants
            .get(id)
            .map(|x| x.clone())
            .ok_or_else(|| ApiError::NotFound(format!("assistant '{id}'")))
    }

    /// Filter by slug (graph id) and/or metadata conditions
    pub fn search(&self, graph_id: Option<&str>, metadata: &Value) -> Vec<Arc<Xpert>> {
        let conditions = metadata.as_object().cloned().unwrap_or_default();
        self.assistants
            .iter()
            .filter(|entry| graph_id.map(|g| entry.slug == g).unwrap_or(true))
            .filter(|entry| {
                conditions
                    .iter()
                    .all(|(key, expected)| entry.metadata.get(key) == Some(expected))
            })
            .map(|entry| entry.clone())
            .collect()
    }
}

/// Everything handlers need
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub threads: Arc<ThreadService>,
    pub assistants: Arc<AssistantRegistry>,
    pub services: RunnerServices,
    pub compile_ctx: Arc<CompileContext>,
    pub auth: Arc<AuthService>,
    pub run_options: RunOptions,
}

impl AppState {
    /// Assemble state from config plus the plugin-built compile context
    pub fn new(config: ServerConfig, compile_ctx: CompileContext) -> Self {
        let auth = Arc::new(AuthService::new(config.api_keys.clone()));
        Self {
            config: Arc::new(config),
            threads: Arc::new(ThreadService::new()),
            assistants: Arc::new(AssistantRegistry::new()),
            services: RunnerServices {
                checkpointer: Arc::new(InMemoryCheckpointSaver::new()),
                ledger: Arc::new(ExecutionLedger::new()),
                runs: Arc::new(RunStore::new()),
                interrupts: Arc::new(InterruptManager::new()),
                store: Some(Arc::new(InMemoryStore::new())),
            },
            compile_ctx: Arc::new(compile_ctx),
            auth,
            run_options: RunOptions::default(),
        }
    }

    /// Compile an assistant's graph and wrap it in a runner
    pub async fn runner_for(&self, assistant_id: &str) -> ApiResult<GraphRunner> {
        let xpert = self.assistants.get(assistant_id)?;
        let entry = xpert
            .first_agent()
            .ok_or_else(|| ApiError::BadRequest(format!("assistant '{assistant_id}' has no agents")))?
            .key
            .clone();
        let graph: Arc<CompiledGraph> = compile(xpert, &entry, self.compile_ctx.clone()).await?;
        Ok(GraphRunner::new(
            graph,
            self.services.clone(),
            self.run_options.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_create_is_idempotent_with_do_nothing() {
        let threads = ThreadService::new();
        let first = threads
            .create(Some("t1".into()), json!({"user": "a"}), false)
            .unwrap();
        let again = threads
            .create(Some("t1".into()), json!({}), true)
            .unwrap();
        assert_eq!(first.created_at, again.created_at);
        assert_eq!(again.metadata, json!({"user": "a"}));

        let err = threads.create(Some("t1".into()), json!({}), false).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn thread_search_is_metadata_and() {
        let threads = ThreadService::new();
        threads
            .create(Some("t1".into()), json!({"user": "a", "app": "x"}), false)
            .unwrap();
        threads
            .create(Some("t2".into()), json!({"user": "a", "app": "y"}), false)
            .unwrap();

        let hits = threads.search(&json!({"user": "a", "app": "x"}));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].thread_id, "t1");

        let all = threads.search(&json!({}));
        assert_eq!(all.len(), 2);
    }
}
