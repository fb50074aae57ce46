//! Thread endpoints: create, search, fetch, delete, state snapshot

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Thread};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use xpert_checkpoint::{CheckpointSaver, ROOT_NS};

/// `POST /threads` body
#[derive(Debug, Deserialize)]
pub struct CreateThreadRequest {
    #[serde(default)]
    pub thread_id: Option<String>,

    #[serde(default)]
    pub metadata: Value,

    /// `raise` (default) conflicts on duplicates; `do_nothing` is idempotent
    #[serde(default = "default_if_exists")]
    pub if_exists: String,
}

fn default_if_exists() -> String {
    "raise".to_string()
}

pub async fn create_thread(
    State(state): State<AppState>,
    Json(req): Json<CreateThreadRequest>,
) -> ApiResult<Json<Thread>> {
    let do_nothing = match req.if_exists.as_str() {
        "raise" => false,
        "do_nothing" => true,
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid if_exists value '{other}'"
            )))
        }
    };
    let thread = state.threads.create(req.thread_id, req.metadata, do_nothing)?;
    tracing::info!(thread_id = %thread.thread_id, "thread created");
    Ok(Json(thread))
}

/// `POST /threads/search` body
#[derive(Debug, Default, Deserialize)]
pub struct SearchThreadsRequest {
    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn search_threads(
    State(state): State<AppState>,
    Json(req): Json<SearchThreadsRequest>,
) -> ApiResult<Json<Vec<Thread>>> {
    let mut threads = state.threads.search(&req.metadata);
    if let Some(limit) = req.limit {
        threads.truncate(limit);
    }
    Ok(Json(threads))
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Thread>> {
    Ok(Json(state.threads.get(&thread_id)?))
}

/// Delete is accepted and performed asynchronously
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.threads.get(&thread_id)?;
    let checkpointer = state.services.checkpointer.clone();
    let threads = state.threads.clone();
    tokio::spawn(async move {
        if let Err(error) = checkpointer.delete_thread(&thread_id).await {
            tracing::warn!(%error, %thread_id, "checkpoint cleanup failed");
        }
        threads.remove(&thread_id);
    });
    Ok(StatusCode::ACCEPTED)
}

/// `GET /threads/:id/state` query
#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

/// State snapshot response
#[derive(Debug, Serialize)]
pub struct ThreadStateResponse {
    pub values: Value,
    pub checkpoint: Value,
    pub parent_checkpoint: Option<Value>,
    pub metadata: Value,
    pub created_at: Value,
}

pub async fn get_thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<StateQuery>,
) -> ApiResult<Json<ThreadStateResponse>> {
    state.threads.get(&thread_id)?;
    let tuple = state
        .services
        .checkpointer
        .get_tuple(&thread_id, ROOT_NS, query.checkpoint_id.as_deref())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no checkpoint for thread '{thread_id}'")))?;

    Ok(Json(ThreadStateResponse {
        values: serde_json::to_value(&tuple.checkpoint.values)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        checkpoint: serde_json::json!({
            "checkpoint_id": tuple.checkpoint.id,
            "checkpoint_ns": tuple.checkpoint.ns,
            "thread_id": tuple.checkpoint.thread_id,
        }),
        parent_checkpoint: tuple.parent.map(|p| {
            serde_json::json!({
                "checkpoint_id": p.id,
                "checkpoint_ns": p.ns,
                "thread_id": p.thread_id,
            })
        }),
        metadata: serde_json::to_value(&tuple.metadata)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
        created_at: serde_json::json!(tuple.checkpoint.ts),
    }))
}
