//! Run endpoints: background creation, SSE streaming, wait-for-final
//!
//! The SSE transport frames every event as `data: {type, event, data}`,
//! emits a comment keep-alive every 30 seconds, and aborts the run when
//! the client goes away: dropping the response stream drops a guard that
//! fires the run's cancellation signal.

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, ThreadStatus};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use xpert_core::{
    CancelHandle, CancelToken, EventBus, MutePolicy, Run, RunInput, RunOutcome, RunStatus,
};

/// `POST /threads/:id/runs*` body (`RunCreateStateful`)
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub assistant_id: String,

    /// The chat request: human input, parameters, files, resume command
    #[serde(default)]
    pub input: RunInput,

    #[serde(default)]
    pub metadata: Value,

    /// Muted event tag paths
    #[serde(default)]
    pub mute: Vec<Vec<String>>,

    /// Unmute overrides
    #[serde(default)]
    pub unmute: Vec<Vec<String>>,
}

impl CreateRunRequest {
    fn mute_policy(&self) -> MutePolicy {
        MutePolicy {
            mute: self.mute.clone(),
            unmute: self.unmute.clone(),
        }
    }
}

fn settle_thread(state: &AppState, thread_id: &str, result: &Result<RunOutcome, xpert_core::GraphError>) {
    let status = match result {
        Ok(outcome) if outcome.run.status == RunStatus::Interrupted => ThreadStatus::Interrupted,
        _ => ThreadStatus::Open,
    };
    state.threads.set_status(thread_id, status);
}

/// Create a background run; responds with the Run row immediately
pub async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<Json<Run>> {
    state.threads.get(&thread_id)?;
    let runner = state.runner_for(&req.assistant_id).await?;
    let run = runner.prepare_run(&thread_id, &req.input).map_err(ApiError::from)?;

    let response = run.clone();
    let background_state = state.clone();
    tokio::spawn(async move {
        let result = runner
            .run_prepared(run, req.input, EventBus::sink(), CancelToken::never())
            .await;
        settle_thread(&background_state, &thread_id, &result);
        if let Err(error) = result {
            tracing::warn!(%error, %thread_id, "background run failed");
        }
    });
    Ok(Json(response))
}

/// Create a run and await its final text
pub async fn wait_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<Json<Value>> {
    state.threads.get(&thread_id)?;
    let runner = state.runner_for(&req.assistant_id).await?;
    let result = runner
        .run(&thread_id, req.input, EventBus::sink(), CancelToken::never())
        .await;
    settle_thread(&state, &thread_id, &result);
    let outcome = result.map_err(ApiError::from)?;
    let content = match outcome.output {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(Json(serde_json::json!({"role": "ai", "content": content})))
}

/// Cancels the run when the SSE response stream is dropped
struct DisconnectGuard {
    handle: CancelHandle,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("sse client disconnected, aborting run");
            self.handle.cancel();
        }
    }
}

fn frame(event: &xpert_core::AgentEvent) -> Event {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("type".to_string(), serde_json::json!("event"));
    }
    Event::default().data(value.to_string())
}

/// Create a run and stream its events as SSE
pub async fn stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.threads.get(&thread_id)?;
    let runner = Arc::new(state.runner_for(&req.assistant_id).await?);
    let run = runner.prepare_run(&thread_id, &req.input).map_err(ApiError::from)?;

    let (bus, mut rx) = EventBus::channel(req.mute_policy());
    let (handle, token) = xpert_core::cancel_pair();

    let task_state = state.clone();
    let task_thread = thread_id.clone();
    let task_runner = runner.clone();
    let input = req.input;
    tokio::spawn(async move {
        let result = task_runner.run_prepared(run, input, bus, token).await;
        settle_thread(&task_state, &task_thread, &result);
        if let Err(error) = result {
            tracing::debug!(%error, "streamed run finished with error");
        }
    });

    let stream = async_stream::stream! {
        let mut guard = DisconnectGuard { handle, finished: false };
        while let Some(event) = rx.recv().await {
            yield Ok(frame(&event));
        }
        // All senders dropped: the run is finished, nothing to abort.
        guard.finished = true;
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    ))
}

/// Fetch one run's status
pub async fn get_run(
    State(state): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> ApiResult<Json<Run>> {
    state.threads.get(&thread_id)?;
    let run = state
        .services
        .runs
        .get(&run_id)
        .ok_or_else(|| ApiError::NotFound(format!("run '{run_id}'")))?;
    if run.thread_id != thread_id {
        return Err(ApiError::NotFound(format!(
            "run '{run_id}' does not belong to thread '{thread_id}'"
        )));
    }
    Ok(Json(run))
}
