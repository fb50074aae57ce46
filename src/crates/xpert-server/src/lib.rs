//! HTTP surface for the xpertgraph runtime
//!
//! Routes follow the thread/run resource model: a thread is created once,
//! then runs execute against it in the background, over SSE, or awaited
//! inline. Assistants, the KV store and chatkit session issuance round out
//! the surface. All routes sit behind the auth middleware; auth is
//! disabled when no API keys are configured.

pub mod assistants;
pub mod auth;
pub mod config;
pub mod error;
pub mod plugins;
pub mod runs;
pub mod state;
pub mod store_api;
pub mod threads;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use state::AppState;

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Threads
        .route("/threads", post(threads::create_thread))
        .route("/threads/search", post(threads::search_threads))
        .route(
            "/threads/:thread_id",
            get(threads::get_thread).delete(threads::delete_thread),
        )
        .route("/threads/:thread_id/state", get(threads::get_thread_state))
        // Runs
        .route("/threads/:thread_id/runs", post(runs::create_run))
        .route("/threads/:thread_id/runs/stream", post(runs::stream_run))
        .route("/threads/:thread_id/runs/wait", post(runs::wait_run))
        .route("/threads/:thread_id/runs/:run_id", get(runs::get_run))
        // Assistants
        .route("/assistants/search", post(assistants::search_assistants))
        .route("/assistants/:assistant_id", get(assistants::get_assistant))
        // Memory store
        .route(
            "/store/items",
            put(store_api::put_item)
                .get(store_api::get_item)
                .delete(store_api::delete_item),
        )
        .route("/store/items/search", post(store_api::search_items))
        // Sessions
        .route("/chatkit/sessions", post(auth::create_chatkit_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .with_state(state)
}
