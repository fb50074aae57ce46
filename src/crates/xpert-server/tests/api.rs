//! Endpoint contract tests driven through `tower::ServiceExt::oneshot`

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use xpert_core::{Xpert, XpertAgent};
use xpert_server::config::ServerConfig;
use xpert_server::plugins::build_compile_context;
use xpert_server::state::AppState;

fn test_state(api_keys: Vec<String>) -> AppState {
    let config = ServerConfig {
        api_keys,
        ..ServerConfig::default()
    };
    let state = AppState::new(config, build_compile_context(&["mock".to_string()]));
    state.assistants.register(Arc::new(Xpert::single_agent(
        XpertAgent::new("assistant", "You are a helpful assistant."),
    )));
    state
}

fn app() -> Router {
    xpert_server::create_router(test_state(vec![]))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_thread_echoes_id() {
    let app = app();
    let response = app
        .oneshot(post_json(
            "/threads",
            json!({"thread_id": "t-1", "metadata": {"user": "a"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["thread_id"], "t-1");
    assert_eq!(body["status"], "open");
}

#[tokio::test]
async fn duplicate_thread_conflicts_unless_do_nothing() {
    let app = app();
    let first = app
        .clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let conflict = app
        .clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    let idempotent = app
        .oneshot(post_json(
            "/threads",
            json!({"thread_id": "t-1", "if_exists": "do_nothing"}),
        ))
        .await
        .unwrap();
    assert_eq!(idempotent.status(), StatusCode::OK);
}

#[tokio::test]
async fn thread_search_filters_by_metadata() {
    let app = app();
    app.clone()
        .oneshot(post_json(
            "/threads",
            json!({"thread_id": "t-1", "metadata": {"app": "x"}}),
        ))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/threads",
            json!({"thread_id": "t-2", "metadata": {"app": "y"}}),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json("/threads/search", json!({"metadata": {"app": "x"}})))
        .await
        .unwrap();
    let body = body_json(response).await;
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["thread_id"], "t-1");
}

#[tokio::test]
async fn delete_thread_is_accepted() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/threads/t-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn wait_run_returns_final_text() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();

    // The mock model echoes the human input.
    let response = app
        .oneshot(post_json(
            "/threads/t-1/runs/wait",
            json!({
                "assistant_id": "xpert-assistant",
                "input": {"input": "hello runtime"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["role"], "ai");
    assert_eq!(body["content"], "hello runtime");
}

#[tokio::test]
async fn thread_state_reflects_completed_run() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();
    app.clone()
        .oneshot(post_json(
            "/threads/t-1/runs/wait",
            json!({"assistant_id": "xpert-assistant", "input": {"input": "hi"}}),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/threads/t-1/state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["checkpoint"]["checkpoint_id"].is_string());
    let messages = body["values"]["messages"].as_array().unwrap();
    assert!(messages.len() >= 2);
    assert_eq!(messages.last().unwrap()["role"], "assistant");
}

#[tokio::test]
async fn background_run_returns_run_row() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/threads/t-1/runs",
            json!({"assistant_id": "xpert-assistant", "input": {"input": "hi"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let run_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["thread_id"], "t-1");
    assert_eq!(body["status"], "RUNNING");

    // The run is retrievable by id.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/threads/t-1/runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn stream_run_is_server_sent_events() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/threads/t-1/runs/stream",
            json!({"assistant_id": "xpert-assistant", "input": {"input": "hi"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("on_run_start"));
    assert!(text.contains("on_run_end"));
    // Frames carry the {type, event, data} envelope.
    assert!(text.contains("\"type\":\"event\""));
}

#[tokio::test]
async fn store_items_roundtrip() {
    let app = app();
    let put = Request::builder()
        .method("PUT")
        .uri("/store/items")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"namespace": ["memories", "u1"], "key": "likes", "value": {"coffee": true}})
                .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(put).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/store/items?namespace=memories.u1&key=likes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["value"]["coffee"], true);

    let response = app
        .oneshot(post_json(
            "/store/items/search",
            json!({"namespace_prefix": ["memories"]}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn auth_rejects_missing_credentials() {
    let app = xpert_server::create_router(test_state(vec!["secret-key".to_string()]));

    let denied = app
        .clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/threads")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-api-key", "secret-key")
                .body(Body::from(json!({"thread_id": "t-1"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn client_secret_flow() {
    let app = xpert_server::create_router(test_state(vec!["secret-key".to_string()]));

    // Sessions are issued with an API key.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chatkit/sessions")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer secret-key")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let secret = body["client_secret"].as_str().unwrap().to_string();
    assert!(secret.starts_with("cs-x-"));

    // The secret authenticates subsequent calls.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/threads")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-client-secret", &secret)
                .body(Body::from(json!({"thread_id": "t-1"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn assistants_are_searchable() {
    let app = app();
    let response = app
        .clone()
        .oneshot(post_json("/assistants/search", json!({})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["graph_id"], "assistant");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/assistants/xpert-assistant")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_assistant_is_bad_request_or_not_found() {
    let app = app();
    app.clone()
        .oneshot(post_json("/threads", json!({"thread_id": "t-1"})))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/threads/t-1/runs/wait",
            json!({"assistant_id": "ghost", "input": {"input": "hi"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
