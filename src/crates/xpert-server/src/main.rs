//! xpert-server binary: env config, tracing, CORS, serve

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use xpert_core::{Xpert, XpertAgent};
use xpert_server::config::ServerConfig;
use xpert_server::plugins::build_compile_context;
use xpert_server::state::AppState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.tracing_filter())),
        )
        .init();

    tracing::info!(port = config.port, plugins = ?config.plugins, "starting xpert-server");

    let compile_ctx = build_compile_context(&config.plugins);
    let state = AppState::new(config.clone(), compile_ctx);

    // A default single-agent assistant so a fresh server is usable.
    state.assistants.register(Arc::new(Xpert::single_agent(
        XpertAgent::new("assistant", "You are a helpful assistant."),
    )));

    let app = xpert_server::create_router(state)
        .layer(cors_layer(&config.cors_allow_origins))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
