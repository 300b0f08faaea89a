//! Axum HTTP API for the dashboard.
//!
//! Control operations (start/pause/resume/cancel) and polling reads
//! (progress, logs) over JSON, with request body limits and timeouts.

pub mod api;

use crate::config::Config;
use crate::directory::DirectorySearch;
use crate::dispatch::DispatchEngine;
use crate::messaging::MessagingGateway;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

/// Maximum request body size (256KB) — lead imports are the largest payload
pub const MAX_BODY_SIZE: usize = 262_144;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<DispatchEngine>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub directory: Arc<dyn DirectorySearch>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/campaigns", post(api::handle_campaign_create))
        .route("/api/campaigns", get(api::handle_campaign_list))
        .route("/api/campaigns/{id}", get(api::handle_campaign_get))
        .route("/api/campaigns/{id}", delete(api::handle_campaign_delete))
        .route("/api/campaigns/{id}/leads", post(api::handle_leads_add))
        .route("/api/campaigns/{id}/leads", get(api::handle_leads_list))
        .route("/api/campaigns/{id}/validate", post(api::handle_validate))
        .route("/api/campaigns/{id}/prospect", post(api::handle_prospect))
        .route(
            "/api/campaigns/{id}/dispatch/start",
            post(api::handle_dispatch_start),
        )
        .route(
            "/api/campaigns/{id}/dispatch/pause",
            post(api::handle_dispatch_pause),
        )
        .route(
            "/api/campaigns/{id}/dispatch/resume",
            post(api::handle_dispatch_resume),
        )
        .route(
            "/api/campaigns/{id}/dispatch/cancel",
            post(api::handle_dispatch_cancel),
        )
        .route("/api/campaigns/{id}/progress", get(api::handle_progress))
        .route("/api/campaigns/{id}/logs", get(api::handle_logs))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
}

/// Run the dashboard API until the process is stopped.
pub async fn run_server(
    config: Config,
    engine: Arc<DispatchEngine>,
    gateway: Arc<dyn MessagingGateway>,
    directory: Arc<dyn DirectorySearch>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual = listener.local_addr()?;

    let state = AppState {
        config,
        engine,
        gateway,
        directory,
    };
    let app = build_router(state);

    crate::health::mark_component_ok("server");
    info!("Dashboard API listening on http://{actual}");

    axum::serve(listener, app.into_make_service())
        .await
        .context("Server terminated")?;
    Ok(())
}

/// GET /health — always public (no secrets leaked)
async fn handle_health(State(_state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "runtime": crate::health::snapshot_json(),
    });
    (StatusCode::OK, Json(body))
}
