//! REST handlers for the dashboard.
//!
//! When `[server] api_token` is set, every `/api/*` route requires
//! `Authorization: Bearer <token>`.

use super::AppState;
use crate::campaign::{self, NewCampaign};
use crate::validate::{self, Candidate};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;

// ── Bearer token auth ───────────────────────────────────────────

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let Some(ref expected) = state.config.server.api_token else {
        return Ok(());
    };

    let token = extract_bearer_token(headers).unwrap_or("");
    if token == expected {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Unauthorized — send Authorization: Bearer <token>"
            })),
        ))
    }
}

// ── Request bodies and query parameters ─────────────────────────

#[derive(Deserialize)]
pub struct CampaignCreateBody {
    pub name: String,
    pub message_template: String,
    pub instance: Option<String>,
    pub min_interval_minutes: Option<u32>,
    pub max_interval_minutes: Option<u32>,
}

#[derive(Deserialize)]
pub struct CandidateBody {
    pub business_name: String,
    pub phone: String,
}

#[derive(Deserialize)]
pub struct LeadsAddBody {
    pub candidates: Vec<CandidateBody>,
}

#[derive(Deserialize)]
pub struct ProspectBody {
    pub query: String,
    pub location: String,
    pub max_pages: Option<u32>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

// ── Campaign CRUD ───────────────────────────────────────────────

/// POST /api/campaigns — create a campaign (interval bounds validated here)
pub async fn handle_campaign_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CampaignCreateBody>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    let new = NewCampaign {
        name: body.name,
        message_template: body.message_template,
        instance: body
            .instance
            .unwrap_or_else(|| state.config.messaging.default_instance.clone()),
        min_interval_minutes: body
            .min_interval_minutes
            .unwrap_or(state.config.dispatch.min_interval_minutes),
        max_interval_minutes: body
            .max_interval_minutes
            .unwrap_or(state.config.dispatch.max_interval_minutes),
    };

    match campaign::create_campaign(&state.config, &new) {
        Ok(created) => (StatusCode::CREATED, Json(serde_json::json!({ "campaign": created })))
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("{e:#}")})),
        )
            .into_response(),
    }
}

/// GET /api/campaigns — list all campaigns
pub async fn handle_campaign_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match campaign::list_campaigns(&state.config) {
        Ok(campaigns) => Json(serde_json::json!({ "campaigns": campaigns })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

/// GET /api/campaigns/{id}
pub async fn handle_campaign_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match campaign::get_campaign(&state.config, &id) {
        Ok(found) => Json(serde_json::json!({ "campaign": found })).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("{e:#}")})),
        )
            .into_response(),
    }
}

/// DELETE /api/campaigns/{id} — operator action; a live run is
/// cancelled first so no stale timer outlives the record.
pub async fn handle_campaign_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    if state.engine.is_running(&id) {
        let outcome = state.engine.cancel(&id).await;
        if !outcome.success {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"error": outcome.message})),
            )
                .into_response();
        }
    }

    match campaign::delete_campaign(&state.config, &id) {
        Ok(()) => {
            state.engine.forget_progress(&id);
            Json(serde_json::json!({"status": "ok"})).into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("{e:#}")})),
        )
            .into_response(),
    }
}

// ── Leads and validation ────────────────────────────────────────

/// POST /api/campaigns/{id}/leads — run candidates through the
/// validation gate
pub async fn handle_leads_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<LeadsAddBody>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    let candidates: Vec<Candidate> = body
        .candidates
        .into_iter()
        .map(|c| Candidate {
            business_name: c.business_name,
            phone: c.phone,
        })
        .collect();

    match validate::validate_candidates(&state.config, state.gateway.as_ref(), &id, &candidates)
        .await
    {
        Ok(summary) => Json(serde_json::json!({ "validation": summary })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

/// GET /api/campaigns/{id}/leads
pub async fn handle_leads_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match campaign::list_leads(&state.config, &id) {
        Ok(leads) => Json(serde_json::json!({ "leads": leads })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

/// POST /api/campaigns/{id}/validate — re-check leads a previous run
/// left unverified
pub async fn handle_validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match validate::validate_pending(&state.config, state.gateway.as_ref(), &id).await {
        Ok(summary) => Json(serde_json::json!({ "validation": summary })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

/// POST /api/campaigns/{id}/prospect — directory search feeding the
/// validation gate
pub async fn handle_prospect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ProspectBody>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match crate::prospect::run_prospecting(
        &state.config,
        state.directory.as_ref(),
        state.gateway.as_ref(),
        &id,
        &body.query,
        &body.location,
        body.max_pages.unwrap_or(3),
    )
    .await
    {
        Ok(summary) => Json(serde_json::json!({ "prospecting": summary })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

// ── Dispatch control ────────────────────────────────────────────

/// POST /api/campaigns/{id}/dispatch/start
pub async fn handle_dispatch_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }
    Json(state.engine.start(&id).await).into_response()
}

/// POST /api/campaigns/{id}/dispatch/pause
pub async fn handle_dispatch_pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }
    Json(state.engine.pause(&id).await).into_response()
}

/// POST /api/campaigns/{id}/dispatch/resume
pub async fn handle_dispatch_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }
    Json(state.engine.resume(&id).await).into_response()
}

/// POST /api/campaigns/{id}/dispatch/cancel
pub async fn handle_dispatch_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }
    Json(state.engine.cancel(&id).await).into_response()
}

// ── Polling reads ───────────────────────────────────────────────

/// GET /api/campaigns/{id}/progress — the snapshot the UI polls
pub async fn handle_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match state.engine.progress(&id) {
        Some(snapshot) => Json(serde_json::json!({ "progress": snapshot })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Campaign '{id}' not found")})),
        )
            .into_response(),
    }
}

/// GET /api/campaigns/{id}/logs — message log history
pub async fn handle_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    if let Err(e) = require_auth(&state, &headers) {
        return e.into_response();
    }

    match campaign::list_message_logs(&state.config, &id, params.limit.unwrap_or(100)) {
        Ok(logs) => Json(serde_json::json!({ "logs": logs })).into_response(),
        Err(e) => internal_error(&e).into_response(),
    }
}

fn internal_error(e: &anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": format!("{e:#}")})),
    )
}
