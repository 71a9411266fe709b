//! HTTP surface: minimal read/command endpoints over the orchestrator.
//!
//! - `POST /v1/sessions {target_card_id}` → `{session_id}`
//! - `GET  /v1/sessions/:id` → session snapshot
//! - `POST /v1/sessions/:id/cancel`
//! - `GET  /v1/cards/:id`, `GET /v1/cards?status=…`
//! - `GET  /health`
//! - `POST /v1/webhooks/gitea` (HMAC-signed intake)

pub mod webhook;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use ork_domain::card::CardStatus;
use ork_engine::TractionOpts;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/cancel", post(cancel_session))
        .route("/v1/cards", get(list_cards))
        .route("/v1/cards/:id", get(get_card))
        .route("/v1/webhooks/gitea", post(webhook::gitea))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active_count(),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct CreateSessionRequest {
    target_card_id: String,
    #[serde(default)]
    max_turns: Option<u32>,
}

/// Idempotent on the target: re-posting a target with an active session
/// returns that session's id instead of erroring.
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if let Some(existing) = state.registry.session_for_target(&req.target_card_id) {
        return Json(serde_json::json!({ "session_id": existing })).into_response();
    }

    let prepared = match state.traction.prepare(&req.target_card_id) {
        Ok(p) => p,
        Err(ork_domain::error::Error::CardNotFound(id)) => {
            return api_error(StatusCode::NOT_FOUND, format!("card not found: {id}"));
        }
        Err(ork_domain::error::Error::SessionActive(target)) => {
            // Raced another create; surface the winner.
            let existing = state.registry.session_for_target(&target).unwrap_or_default();
            return Json(serde_json::json!({ "session_id": existing })).into_response();
        }
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let session_id = prepared.session_id.clone();
    let traction = state.traction.clone();
    let opts = TractionOpts {
        max_turns: req.max_turns,
        dry_run: false,
    };
    tokio::spawn(async move {
        if let Err(e) = traction.run_prepared(prepared, &opts).await {
            tracing::error!(error = %e, "session run failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "session_id": session_id })),
    )
        .into_response()
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.ledger.snapshot(&id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("session not found: {id}")),
    }
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.registry.cancel_session(&id) {
        (StatusCode::ACCEPTED, Json(serde_json::json!({"cancelled": id}))).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, format!("no active session: {id}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct CardFilter {
    status: Option<String>,
}

async fn list_cards(
    State(state): State<AppState>,
    Query(filter): Query<CardFilter>,
) -> Response {
    let cards = match filter.status.as_deref() {
        Some(raw) => {
            let status = match CardStatus::parse(raw) {
                Ok(s) => s,
                Err(_) => {
                    return api_error(
                        StatusCode::BAD_REQUEST,
                        format!("unknown status '{raw}'"),
                    )
                }
            };
            state.store.list_by_status(status)
        }
        None => state.store.list_all(),
    };
    match cards {
        Ok(cards) => Json(cards).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_card(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_card(&id) {
        Ok(card) => Json(card).into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("card not found: {id}")),
    }
}
