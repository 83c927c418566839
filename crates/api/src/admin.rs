// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Admin surface: grants, pool status, and force beats.
//!
//! - POST `/admin/users/{user}/credits/grant`
//! - GET `/admin/voice-slots/status`
//! - POST `/admin/voice-slots/process-queue`
//! - POST `/admin/credits/expire`
//!
//! All routes require the `X-Admin-Token` shared secret.

use crate::AppState;
use crate::error::ApiError;
use crate::extract::Admin;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use talecast_engine::Task;
use talecast_slots::PoolStatus;
use talecast_store::{CreditLot, CreditSource, Provider, UserId};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users/{user}/credits/grant", post(grant))
        .route("/admin/voice-slots/status", get(slot_status))
        .route("/admin/voice-slots/process-queue", post(force_process_queue))
        .route("/admin/credits/expire", post(force_expire))
}

#[derive(Deserialize)]
struct GrantRequest {
    amount: i64,
    source: String,
    expires_at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

async fn grant(
    State(state): State<AppState>,
    _admin: Admin,
    Path(user): Path<String>,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Json<CreditLot>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.to_string()))?;
    let source: CreditSource =
        request.source.parse().map_err(|e: String| ApiError::bad_request(e))?;
    let user_id = UserId::from(user.as_str());
    let lot = state.ledger.grant(
        &user_id,
        request.amount,
        source,
        request.expires_at,
        request.reason.as_deref().unwrap_or("admin_grant"),
        serde_json::Value::Null,
    )?;
    Ok(Json(lot))
}

async fn slot_status(State(state): State<AppState>, _admin: Admin) -> Json<Vec<PoolStatus>> {
    Json(state.manager.pool_status())
}

async fn force_process_queue(
    State(state): State<AppState>,
    _admin: Admin,
) -> (StatusCode, Json<serde_json::Value>) {
    for provider in Provider::ALL {
        state.tasks.dispatch(Task::ProcessQueue { provider });
    }
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" })))
}

async fn force_expire(
    State(state): State<AppState>,
    _admin: Admin,
) -> (StatusCode, Json<serde_json::Value>) {
    state.tasks.dispatch(Task::ExpireLots);
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" })))
}
