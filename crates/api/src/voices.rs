// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Voice upload, inspection and deletion.
//!
//! - POST `/voices` - upload a sample, creating a `recorded` voice
//! - GET `/voices` - list the caller's voices
//! - GET `/voices/{id}` - inspect one voice
//! - DELETE `/voices/{id}` - delete the voice, its artifacts and its slot

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{Identity, parse_voice_id};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use talecast_store::{Provider, Voice};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/voices", post(create_voice).get(list_voices))
        .route("/voices/{id}", get(show_voice).delete(delete_voice))
}

#[derive(Deserialize)]
struct CreateVoiceRequest {
    name: String,
    provider: String,
    /// Base64-encoded audio sample.
    sample: String,
}

#[derive(Serialize)]
pub(crate) struct VoiceView {
    voice_id: String,
    name: String,
    provider: Provider,
    status: &'static str,
    sample_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

fn view(state: &AppState, voice: Voice) -> VoiceView {
    VoiceView {
        voice_id: voice.voice_id.to_string(),
        name: voice.name,
        provider: voice.provider,
        status: voice.allocation_status.as_str(),
        sample_bytes: voice.sample_bytes,
        queue_position: state.manager.queue_position(voice.voice_id),
        last_used_at: voice.last_used_at,
        error_message: voice.error_message,
        created_at: voice.created_at,
    }
}

async fn create_voice(
    State(state): State<AppState>,
    identity: Identity,
    body: Result<Json<CreateVoiceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<VoiceView>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.to_string()))?;
    let provider: Provider =
        request.provider.parse().map_err(|e: String| ApiError::bad_request(e))?;
    let sample = BASE64
        .decode(request.sample.as_bytes())
        .map_err(|e| ApiError::bad_request(format!("sample is not valid base64: {e}")))?;
    let voice = state
        .orchestrator
        .create_voice(&identity.user_id, &request.name, provider, sample)
        .await?;
    Ok((StatusCode::CREATED, Json(view(&state, voice))))
}

async fn list_voices(
    State(state): State<AppState>,
    identity: Identity,
) -> Json<Vec<VoiceView>> {
    let voices = state
        .orchestrator
        .list_voices(&identity.user_id)
        .into_iter()
        .map(|voice| view(&state, voice))
        .collect();
    Json(voices)
}

async fn show_voice(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<VoiceView>, ApiError> {
    let voice_id = parse_voice_id(&id)?;
    let voice = state.orchestrator.owned_voice(&identity.user_id, voice_id)?;
    Ok(Json(view(&state, voice)))
}

async fn delete_voice(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let voice_id = parse_voice_id(&id)?;
    state.orchestrator.delete_voice(&identity.user_id, voice_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
