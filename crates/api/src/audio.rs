// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Synthesis start and artifact retrieval.
//!
//! - POST `/voices/{voice}/stories/{story}/audio` - start (or poll) synthesis
//! - GET `/voices/{voice}/stories/{story}/audio` - fetch the finished audio
//!
//! Queue progress rides on `X-Voice-Queue-Position` / `X-Voice-Queue-Length`;
//! a ready response carries `X-Voice-Remote-ID`. Artifact fetches honor a
//! single `Range: bytes=` header (206/416); the full body answers 200.

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{Identity, parse_story_id, parse_voice_id};
use axum::extract::{Path, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use talecast_engine::{ArtifactContent, StartOutcome};
use talecast_store::JobId;

/// Queue rank of the voice behind this job.
pub const QUEUE_POSITION_HEADER: HeaderName = HeaderName::from_static("x-voice-queue-position");
/// Length of the provider queue at response time.
pub const QUEUE_LENGTH_HEADER: HeaderName = HeaderName::from_static("x-voice-queue-length");
/// Provider-side id of the ready voice.
pub const REMOTE_ID_HEADER: HeaderName = HeaderName::from_static("x-voice-remote-id");

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/voices/{voice}/stories/{story}/audio", post(start_synthesis).get(fetch_audio))
}

#[derive(Serialize)]
struct StartResponse {
    status: &'static str,
    job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_length: Option<usize>,
}

fn numeric_header(response: &mut Response, name: HeaderName, value: usize) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        let _ = response.headers_mut().insert(name, value);
    }
}

async fn start_synthesis(
    State(state): State<AppState>,
    identity: Identity,
    Path((voice, story)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let voice_id = parse_voice_id(&voice)?;
    let story_id = parse_story_id(&story);
    let outcome = state.orchestrator.start_synthesis(&identity.user_id, voice_id, &story_id)?;

    Ok(match outcome {
        StartOutcome::AlreadyReady { job_id, remote_voice_id, .. } => {
            let mut response = (
                StatusCode::OK,
                Json(StartResponse {
                    status: "ready",
                    job_id,
                    queue_position: None,
                    queue_length: None,
                }),
            )
                .into_response();
            if let Some(remote) = remote_voice_id {
                if let Ok(value) = HeaderValue::from_str(&remote) {
                    let _ = response.headers_mut().insert(REMOTE_ID_HEADER, value);
                }
            }
            response
        }
        StartOutcome::Processing { job_id } => (
            StatusCode::ACCEPTED,
            Json(StartResponse {
                status: "processing",
                job_id,
                queue_position: None,
                queue_length: None,
            }),
        )
            .into_response(),
        StartOutcome::AllocatingVoice { job_id, queue_position } => (
            StatusCode::ACCEPTED,
            Json(StartResponse {
                status: "allocating_voice",
                job_id,
                queue_position,
                queue_length: None,
            }),
        )
            .into_response(),
        StartOutcome::QueuedForSlot { job_id, queue_position, queue_length } => {
            let mut response = (
                StatusCode::ACCEPTED,
                Json(StartResponse {
                    status: "queued_for_slot",
                    job_id,
                    queue_position: Some(queue_position),
                    queue_length: Some(queue_length),
                }),
            )
                .into_response();
            numeric_header(&mut response, QUEUE_POSITION_HEADER, queue_position);
            numeric_header(&mut response, QUEUE_LENGTH_HEADER, queue_length);
            response
        }
        StartOutcome::PaymentRequired { required, available } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(serde_json::json!({
                "error": {
                    "kind": "insufficient_credits",
                    "message": format!(
                        "this story needs {required} credits, {available} available"
                    ),
                },
                "required": required,
                "available": available,
            })),
        )
            .into_response(),
        StartOutcome::VoiceUnavailable { reason } => {
            ApiError::new(StatusCode::CONFLICT, "voice_unavailable", reason).into_response()
        }
    })
}

/// A `Range` header resolved against an artifact of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// No usable range; serve the whole artifact.
    Full,
    /// Serve bytes `start..=end`.
    Partial {
        /// First byte offset, inclusive.
        start: u64,
        /// Last byte offset, inclusive.
        end: u64,
    },
    /// The request lies entirely outside the artifact.
    Unsatisfiable,
}

/// Resolves a `Range` header value against `total` bytes.
///
/// Only a single `bytes=` range is honored; multipart, malformed, or
/// foreign-unit ranges fall back to the full body rather than erroring, per
/// the permissive reading of the range grammar.
fn resolve_range(header: Option<&str>, total: u64) -> ByteRange {
    let Some(raw) = header else {
        return ByteRange::Full;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let Ok(suffix_len) = suffix.parse::<u64>() else {
                return ByteRange::Full;
            };
            if suffix_len == 0 || total == 0 {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial { start: total.saturating_sub(suffix_len), end: total - 1 }
        }
        (start, "") => {
            let Ok(start) = start.parse::<u64>() else {
                return ByteRange::Full;
            };
            if start >= total {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial { start, end: total - 1 }
        }
        (start, end) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return ByteRange::Full;
            };
            if start > end || start >= total {
                return ByteRange::Unsatisfiable;
            }
            ByteRange::Partial { start, end: end.min(total - 1) }
        }
    }
}

async fn fetch_audio(
    State(state): State<AppState>,
    identity: Identity,
    Path((voice, story)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let voice_id = parse_voice_id(&voice)?;
    let story_id = parse_story_id(&story);
    match state.orchestrator.fetch_artifact(&identity.user_id, voice_id, &story_id).await? {
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_ready",
            "audio for this story is not ready",
        )),
        Some((_, ArtifactContent::Url(url))) => {
            Ok((StatusCode::FOUND, [(LOCATION, url)]).into_response())
        }
        Some((_, ArtifactContent::Bytes(bytes))) => {
            let total = bytes.len() as u64;
            let range = headers.get(header::RANGE).and_then(|value| value.to_str().ok());
            Ok(match resolve_range(range, total) {
                ByteRange::Full => (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, "audio/mpeg".to_owned()),
                        (header::ACCEPT_RANGES, "bytes".to_owned()),
                    ],
                    bytes,
                )
                    .into_response(),
                ByteRange::Partial { start, end } => {
                    let body = bytes[start as usize..=end as usize].to_vec();
                    (
                        StatusCode::PARTIAL_CONTENT,
                        [
                            (header::CONTENT_TYPE, "audio/mpeg".to_owned()),
                            (header::ACCEPT_RANGES, "bytes".to_owned()),
                            (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
                        ],
                        body,
                    )
                        .into_response()
                }
                ByteRange::Unsatisfiable => (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{total}"))],
                )
                    .into_response(),
            })
        }
    }
}
