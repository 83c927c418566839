// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Request extractors.
//!
//! Authentication itself is a gateway concern: by the time a request reaches
//! this service, the gateway has verified the caller and stamped
//! `X-User-Id`. Admin calls carry `X-Admin-Token`, compared against the
//! configured shared secret.

use crate::AppState;
use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use talecast_store::{StoryId, UserId, VoiceId};

/// Header carrying the gateway-verified caller identity.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the admin shared secret.
pub const ADMIN_HEADER: &str = "x-admin-token";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Gateway-verified user id.
    pub user_id: UserId,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(ApiError::unauthenticated)?;
        Ok(Identity { user_id: UserId::from(user_id) })
    }
}

/// A caller holding the admin secret.
#[derive(Debug, Clone)]
pub struct Admin;

impl FromRequestParts<AppState> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected = state.config.http.admin_token.as_str();
        if expected.is_empty() {
            return Err(ApiError::forbidden("admin surface is disabled"));
        }
        let presented = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if presented != expected {
            return Err(ApiError::forbidden("invalid admin token"));
        }
        Ok(Admin)
    }
}

/// Parses a voice id path segment; unknown-looking ids read as 404 rather
/// than leaking id syntax.
pub fn parse_voice_id(raw: &str) -> Result<VoiceId, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found(format!("voice `{raw}` not found")))
}

/// Wraps a story id path segment.
pub fn parse_story_id(raw: &str) -> StoryId {
    StoryId::from(raw)
}
