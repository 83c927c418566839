// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Server errors and the machine-readable request error envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors while starting or running the HTTP server.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured bind address does not parse.
    #[error("invalid bind address `{bind_address}`: {details}")]
    InvalidBindAddress {
        /// The offending value.
        bind_address: String,
        /// Parser output.
        details: String,
    },

    /// The listener could not bind.
    #[error("failed to bind `{addr}`: {details}")]
    BindFailed {
        /// Address that failed.
        addr: String,
        /// OS error output.
        details: String,
    },

    /// The server terminated with an error.
    #[error("server error on `{addr}`: {details}")]
    ServerError {
        /// Address that was being served.
        addr: String,
        /// Underlying error output.
        details: String,
    },
}

/// A request-level failure, rendered as
/// `{ "error": { "kind": ..., "message": ... } }` with the matching status.
///
/// `kind` values are stable API surface; clients branch on them.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status to answer with.
    pub status: StatusCode,
    /// Stable machine-readable discriminator.
    pub kind: &'static str,
    /// Human-readable message.
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: &'a str,
}

impl ApiError {
    /// Builds an error response.
    #[must_use]
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self { status, kind, message: message.into() }
    }

    /// 401 for requests without a caller identity.
    #[must_use]
    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", "missing caller identity")
    }

    /// 403 for callers without the required right.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    /// 404 for unknown (or other users') resources.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 400 for malformed input.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail { kind: self.kind, message: &self.message },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<talecast_engine::Error> for ApiError {
    fn from(error: talecast_engine::Error) -> Self {
        use talecast_engine::Error as E;
        match &error {
            E::Forbidden { .. } => ApiError::forbidden(error.to_string()),
            E::InvalidArgument { .. } => ApiError::bad_request(error.to_string()),
            E::Store(talecast_store::Error::NotFound { .. }) => {
                ApiError::not_found(error.to_string())
            }
            E::Ledger(talecast_ledger::Error::NotFound { .. }) => {
                ApiError::not_found(error.to_string())
            }
            E::Ledger(talecast_ledger::Error::InsufficientCredits { .. }) => {
                ApiError::new(StatusCode::PAYMENT_REQUIRED, "insufficient_credits", error.to_string())
            }
            E::Ledger(talecast_ledger::Error::InvalidArgument { .. }) => {
                ApiError::bad_request(error.to_string())
            }
            _ if error.is_retryable() => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                error.to_string(),
            ),
            _ => {
                tracing::error!(error = %error, "request failed internally");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error",
                )
            }
        }
    }
}

impl From<talecast_ledger::Error> for ApiError {
    fn from(error: talecast_ledger::Error) -> Self {
        ApiError::from(talecast_engine::Error::Ledger(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_stable_kinds() {
        let forbidden = ApiError::from(talecast_engine::Error::Forbidden {
            entity: "voice",
            id: "v1".to_owned(),
        });
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);
        assert_eq!(forbidden.kind, "forbidden");

        let missing = ApiError::from(talecast_engine::Error::Store(
            talecast_store::Error::NotFound { entity: "story", id: "s1".to_owned() },
        ));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let retryable =
            ApiError::from(talecast_engine::Error::Timeout { operation: "synthesize" });
        assert_eq!(retryable.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
