// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the TaleCast narration service.
//!
//! One router, per-resource modules: voice CRUD, synthesis start/fetch,
//! credit summary and history, the admin surface, and probes. Handlers stay
//! thin (parse, call the orchestrator/ledger/manager, shape the response);
//! all business rules live below this crate.

pub mod error;
pub mod extract;

mod admin;
mod audio;
mod credits;
mod probes;
mod voices;

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use talecast_config::Config;
use talecast_engine::{Orchestrator, TaskQueue};
use talecast_ledger::CreditLedger;
use talecast_slots::SlotManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Synthesis orchestration and voice service layer.
    pub orchestrator: Arc<Orchestrator>,
    /// Slot pool operations and status.
    pub manager: Arc<SlotManager>,
    /// Credit ledger.
    pub ledger: Arc<CreditLedger>,
    /// Background task producer, for force-beat endpoints and readiness.
    pub tasks: Arc<TaskQueue>,
    /// Service configuration.
    pub config: Arc<Config>,
}

/// Builds the service router over `state`.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(probes::routes())
        .merge(voices::routes())
        .merge(audio::routes())
        .merge(credits::routes())
        .merge(admin::routes())
        .with_state(state)
}

/// Runs the HTTP server until shutdown is requested.
pub async fn run(state: AppState, cancel: CancellationToken) -> Result<(), Error> {
    let bind_address = state.config.http.bind_address.clone();
    let app = router(state);

    let addr = bind_address.parse::<SocketAddr>().map_err(|e| Error::InvalidBindAddress {
        bind_address: bind_address.clone(),
        details: e.to_string(),
    })?;
    let listener = TcpListener::bind(&addr).await.map_err(|e| Error::BindFailed {
        addr: addr.to_string(),
        details: e.to_string(),
    })?;

    tracing::info!(endpoint = %addr, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .map_err(|e| Error::ServerError { addr: addr.to_string(), details: e.to_string() })
}
