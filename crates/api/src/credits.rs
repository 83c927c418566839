// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Credit balance and transaction history for the caller.
//!
//! - GET `/me/credits` - balance summary with spendable lots and recent rows
//! - GET `/me/credits/history?limit&offset&type` - paged transactions

use crate::AppState;
use crate::error::ApiError;
use crate::extract::Identity;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use talecast_ledger::{LotView, Page};
use talecast_store::{CreditTransaction, TxKind};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/me/credits", get(summary))
        .route("/me/credits/history", get(history))
}

#[derive(Serialize)]
struct CreditsResponse {
    balance: i64,
    unit_label: String,
    lots: Vec<LotView>,
    history: Vec<CreditTransaction>,
}

async fn summary(
    State(state): State<AppState>,
    identity: Identity,
) -> Json<CreditsResponse> {
    // First contact through any endpoint registers the user (and grants the
    // configured signup credits).
    state.orchestrator.touch_user(&identity.user_id);
    let summary = state.ledger.summary(&identity.user_id);
    let recent = state.ledger.history(&identity.user_id, None, 0, None);
    Json(CreditsResponse {
        balance: summary.active_balance,
        unit_label: state.config.credits.unit_label.clone(),
        lots: summary.lots,
        history: recent.items,
    })
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn history(
    State(state): State<AppState>,
    identity: Identity,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Page<CreditTransaction>>, ApiError> {
    let kinds = match &params.kind {
        None => None,
        Some(raw) => {
            let kind: TxKind =
                raw.parse().map_err(|e: String| ApiError::bad_request(e))?;
            Some(vec![kind])
        }
    };
    state.orchestrator.touch_user(&identity.user_id);
    let page = state.ledger.history(
        &identity.user_id,
        params.limit,
        params.offset.unwrap_or(0),
        kinds.as_deref(),
    );
    Ok(Json(page))
}
