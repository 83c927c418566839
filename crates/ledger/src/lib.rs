// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Credit ledger for the TaleCast narration service.
//!
//! Credits live in *lots*, one source and one expiry each. Debits consume
//! across active lots in the configured priority order and record one
//! allocation per touched lot, so a later refund can restore the exact lots
//! the debit drew from. The applied-debit-per-job uniqueness enforced by the
//! store makes charges idempotent: retrying a debit for the same job returns
//! the original transaction.
//!
//! Every operation runs under the owning user's row lock; operations on
//! different users proceed in parallel.

pub mod calculator;
pub mod error;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use talecast_config::Config;
use talecast_store::{
    CreditAllocation, CreditLot, CreditSource, CreditTransaction, JobId, LedgerStore, LotId,
    SharedClock, StoryId, TxId, TxKind, TxStatus, UserId,
};

pub use crate::calculator::required_credits;
pub use crate::error::Error;

/// Result of a refund request.
#[derive(Debug, Clone)]
pub enum RefundOutcome {
    /// A refund transaction was written.
    Refunded(CreditTransaction),
    /// The debit was already refunded, or never existed. Nothing changed.
    NoOp,
}

/// One spendable lot in a balance summary.
#[derive(Debug, Clone, Serialize)]
pub struct LotView {
    /// Lot identity.
    pub lot_id: LotId,
    /// Where the credits came from.
    pub source: CreditSource,
    /// Amount originally granted.
    pub amount_granted: i64,
    /// Amount still spendable.
    pub amount_remaining: i64,
    /// Expiry, `None` for never.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A user's balance summary.
#[derive(Debug, Clone, Serialize)]
pub struct CreditSummary {
    /// Sum of `amount_remaining` over non-expired lots, the spendable truth.
    pub active_balance: i64,
    /// The cached balance as read, before any reconciliation.
    pub cached_balance: i64,
    /// Whether the cache disagreed and was rewritten to match.
    pub reconciled: bool,
    /// Spendable lots, in consumption order.
    pub lots: Vec<LotView>,
}

/// One page of transaction history.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// The rows of this page, newest first.
    pub items: Vec<T>,
    /// Total rows matching the filter.
    pub total: usize,
    /// Applied page size.
    pub limit: usize,
    /// Applied offset.
    pub offset: usize,
}

/// Upper bound on a history page.
pub const HISTORY_MAX_LIMIT: usize = 100;
/// Page size used when the caller does not pick one.
pub const HISTORY_DEFAULT_LIMIT: usize = 20;

/// The credit ledger.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    store: Arc<LedgerStore>,
    config: Arc<Config>,
    clock: SharedClock,
}

impl CreditLedger {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<LedgerStore>, config: Arc<Config>, clock: SharedClock) -> Self {
        Self { store, config, clock }
    }

    /// Orders spendable lots for consumption: configured source priority
    /// first, then soonest expiry (never-expiring last), then lot id.
    fn consumption_order(&self, a: &CreditLot, b: &CreditLot) -> Ordering {
        let rank_a = self.config.priority_rank(a.source.as_str());
        let rank_b = self.config.priority_rank(b.source.as_str());
        rank_a
            .cmp(&rank_b)
            .then_with(|| match (a.expires_at, b.expires_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.lot_id.cmp(&b.lot_id))
    }

    /// Creates a new lot and the matching credit transaction, and refreshes
    /// the cached balance.
    pub fn grant(
        &self,
        user_id: &UserId,
        amount: i64,
        source: CreditSource,
        expires_at: Option<DateTime<Utc>>,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<CreditLot, Error> {
        let now = self.clock.now();
        if amount <= 0 {
            return Err(Error::InvalidArgument {
                details: format!("grant amount must be positive, got {amount}"),
            });
        }
        if let Some(expiry) = expires_at {
            if expiry <= now {
                return Err(Error::InvalidArgument {
                    details: format!("grant expiry {expiry} is already in the past"),
                });
            }
        }
        let lot = self.store.with_user(user_id, |state| -> Result<CreditLot, Error> {
            let lot = CreditLot {
                lot_id: LotId::new(),
                user_id: user_id.clone(),
                source,
                amount_granted: amount,
                amount_remaining: amount,
                expires_at,
                created_at: now,
            };
            let tx_id = TxId::new();
            let tx = CreditTransaction {
                tx_id,
                user_id: user_id.clone(),
                amount,
                kind: TxKind::Credit,
                status: TxStatus::Applied,
                reason: reason.to_owned(),
                job_id: None,
                story_id: None,
                metadata,
                created_at: now,
            };
            state.insert_lot(lot.clone());
            let _ = state.record_transaction(
                tx,
                vec![CreditAllocation { tx_id, lot_id: lot.lot_id, amount }],
            )?;
            let balance = state.active_balance(now);
            state.set_cached_balance(balance, now);
            Ok(lot)
        })?;
        tracing::info!(
            user_id = %user_id,
            lot_id = %lot.lot_id,
            amount,
            source = source.as_str(),
            "credits granted"
        );
        Ok(lot)
    }

    /// Consumes `amount` across active lots in priority order.
    ///
    /// Idempotent per job: when an applied debit already exists for
    /// `job_id`, that transaction is returned and nothing else changes.
    pub fn debit(
        &self,
        user_id: &UserId,
        amount: i64,
        job_id: JobId,
        story_id: Option<StoryId>,
        reason: &str,
    ) -> Result<CreditTransaction, Error> {
        let now = self.clock.now();
        if amount <= 0 {
            return Err(Error::InvalidArgument {
                details: format!("debit amount must be positive, got {amount}"),
            });
        }
        let tx = self.store.with_user(user_id, |state| -> Result<CreditTransaction, Error> {
            if let Some(existing) = state.open_debit(job_id) {
                return Ok(existing.clone());
            }
            let available = state.active_balance(now);
            if available < amount {
                return Err(Error::InsufficientCredits { required: amount, available });
            }
            let mut lots: Vec<CreditLot> = state
                .lots()
                .iter()
                .filter(|l| l.is_active(now) && l.amount_remaining > 0)
                .cloned()
                .collect();
            lots.sort_by(|a, b| self.consumption_order(a, b));

            let tx_id = TxId::new();
            let mut outstanding = amount;
            let mut allocations = Vec::new();
            for lot in &lots {
                if outstanding == 0 {
                    break;
                }
                let take = outstanding.min(lot.amount_remaining);
                allocations.push(CreditAllocation { tx_id, lot_id: lot.lot_id, amount: -take });
                outstanding -= take;
            }
            for allocation in &allocations {
                let _ = state.adjust_lot(allocation.lot_id, allocation.amount)?;
            }
            let tx = CreditTransaction {
                tx_id,
                user_id: user_id.clone(),
                amount: -amount,
                kind: TxKind::Debit,
                status: TxStatus::Applied,
                reason: reason.to_owned(),
                job_id: Some(job_id),
                story_id,
                metadata: serde_json::Value::Null,
                created_at: now,
            };
            let _ = state.record_transaction(tx.clone(), allocations)?;
            let balance = state.active_balance(now);
            state.set_cached_balance(balance, now);
            Ok(tx)
        })?;
        self.store.index_job(job_id, user_id.clone());
        tracing::info!(
            user_id = %user_id,
            job_id = %job_id,
            amount,
            "credits debited"
        );
        Ok(tx)
    }

    /// Restores the debit for `job_id` to the exact lots it drew from.
    ///
    /// Idempotent: a second call, or a call for a job that was never
    /// debited, returns [`RefundOutcome::NoOp`]. A refund restores into a
    /// lot even when the lot has since expired; the restored amount shows in
    /// `amount_remaining` but is not spendable.
    pub fn refund_by_job(&self, job_id: JobId, reason: &str) -> Result<RefundOutcome, Error> {
        let now = self.clock.now();
        let Some(owner) = self.store.job_owner(job_id) else {
            return Ok(RefundOutcome::NoOp);
        };
        let outcome = self.store.with_user(&owner, |state| -> Result<RefundOutcome, Error> {
            let Some(debit) = state.open_debit(job_id).cloned() else {
                return Ok(RefundOutcome::NoOp);
            };
            let tx_id = TxId::new();
            let allocations: Vec<CreditAllocation> = state
                .allocations_for(debit.tx_id)
                .iter()
                .map(|a| CreditAllocation { tx_id, lot_id: a.lot_id, amount: -a.amount })
                .collect();
            for allocation in &allocations {
                let _ = state.adjust_lot(allocation.lot_id, allocation.amount)?;
            }
            state.mark_debit_refunded(debit.tx_id)?;
            let tx = CreditTransaction {
                tx_id,
                user_id: owner.clone(),
                amount: -debit.amount,
                kind: TxKind::Refund,
                status: TxStatus::Applied,
                reason: reason.to_owned(),
                job_id: Some(job_id),
                story_id: debit.story_id.clone(),
                metadata: serde_json::Value::Null,
                created_at: now,
            };
            let _ = state.record_transaction(tx.clone(), allocations)?;
            let balance = state.active_balance(now);
            state.set_cached_balance(balance, now);
            Ok(RefundOutcome::Refunded(tx))
        })?;
        if let RefundOutcome::Refunded(tx) = &outcome {
            tracing::info!(
                user_id = %owner,
                job_id = %job_id,
                amount = tx.amount,
                "debit refunded"
            );
        }
        Ok(outcome)
    }

    /// Zeroes every lot expired at `as_of` (default: now), writing one
    /// `expire` transaction per drained lot and refreshing caches.
    ///
    /// With `user_id` set, only that user's lots are touched; otherwise all
    /// users are swept (the daily beat).
    pub fn expire_now(
        &self,
        user_id: Option<&UserId>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<CreditTransaction>, Error> {
        let now = self.clock.now();
        let as_of = as_of.unwrap_or(now);
        let users = match user_id {
            Some(user) => vec![user.clone()],
            None => self.store.user_ids(),
        };
        let mut written = Vec::new();
        for user in users {
            let txs = self.store.with_user(&user, |state| -> Result<Vec<CreditTransaction>, Error> {
                let expired: Vec<LotId> = state
                    .lots()
                    .iter()
                    .filter(|l| {
                        l.amount_remaining > 0 && l.expires_at.is_some_and(|e| e <= as_of)
                    })
                    .map(|l| l.lot_id)
                    .collect();
                let mut out = Vec::new();
                for lot_id in expired {
                    let lost = state.drain_lot(lot_id)?;
                    if lost == 0 {
                        continue;
                    }
                    let tx_id = TxId::new();
                    let tx = CreditTransaction {
                        tx_id,
                        user_id: user.clone(),
                        amount: -lost,
                        kind: TxKind::Expire,
                        status: TxStatus::Applied,
                        reason: "lot_expired".to_owned(),
                        job_id: None,
                        story_id: None,
                        metadata: serde_json::Value::Null,
                        created_at: now,
                    };
                    let _ = state.record_transaction(
                        tx.clone(),
                        vec![CreditAllocation { tx_id, lot_id, amount: -lost }],
                    )?;
                    out.push(tx);
                }
                if !out.is_empty() {
                    let balance = state.active_balance(now);
                    state.set_cached_balance(balance, now);
                }
                Ok(out)
            })?;
            written.extend(txs);
        }
        if !written.is_empty() {
            tracing::info!(lots = written.len(), "expired credit lots drained");
        }
        Ok(written)
    }

    /// The user's balance summary. Reconciles the cached balance against
    /// the lots when the two disagree.
    pub fn summary(&self, user_id: &UserId) -> CreditSummary {
        let now = self.clock.now();
        self.store.with_user(user_id, |state| {
            let active = state.active_balance(now);
            let cached = state.user().credits_balance_cached;
            let reconciled = cached != active;
            if reconciled {
                tracing::warn!(
                    user_id = %user_id,
                    cached,
                    active,
                    "cached balance out of sync; reconciled"
                );
                state.set_cached_balance(active, now);
            }
            let mut lots: Vec<CreditLot> = state
                .lots()
                .iter()
                .filter(|l| l.is_active(now) && l.amount_remaining > 0)
                .cloned()
                .collect();
            lots.sort_by(|a, b| self.consumption_order(a, b));
            CreditSummary {
                active_balance: active,
                cached_balance: cached,
                reconciled,
                lots: lots
                    .into_iter()
                    .map(|l| LotView {
                        lot_id: l.lot_id,
                        source: l.source,
                        amount_granted: l.amount_granted,
                        amount_remaining: l.amount_remaining,
                        expires_at: l.expires_at,
                    })
                    .collect(),
            }
        })
    }

    /// A page of the user's transactions, newest first, optionally filtered
    /// by kind. `limit` is clamped to `[1, 100]` and defaults to 20.
    pub fn history(
        &self,
        user_id: &UserId,
        limit: Option<usize>,
        offset: usize,
        kinds: Option<&[TxKind]>,
    ) -> Page<CreditTransaction> {
        let limit = limit.unwrap_or(HISTORY_DEFAULT_LIMIT).clamp(1, HISTORY_MAX_LIMIT);
        self.store.with_user(user_id, |state| {
            let matches = |tx: &CreditTransaction| kinds.is_none_or(|ks| ks.contains(&tx.kind));
            let total = state.transactions().iter().filter(|t| matches(t)).count();
            let items = state
                .transactions()
                .iter()
                .rev()
                .filter(|t| matches(t))
                .skip(offset)
                .take(limit)
                .cloned()
                .collect();
            Page { items, total, limit, offset }
        })
    }
}
