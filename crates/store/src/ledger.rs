// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Ledger state: users, credit lots, transactions, allocations.
//!
//! All mutation happens inside [`LedgerStore::with_user`], which serializes
//! operations per user while letting different users proceed in parallel,
//! the row-lock discipline the ledger contract requires. The store also
//! enforces the two storage-level invariants: at most one applied debit per
//! job, and allocation sums equal to their transaction amount.

use crate::clock::{Clock, SharedClock};
use crate::error::Error;
use crate::model::{
    CreditAllocation, CreditLot, CreditTransaction, JobId, LotId, TxId, TxKind, TxStatus,
    UserId, UserRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// All ledger rows belonging to one user, guarded by the user lock.
#[derive(Debug)]
pub struct UserState {
    user: UserRecord,
    lots: Vec<CreditLot>,
    transactions: Vec<CreditTransaction>,
    allocations: Vec<CreditAllocation>,
    open_debits: HashMap<JobId, TxId>,
}

impl UserState {
    fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user: UserRecord { user_id, credits_balance_cached: 0, updated_at: now },
            lots: Vec::new(),
            transactions: Vec::new(),
            allocations: Vec::new(),
            open_debits: HashMap::new(),
        }
    }

    /// The user row.
    #[must_use]
    pub fn user(&self) -> &UserRecord {
        &self.user
    }

    /// All lots, in grant order.
    #[must_use]
    pub fn lots(&self) -> &[CreditLot] {
        &self.lots
    }

    /// Looks up one lot.
    #[must_use]
    pub fn lot(&self, lot_id: LotId) -> Option<&CreditLot> {
        self.lots.iter().find(|l| l.lot_id == lot_id)
    }

    /// All transactions, oldest first.
    #[must_use]
    pub fn transactions(&self) -> &[CreditTransaction] {
        &self.transactions
    }

    /// The applied debit for `job_id`, if one exists.
    #[must_use]
    pub fn open_debit(&self, job_id: JobId) -> Option<&CreditTransaction> {
        let tx_id = self.open_debits.get(&job_id)?;
        self.transactions.iter().find(|t| t.tx_id == *tx_id)
    }

    /// Any debit (applied or refunded) for `job_id`.
    #[must_use]
    pub fn debit_for_job(&self, job_id: JobId) -> Option<&CreditTransaction> {
        self.transactions
            .iter()
            .find(|t| t.kind == TxKind::Debit && t.job_id == Some(job_id))
    }

    /// The allocations recorded for one transaction.
    #[must_use]
    pub fn allocations_for(&self, tx_id: TxId) -> Vec<CreditAllocation> {
        self.allocations.iter().filter(|a| a.tx_id == tx_id).cloned().collect()
    }

    /// Inserts a freshly granted lot.
    pub fn insert_lot(&mut self, lot: CreditLot) {
        self.lots.push(lot);
    }

    /// Applies a signed delta to a lot's `amount_remaining`, clamping
    /// violations into hard errors rather than silently saturating.
    pub fn adjust_lot(&mut self, lot_id: LotId, delta: i64) -> Result<i64, Error> {
        let lot = self
            .lots
            .iter_mut()
            .find(|l| l.lot_id == lot_id)
            .ok_or_else(|| Error::NotFound { entity: "credit lot", id: lot_id.to_string() })?;
        let next = lot.amount_remaining + delta;
        if next < 0 || next > lot.amount_granted {
            return Err(Error::LotOutOfBounds {
                lot_id,
                remaining: lot.amount_remaining,
                delta,
            });
        }
        lot.amount_remaining = next;
        Ok(next)
    }

    /// Zeroes a lot, returning the amount lost. Used by expiration.
    pub fn drain_lot(&mut self, lot_id: LotId) -> Result<i64, Error> {
        let lot = self
            .lots
            .iter_mut()
            .find(|l| l.lot_id == lot_id)
            .ok_or_else(|| Error::NotFound { entity: "credit lot", id: lot_id.to_string() })?;
        let lost = lot.amount_remaining;
        lot.amount_remaining = 0;
        Ok(lost)
    }

    /// Writes a transaction and its allocations atomically with respect to
    /// this user.
    ///
    /// Rejects a second applied debit for the same job
    /// ([`Error::DuplicateDebit`]) and any allocation set that does not sum
    /// to the transaction amount ([`Error::AllocationMismatch`]).
    pub fn record_transaction(
        &mut self,
        tx: CreditTransaction,
        allocations: Vec<CreditAllocation>,
    ) -> Result<TxId, Error> {
        let allocated: i64 = allocations.iter().map(|a| a.amount).sum();
        if allocated != tx.amount {
            return Err(Error::AllocationMismatch {
                tx_id: tx.tx_id,
                tx_amount: tx.amount,
                allocated,
            });
        }
        if tx.kind == TxKind::Debit && tx.status == TxStatus::Applied {
            let job_id = tx.job_id.ok_or(Error::DebitWithoutJob { tx_id: tx.tx_id })?;
            if self.open_debits.contains_key(&job_id) {
                return Err(Error::DuplicateDebit { job_id });
            }
            let _ = self.open_debits.insert(job_id, tx.tx_id);
        }
        let tx_id = tx.tx_id;
        self.transactions.push(tx);
        self.allocations.extend(allocations);
        Ok(tx_id)
    }

    /// Flips an applied debit to refunded and drops it from the open-debit
    /// index.
    pub fn mark_debit_refunded(&mut self, tx_id: TxId) -> Result<(), Error> {
        let tx = self
            .transactions
            .iter_mut()
            .find(|t| t.tx_id == tx_id)
            .ok_or_else(|| Error::NotFound { entity: "transaction", id: tx_id.to_string() })?;
        tx.status = TxStatus::Refunded;
        if let Some(job_id) = tx.job_id {
            let _ = self.open_debits.remove(&job_id);
        }
        Ok(())
    }

    /// Sum of `amount_remaining` over lots spendable at `now`.
    #[must_use]
    pub fn active_balance(&self, now: DateTime<Utc>) -> i64 {
        self.lots.iter().filter(|l| l.is_active(now)).map(|l| l.amount_remaining).sum()
    }

    /// Overwrites the cached balance.
    pub fn set_cached_balance(&mut self, balance: i64, now: DateTime<Utc>) {
        self.user.credits_balance_cached = balance;
        self.user.updated_at = now;
    }
}

/// Store of all per-user ledger state.
#[derive(Debug)]
pub struct LedgerStore {
    clock: SharedClock,
    users: RwLock<HashMap<UserId, Arc<Mutex<UserState>>>>,
    job_owner: RwLock<HashMap<JobId, UserId>>,
}

impl LedgerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            users: RwLock::new(HashMap::new()),
            job_owner: RwLock::new(HashMap::new()),
        }
    }

    fn cell(&self, user_id: &UserId) -> Arc<Mutex<UserState>> {
        if let Some(cell) = self.users.read().get(user_id) {
            return Arc::clone(cell);
        }
        let mut users = self.users.write();
        Arc::clone(users.entry(user_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(UserState::new(user_id.clone(), self.clock.now())))
        }))
    }

    /// Creates the user row if it does not exist yet; returns whether it was
    /// created. The single `true` return across racing callers is the hook
    /// for one-time setup such as the initial credit grant.
    pub fn ensure_user(&self, user_id: &UserId) -> bool {
        if self.users.read().contains_key(user_id) {
            return false;
        }
        let mut users = self.users.write();
        match users.entry(user_id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                let _ = slot
                    .insert(Arc::new(Mutex::new(UserState::new(user_id.clone(), self.clock.now()))));
                true
            }
        }
    }

    /// Runs `f` under the user's row lock, creating the row on first touch.
    ///
    /// Operations for one user serialize here; operations for different
    /// users run in parallel.
    pub fn with_user<R>(&self, user_id: &UserId, f: impl FnOnce(&mut UserState) -> R) -> R {
        let cell = self.cell(user_id);
        let mut state = cell.lock();
        f(&mut state)
    }

    /// Records which user owns a job's debit, for refund lookups.
    pub fn index_job(&self, job_id: JobId, user_id: UserId) {
        let _ = self.job_owner.write().insert(job_id, user_id);
    }

    /// The user whose ledger holds the debit for `job_id`.
    #[must_use]
    pub fn job_owner(&self, job_id: JobId) -> Option<UserId> {
        self.job_owner.read().get(&job_id).cloned()
    }

    /// Cached balance snapshot without taking the user lock for long.
    #[must_use]
    pub fn cached_balance(&self, user_id: &UserId) -> Option<i64> {
        let cell = Arc::clone(self.users.read().get(user_id)?);
        let state = cell.lock();
        Some(state.user.credits_balance_cached)
    }

    /// All user ids currently known to the ledger.
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        self.users.read().keys().cloned().collect()
    }
}
