// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors raised by the state stores.

use crate::model::{AllocationStatus, JobId, LotId, TxId, VoiceId};

/// All errors that can occur inside the state stores.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A referenced row does not exist.
    #[error("{entity} `{id}` not found")]
    NotFound {
        /// Kind of the missing row.
        entity: &'static str,
        /// Identity that was looked up.
        id: String,
    },

    /// A voice status edge outside the allowed lifecycle was requested.
    #[error("voice {voice_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Voice concerned.
        voice_id: VoiceId,
        /// Current status.
        from: AllocationStatus,
        /// Requested status.
        to: AllocationStatus,
    },

    /// An applied debit already exists for the job.
    ///
    /// This is the storage-level idempotency key for synthesis charges;
    /// callers treat it as "already charged" and reuse the existing row.
    #[error("an applied debit already exists for job {job_id}")]
    DuplicateDebit {
        /// Job whose debit already exists.
        job_id: JobId,
    },

    /// Another voice already holds this remote voice id.
    #[error("remote voice id `{remote_voice_id}` is already bound")]
    RemoteIdTaken {
        /// The contested provider-side id.
        remote_voice_id: String,
    },

    /// A debit transaction was submitted without the job id that anchors
    /// its idempotency.
    #[error("debit transaction {tx_id} has no job id")]
    DebitWithoutJob {
        /// Offending transaction.
        tx_id: TxId,
    },

    /// A lot adjustment would leave `amount_remaining` outside
    /// `[0, amount_granted]`.
    #[error("lot {lot_id}: delta {delta} is out of bounds (remaining {remaining})")]
    LotOutOfBounds {
        /// Lot concerned.
        lot_id: LotId,
        /// Remaining amount before the adjustment.
        remaining: i64,
        /// Rejected delta.
        delta: i64,
    },

    /// The allocations of a transaction do not sum to its amount.
    ///
    /// This is an invariant violation: the current operation is aborted and
    /// nothing is written.
    #[error("transaction {tx_id}: allocations sum to {allocated}, amount is {tx_amount}")]
    AllocationMismatch {
        /// Offending transaction.
        tx_id: TxId,
        /// Declared transaction amount.
        tx_amount: i64,
        /// Sum of the submitted allocations.
        allocated: i64,
    },

    /// A row with this identity already exists.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Kind of the duplicated row.
        entity: &'static str,
        /// Duplicated identity.
        id: String,
    },
}
