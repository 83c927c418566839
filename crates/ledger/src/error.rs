// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for ledger operations.

use talecast_store::JobId;

/// All errors a ledger operation can produce.
///
/// Expected business outcomes (`InsufficientCredits`, `DuplicateDebit`) are
/// values, not panics; callers match on them to shape responses.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is outside the contract.
    #[error("invalid argument: {details}")]
    InvalidArgument {
        /// What was wrong.
        details: String,
    },

    /// The user's active balance cannot cover the requested debit.
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        /// Credits the operation needed.
        required: i64,
        /// Credits spendable at the time of the attempt.
        available: i64,
    },

    /// An applied debit already exists for the job.
    ///
    /// Callers treating a retry as success should use the transaction
    /// returned by `debit` instead of surfacing this.
    #[error("an applied debit already exists for job {job_id}")]
    DuplicateDebit {
        /// Job already charged.
        job_id: JobId,
    },

    /// A referenced row does not exist.
    #[error("{entity} `{id}` not found")]
    NotFound {
        /// Kind of the missing row.
        entity: &'static str,
        /// Identity looked up.
        id: String,
    },

    /// A concurrent writer got in the way; the operation can be retried.
    #[error("concurrency conflict: {details}")]
    ConcurrencyConflict {
        /// What collided.
        details: String,
    },

    /// A storage invariant failed underneath the operation.
    #[error(transparent)]
    Store(#[from] talecast_store::Error),
}

impl Error {
    /// Whether a retry may succeed without caller-side changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}
