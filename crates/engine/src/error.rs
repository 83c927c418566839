// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for orchestration and the worker runtime.

use talecast_slots::ProviderError;
use talecast_store::JobId;

/// All errors the orchestrator and workers can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is outside the contract.
    #[error("invalid argument: {details}")]
    InvalidArgument {
        /// What was wrong.
        details: String,
    },

    /// The resource exists but belongs to another user.
    #[error("{entity} `{id}` belongs to another user")]
    Forbidden {
        /// Kind of the protected resource.
        entity: &'static str,
        /// Identity looked up.
        id: String,
    },

    /// The voice is not ready yet; the synthesis task should run again
    /// later. Retryable.
    #[error("voice for job {job_id} is not ready yet")]
    VoiceNotReady {
        /// Waiting job.
        job_id: JobId,
    },

    /// An operation exceeded its deadline. Retryable.
    #[error("operation `{operation}` timed out")]
    Timeout {
        /// Which operation lapsed.
        operation: &'static str,
    },

    /// A direct provider call failed.
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    /// A slot operation failed underneath.
    #[error(transparent)]
    Slots(#[from] talecast_slots::Error),

    /// A ledger operation failed underneath.
    #[error(transparent)]
    Ledger(#[from] talecast_ledger::Error),

    /// A storage operation failed underneath.
    #[error(transparent)]
    Store(#[from] talecast_store::Error),
}

impl Error {
    /// Whether the worker runtime should re-dispatch with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::VoiceNotReady { .. } | Error::Timeout { .. } => true,
            Error::Provider(ProviderError::Retryable { .. }) => true,
            Error::Slots(error) => error.is_retryable(),
            Error::Ledger(error) => error.is_retryable(),
            Error::Provider(_)
            | Error::Store(_)
            | Error::InvalidArgument { .. }
            | Error::Forbidden { .. } => false,
        }
    }
}
