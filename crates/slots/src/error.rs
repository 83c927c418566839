// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for slot management.

use crate::adapter::ProviderError;
use talecast_store::VoiceId;

/// All errors a slot operation can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Another allocator holds a live slot lock on the voice. Retryable.
    #[error("voice {voice_id} is locked by another allocator")]
    LockBusy {
        /// Contested voice.
        voice_id: VoiceId,
    },

    /// A remote provider call failed.
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    /// A remote provider call exceeded its deadline. Retryable.
    #[error("provider call `{operation}` timed out")]
    Timeout {
        /// Which call lapsed.
        operation: &'static str,
    },

    /// A storage operation failed underneath.
    #[error(transparent)]
    Store(#[from] talecast_store::Error),
}

impl Error {
    /// Whether a retry with backoff may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockBusy { .. } | Error::Timeout { .. } => true,
            Error::Provider(ProviderError::Retryable { .. }) => true,
            Error::Provider(_) | Error::Store(_) => false,
        }
    }
}
