// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Abstraction over remote text-to-speech providers.
//!
//! The remote system may delete voices without notice (quotas, TTLs); a
//! [`ProviderError::RemoteVoiceMissing`] from `synthesize` is the drift
//! signal the slot manager recovers from. `create_voice` is not assumed
//! idempotent; callers check the stored `remote_voice_id` before invoking.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Failures a provider call can produce.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProviderError {
    /// The referenced remote voice no longer exists.
    #[error("remote voice is missing")]
    RemoteVoiceMissing,

    /// A transient failure (network, 5xx, timeout); the call may be retried.
    #[error("retryable provider failure: {details}")]
    Retryable {
        /// Provider or transport output.
        details: String,
    },

    /// A permanent failure (rejected sample, quota exhausted for good).
    #[error("fatal provider failure: {details}")]
    Fatal {
        /// Provider output.
        details: String,
    },
}

/// Outcome of a remote voice deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The remote voice was deleted.
    Deleted,
    /// The remote voice was already gone.
    NotFound,
}

/// A remote TTS provider.
///
/// Implementations are stateless from the caller's perspective; concurrent
/// calls are safe.
#[async_trait]
pub trait RemoteVoiceAdapter: Send + Sync + fmt::Debug {
    /// Clones a voice from `sample` and returns the provider-side id.
    async fn create_voice(&self, sample: &[u8], name: &str) -> Result<String, ProviderError>;

    /// Deletes a remote voice.
    async fn delete_voice(&self, remote_id: &str) -> Result<DeleteOutcome, ProviderError>;

    /// Narrates `text` with the remote voice and returns the audio bytes.
    async fn synthesize(&self, remote_id: &str, text: &str) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, Default)]
struct MockState {
    voices: HashMap<String, Vec<u8>>,
    counter: u64,
    create_failures: VecDeque<ProviderError>,
    synthesize_failures: VecDeque<ProviderError>,
    create_calls: u64,
    delete_calls: u64,
    synthesize_calls: u64,
}

/// Deterministic in-process provider.
///
/// Used by the demo binary and tests. Failures are scripted per call with
/// [`MockProvider::fail_next_create`] and friends; drift is simulated by
/// [`MockProvider::drop_remote_voice`].
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next `create_voice` call to fail with `error`.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.state.lock().create_failures.push_back(error);
    }

    /// Scripts the next `synthesize` call to fail with `error`.
    pub fn fail_next_synthesize(&self, error: ProviderError) {
        self.state.lock().synthesize_failures.push_back(error);
    }

    /// Deletes a remote voice behind the caller's back, simulating provider
    /// drift.
    pub fn drop_remote_voice(&self, remote_id: &str) {
        let _ = self.state.lock().voices.remove(remote_id);
    }

    /// Whether the provider currently holds `remote_id`.
    #[must_use]
    pub fn has_voice(&self, remote_id: &str) -> bool {
        self.state.lock().voices.contains_key(remote_id)
    }

    /// Number of remote voices currently held.
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Calls seen so far: `(create, delete, synthesize)`.
    #[must_use]
    pub fn call_counts(&self) -> (u64, u64, u64) {
        let state = self.state.lock();
        (state.create_calls, state.delete_calls, state.synthesize_calls)
    }
}

#[async_trait]
impl RemoteVoiceAdapter for MockProvider {
    async fn create_voice(&self, sample: &[u8], name: &str) -> Result<String, ProviderError> {
        let mut state = self.state.lock();
        state.create_calls += 1;
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        state.counter += 1;
        let remote_id = format!("rv-{}-{}", name, state.counter);
        let _ = state.voices.insert(remote_id.clone(), sample.to_vec());
        Ok(remote_id)
    }

    async fn delete_voice(&self, remote_id: &str) -> Result<DeleteOutcome, ProviderError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        match state.voices.remove(remote_id) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn synthesize(&self, remote_id: &str, text: &str) -> Result<Vec<u8>, ProviderError> {
        let mut state = self.state.lock();
        state.synthesize_calls += 1;
        if let Some(error) = state.synthesize_failures.pop_front() {
            return Err(error);
        }
        if !state.voices.contains_key(remote_id) {
            return Err(ProviderError::RemoteVoiceMissing);
        }
        Ok(format!("audio/{remote_id}/{}", text.chars().count()).into_bytes())
    }
}
