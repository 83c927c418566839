// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Elastic voice-slot management for the TaleCast narration service.
//!
//! Remote TTS providers cap how many cloned voices may exist at once. This
//! crate recycles that capped pool across many users: voice upload is
//! decoupled from remote allocation, requests beyond capacity wait in a
//! durable-shaped FIFO, idle slots are reclaimed fairly, and divergence from
//! the remote system (drift) is repaired instead of surfaced.

pub mod adapter;
pub mod error;
pub mod manager;

pub use adapter::{DeleteOutcome, MockProvider, ProviderError, RemoteVoiceAdapter};
pub use error::Error;
pub use manager::{EnsureResult, PoolStatus, SlotManager, TaskDispatcher};
