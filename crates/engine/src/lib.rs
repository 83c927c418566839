// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Synthesis orchestration and the background worker runtime for the
//! TaleCast narration service.
//!
//! The orchestrator owns the request handshake (debit, ensure a voice slot,
//! enqueue synthesis, report progress); the worker runtime owns everything
//! that happens off the request path (allocation, synthesis, queue drain,
//! idle reclaim, lot expiration) with retry, backoff, deadlines and
//! graceful cancellation.

pub mod error;
pub mod orchestrator;
pub mod worker;

pub use error::Error;
pub use orchestrator::{ArtifactContent, Orchestrator, StartOutcome};
pub use worker::{Envelope, Task, TaskContext, TaskQueue, WorkerRuntime, execute};
