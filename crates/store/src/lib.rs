// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Domain model and transactional state stores for the TaleCast
//! coordination service.
//!
//! The stores keep the relational shape of the service's data (users,
//! credit lots, ledger transactions and their lot allocations, voices and
//! their slot bindings, synthesis jobs, the allocation waiting queue) behind
//! concern-specific handles with explicit locking scopes:
//!
//! - [`LedgerStore`] serializes per user (the ledger row lock),
//! - [`VoiceStore`] guards lifecycle transitions per voice and owns the
//!   TTL-based slot locks,
//! - [`SlotQueue`] is a per-provider FIFO with dedupe,
//! - [`JobStore`] and [`StoryStore`] are plain keyed stores.
//!
//! Remote provider calls live in the adapters composed on top; the only I/O
//! seam here is the [`BlobStore`] contract, whose in-memory implementation
//! backs the demo binary and the test suites.

pub mod blob;
pub mod clock;
pub mod error;
pub mod job;
pub mod ledger;
pub mod model;
pub mod queue;
pub mod story;
pub mod voice;

pub use blob::{BlobStore, MemoryBlobStore};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::Error;
pub use job::JobStore;
pub use ledger::{LedgerStore, UserState};
pub use model::{
    AllocationStatus, CreditAllocation, CreditLot, CreditSource, CreditTransaction, EventId,
    JobId, JobStatus, LotId, Provider, QueueEntry, SlotEvent, SlotEventType, Story, StoryId,
    SynthesisJob, TxId, TxKind, TxStatus, UserId, UserRecord, Voice, VoiceId,
};
pub use queue::{QueuePosition, SlotQueue};
pub use story::StoryStore;
pub use voice::VoiceStore;
