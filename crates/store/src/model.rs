// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Persistent domain records.
//!
//! Records here are plain data: every mutation that carries business meaning
//! lives in the store handles (`ledger`, `voice`, `queue`, `job`), and side
//! effects (remote calls, blob I/O) live in adapters above this crate.
//! Cross-record references are plain ids, never owned pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a fresh random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id! {
    /// Identifier of a credit lot.
    LotId
}
define_id! {
    /// Identifier of a ledger transaction.
    TxId
}
define_id! {
    /// Identifier of a recorded voice.
    VoiceId
}
define_id! {
    /// Identifier of a synthesis job.
    JobId
}
define_id! {
    /// Identifier of a slot audit event.
    EventId
}

/// Opaque user identity, assigned by the authentication gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a gateway-issued identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Opaque story identity; story content lives in an external system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(String);

impl StoryId {
    /// Wraps an externally assigned story identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StoryId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// The remote text-to-speech providers a voice can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// ElevenLabs voice cloning.
    ElevenLabs,
    /// Cartesia voice cloning.
    Cartesia,
}

impl Provider {
    /// All known providers, in queue-drain order.
    pub const ALL: [Provider; 2] = [Provider::ElevenLabs, Provider::Cartesia];

    /// Stable lowercase name used in queue keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ElevenLabs => "elevenlabs",
            Provider::Cartesia => "cartesia",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elevenlabs" => Ok(Provider::ElevenLabs),
            "cartesia" => Ok(Provider::Cartesia),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

/// Origin of a credit lot. The configured priority list orders consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    /// Promotional or one-off event grants.
    Event,
    /// Recurring subscription grants.
    Monthly,
    /// Referral rewards.
    Referral,
    /// Purchased top-ups.
    AddOn,
    /// Free-tier grants.
    Free,
}

impl CreditSource {
    /// Stable lowercase name, matching the configuration syntax.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::Event => "event",
            CreditSource::Monthly => "monthly",
            CreditSource::Referral => "referral",
            CreditSource::AddOn => "add_on",
            CreditSource::Free => "free",
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CreditSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(CreditSource::Event),
            "monthly" => Ok(CreditSource::Monthly),
            "referral" => Ok(CreditSource::Referral),
            "add_on" => Ok(CreditSource::AddOn),
            "free" => Ok(CreditSource::Free),
            other => Err(format!("unknown credit source `{other}`")),
        }
    }
}

/// A user row with the cached spendable balance.
///
/// The cache equals the sum of `amount_remaining` over non-expired lots at
/// quiescence; it is reconciled lazily on summary reads and by the
/// expiration beat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Gateway identity.
    pub user_id: UserId,
    /// Cached spendable balance, never negative.
    pub credits_balance_cached: i64,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A pool of credits from one source with one expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLot {
    /// Lot identity.
    pub lot_id: LotId,
    /// Owning user.
    pub user_id: UserId,
    /// Where the credits came from.
    pub source: CreditSource,
    /// Amount originally granted, non-negative.
    pub amount_granted: i64,
    /// Amount still attached to the lot, in `[0, amount_granted]`.
    ///
    /// A refund can restore into an expired lot; the restored amount is
    /// recorded here but is not spendable.
    pub amount_remaining: i64,
    /// When the lot stops being spendable; `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Grant time.
    pub created_at: DateTime<Utc>,
}

impl CreditLot {
    /// Whether the lot is spendable at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires| expires > now)
    }
}

/// The kind of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    /// Consumption of credits, negative amount.
    Debit,
    /// A grant, positive amount.
    Credit,
    /// Restoration of a failed debit, positive amount.
    Refund,
    /// Loss of credits to lot expiry, negative amount.
    Expire,
}

impl TxKind {
    /// Stable lowercase name used in the history filter.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Debit => "debit",
            TxKind::Credit => "credit",
            TxKind::Refund => "refund",
            TxKind::Expire => "expire",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(TxKind::Debit),
            "credit" => Ok(TxKind::Credit),
            "refund" => Ok(TxKind::Refund),
            "expire" => Ok(TxKind::Expire),
            other => Err(format!("unknown transaction kind `{other}`")),
        }
    }
}

/// Settlement state of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// The row is in force.
    Applied,
    /// A debit that has since been refunded.
    Refunded,
}

/// A ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Transaction identity.
    pub tx_id: TxId,
    /// Owning user.
    pub user_id: UserId,
    /// Signed amount; negative for debits and expiries.
    pub amount: i64,
    /// Row kind.
    pub kind: TxKind,
    /// Settlement state.
    pub status: TxStatus,
    /// Free-text reason recorded by the caller.
    pub reason: String,
    /// Synthesis job the row settles, when any.
    pub job_id: Option<JobId>,
    /// Story involved, when any.
    pub story_id: Option<StoryId>,
    /// Opaque caller metadata.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Mapping between a transaction and one lot it touched.
///
/// The amounts of all allocations of a transaction sum to the transaction
/// amount; the store rejects rows violating this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAllocation {
    /// Parent transaction.
    pub tx_id: TxId,
    /// Touched lot.
    pub lot_id: LotId,
    /// Signed amount drawn from (negative) or restored to (positive) the lot.
    pub amount: i64,
}

/// Remote-slot lifecycle state of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Sample uploaded, no remote slot.
    Recorded,
    /// A worker is creating the remote voice.
    Allocating,
    /// Remote voice exists and is usable.
    Ready,
    /// Allocated but idle since its last use.
    Cooling,
    /// Remote slot reclaimed; sample retained.
    Evicted,
    /// Fatal provider failure; operator attention needed.
    Error,
}

impl AllocationStatus {
    /// Whether the voice occupies (or is about to occupy) a remote slot.
    #[must_use]
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Allocating | AllocationStatus::Ready | AllocationStatus::Cooling
        )
    }

    /// Stable lowercase name for API payloads and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Recorded => "recorded",
            AllocationStatus::Allocating => "allocating",
            AllocationStatus::Ready => "ready",
            AllocationStatus::Cooling => "cooling",
            AllocationStatus::Evicted => "evicted",
            AllocationStatus::Error => "error",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's recorded voice sample and its remote-slot binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Voice identity.
    pub voice_id: VoiceId,
    /// Owning user.
    pub user_id: UserId,
    /// Display name, forwarded to the provider on allocation.
    pub name: String,
    /// Remote TTS provider this voice binds to.
    pub provider: Provider,
    /// Blob key of the uploaded sample.
    pub sample_blob_key: String,
    /// Size of the sample in bytes.
    pub sample_bytes: u64,
    /// Provider-side voice id; unique across voices while populated.
    pub remote_voice_id: Option<String>,
    /// Lifecycle state.
    pub allocation_status: AllocationStatus,
    /// Last time a synthesis used or requested this voice.
    pub last_used_at: Option<DateTime<Utc>>,
    /// When the current remote slot was allocated.
    pub allocated_at: Option<DateTime<Utc>>,
    /// Holder of the per-voice slot lock, when locked.
    pub slot_lock_owner: Option<Uuid>,
    /// When the slot lock lapses; stale locks are overridden.
    pub slot_lock_expires_at: Option<DateTime<Utc>>,
    /// Message of the last fatal provider failure.
    pub error_message: Option<String>,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// Kinds of slot audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotEventType {
    /// Voice entered the waiting queue.
    Queued,
    /// A worker began remote allocation.
    AllocationStarted,
    /// Remote allocation succeeded.
    AllocationCompleted,
    /// Remote allocation failed terminally.
    AllocationFailed,
    /// The slot was reclaimed.
    Evicted,
    /// A slot lock was released without a state change.
    LockReleased,
    /// Local state was repaired after remote drift.
    DriftRepaired,
}

/// One row of the slot audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEvent {
    /// Event identity.
    pub event_id: EventId,
    /// Voice concerned.
    pub voice_id: VoiceId,
    /// Owner of the voice at event time.
    pub user_id: UserId,
    /// What happened.
    pub event_type: SlotEventType,
    /// Free-text reason.
    pub reason: String,
    /// Opaque extra context.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// Event time.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a synthesis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Debited, waiting for a voice slot or a worker.
    Pending,
    /// A worker is synthesizing.
    Processing,
    /// Artifact stored.
    Ready,
    /// Terminal failure; the debit has been refunded.
    Error,
}

impl JobStatus {
    /// Stable lowercase name for API payloads and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A story-audio task and its credit charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisJob {
    /// Job identity.
    pub job_id: JobId,
    /// Requesting user.
    pub user_id: UserId,
    /// Voice to narrate with.
    pub voice_id: VoiceId,
    /// Story to narrate.
    pub story_id: StoryId,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Credits debited for this job.
    pub credits_charged: i64,
    /// Blob key of the finished audio, once ready.
    pub artifact_blob_key: Option<String>,
    /// Message of the terminal failure, if any.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A pending allocation request waiting for slot capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Provider whose pool the voice waits for.
    pub provider: Provider,
    /// Waiting voice.
    pub voice_id: VoiceId,
    /// Owner of the voice.
    pub user_id: UserId,
    /// When the entry was first enqueued; the FIFO ordering key.
    pub enqueued_at: DateTime<Utc>,
    /// How many allocation attempts the entry has been through.
    pub attempts: u32,
}

/// A story available for narration.
///
/// Story authoring and storage are external; this record carries the text
/// the coordination layer needs for pricing and synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    /// Story identity.
    pub story_id: StoryId,
    /// Display title.
    pub title: String,
    /// Full narration text.
    pub text: String,
    /// Ingestion time.
    pub created_at: DateTime<Utc>,
}
