// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! The elastic voice-slot manager.
//!
//! At most `slot_limit` voices per provider may sit in a slot-holding state
//! (`allocating`, `ready`, `cooling`) at any moment. The manager decides, per
//! request, whether a voice is served immediately, sent to an allocation
//! worker, or parked in the waiting queue; beats drain the queue and reclaim
//! idle slots.
//!
//! Concurrency is governed by two guards:
//! - the per-voice slot lock (TTL-based, stored on the row) serializes
//!   allocators and evictors touching one voice, across worker handoffs;
//! - a per-provider admission mutex brackets the capacity check and the
//!   `-> allocating` transition, so two requests cannot both take the last
//!   free slot.
//!
//! The active count is always derived from the voice rows, never cached.

use crate::adapter::{DeleteOutcome, ProviderError, RemoteVoiceAdapter};
use crate::error::Error;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use talecast_config::Config;
use talecast_store::{
    AllocationStatus, BlobStore, JobStore, LedgerStore, Provider, QueuePosition, SharedClock,
    SlotEventType, SlotQueue, UserId, Voice, VoiceId, VoiceStore,
};
use uuid::Uuid;

/// Outcome of [`SlotManager::ensure_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureResult {
    /// The voice holds a live remote slot; `last_used_at` was refreshed.
    Ready {
        /// Provider-side voice id to synthesize with.
        remote_voice_id: String,
    },
    /// Allocation is in flight or a worker was just dispatched.
    Allocating {
        /// FIFO rank if the voice is (still) queued.
        queue_position: Option<usize>,
    },
    /// No capacity; the voice waits in the provider queue.
    Queued {
        /// 1-indexed FIFO rank.
        queue_position: usize,
        /// Entries waiting on the provider, including this one.
        queue_length: usize,
    },
    /// The voice cannot be allocated.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

/// Hands background work to the worker runtime.
///
/// The seam keeps this crate free of the runtime; the runtime implements it
/// and tests substitute a recorder.
pub trait TaskDispatcher: Send + Sync + fmt::Debug {
    /// Dispatches an allocation worker for `voice_id`.
    ///
    /// The worker resumes the caller's slot lock through `lock_owner`, so
    /// the lock held at admission stays held until allocation finishes or
    /// its TTL lapses.
    fn dispatch_allocate(&self, voice_id: VoiceId, lock_owner: Uuid);
}

/// Operational snapshot of one provider's pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Provider this row describes.
    pub provider: Provider,
    /// Configured capacity.
    pub slot_limit: usize,
    /// Voices currently holding or acquiring a slot.
    pub active: usize,
    /// Of which mid-allocation.
    pub allocating: usize,
    /// Of which ready.
    pub ready: usize,
    /// Of which cooling.
    pub cooling: usize,
    /// Entries waiting in the queue.
    pub queue_length: usize,
    /// Age of the oldest waiting entry, in seconds.
    pub oldest_wait_seconds: Option<i64>,
}

/// The slot manager.
pub struct SlotManager {
    voices: Arc<VoiceStore>,
    queue: Arc<SlotQueue>,
    jobs: Arc<JobStore>,
    ledger: Arc<LedgerStore>,
    blobs: Arc<dyn BlobStore>,
    adapter: Arc<dyn RemoteVoiceAdapter>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: Arc<Config>,
    clock: SharedClock,
    admission: HashMap<Provider, parking_lot::Mutex<()>>,
}

impl fmt::Debug for SlotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotManager")
            .field("slot_limit", &self.config.slots.slot_limit)
            .finish_non_exhaustive()
    }
}

impl SlotManager {
    /// Wires a manager over the shared stores and adapters.
    #[must_use]
    pub fn new(
        voices: Arc<VoiceStore>,
        queue: Arc<SlotQueue>,
        jobs: Arc<JobStore>,
        ledger: Arc<LedgerStore>,
        blobs: Arc<dyn BlobStore>,
        adapter: Arc<dyn RemoteVoiceAdapter>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: Arc<Config>,
        clock: SharedClock,
    ) -> Self {
        let admission =
            Provider::ALL.iter().map(|p| (*p, parking_lot::Mutex::new(()))).collect();
        Self {
            voices,
            queue,
            jobs,
            ledger,
            blobs,
            adapter,
            dispatcher,
            config,
            clock,
            admission,
        }
    }

    fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.slots.slot_lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    fn warm_hold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.slots.warm_hold)
            .unwrap_or_else(|_| chrono::Duration::seconds(900))
    }

    fn enqueue_waiting(
        &self,
        provider: Provider,
        voice_id: VoiceId,
        user_id: &UserId,
    ) -> QueuePosition {
        let newly_queued = self.queue.position(voice_id).is_none();
        let position = self.queue.enqueue(provider, voice_id, user_id.clone());
        if newly_queued {
            let _ = self.voices.record_event(
                voice_id,
                user_id.clone(),
                SlotEventType::Queued,
                "waiting for slot capacity",
                serde_json::json!({ "position": position.position }),
            );
            tracing::info!(
                voice_id = %voice_id,
                provider = provider.as_str(),
                position = position.position,
                "voice queued for slot"
            );
        }
        position
    }

    fn failed(voice: &Voice) -> EnsureResult {
        EnsureResult::Failed {
            reason: voice
                .error_message
                .clone()
                .unwrap_or_else(|| "voice allocation previously failed".to_owned()),
        }
    }

    /// Makes `voice_id` usable for synthesis, or reports how far away it is.
    ///
    /// The single entry point used by the orchestrator. Safe to call
    /// repeatedly and concurrently: one `-> allocating` transition happens
    /// per allocation cycle, and a voice is never queued twice.
    pub fn ensure_active(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
    ) -> Result<EnsureResult, Error> {
        let now = self.clock.now();
        let voice = self.voices.get(voice_id)?;
        if voice.allocation_status == AllocationStatus::Error {
            return Ok(Self::failed(&voice));
        }
        if voice.sample_blob_key.is_empty() {
            return Ok(EnsureResult::Failed { reason: "voice has no recorded sample".to_owned() });
        }

        let owner = Uuid::new_v4();
        if !self.voices.try_acquire_slot_lock(voice_id, owner, self.lock_ttl())? {
            // A live allocator or evictor owns the voice right now.
            let current = self.voices.get(voice_id)?;
            return Ok(match current.allocation_status {
                AllocationStatus::Error => Self::failed(&current),
                AllocationStatus::Recorded | AllocationStatus::Evicted => {
                    let position = self.enqueue_waiting(current.provider, voice_id, user_id);
                    EnsureResult::Queued {
                        queue_position: position.position,
                        queue_length: position.length,
                    }
                }
                AllocationStatus::Allocating
                | AllocationStatus::Ready
                | AllocationStatus::Cooling => {
                    EnsureResult::Allocating { queue_position: self.queue.position(voice_id) }
                }
            });
        }

        // Slot lock held; the row cannot change under us.
        let current = self.voices.get(voice_id)?;
        match current.allocation_status {
            AllocationStatus::Error => {
                let _ = self.voices.release_slot_lock(voice_id, owner)?;
                Ok(Self::failed(&current))
            }
            AllocationStatus::Ready | AllocationStatus::Cooling => {
                if current.remote_voice_id.is_none() {
                    // Allocated on paper but unbound: repair and requeue.
                    let position = self.repair_drift(voice_id)?;
                    let _ = self.voices.release_slot_lock(voice_id, owner)?;
                    return Ok(EnsureResult::Queued {
                        queue_position: position.position,
                        queue_length: position.length,
                    });
                }
                let refreshed = self.voices.transition(voice_id, AllocationStatus::Ready, |v| {
                    v.last_used_at = Some(now);
                })?;
                let _ = self.voices.release_slot_lock(voice_id, owner)?;
                match refreshed.remote_voice_id {
                    Some(remote_voice_id) => Ok(EnsureResult::Ready { remote_voice_id }),
                    None => Ok(EnsureResult::Allocating { queue_position: None }),
                }
            }
            AllocationStatus::Allocating => {
                // The previous allocator's lock lapsed; hand our lock to a
                // fresh worker.
                self.dispatcher.dispatch_allocate(voice_id, owner);
                Ok(EnsureResult::Allocating { queue_position: None })
            }
            AllocationStatus::Recorded | AllocationStatus::Evicted => {
                let provider = current.provider;
                let admitted = {
                    let _admission = self
                        .admission
                        .get(&provider)
                        .map(parking_lot::Mutex::lock);
                    if self.voices.count_active(provider) < self.config.slots.slot_limit {
                        let _ = self.voices.transition(
                            voice_id,
                            AllocationStatus::Allocating,
                            |_| {},
                        )?;
                        true
                    } else {
                        false
                    }
                };
                if admitted {
                    let _ = self.queue.remove(voice_id);
                    self.dispatcher.dispatch_allocate(voice_id, owner);
                    Ok(EnsureResult::Allocating { queue_position: None })
                } else {
                    let _ = self.voices.release_slot_lock(voice_id, owner)?;
                    let position = self.enqueue_waiting(provider, voice_id, user_id);
                    Ok(EnsureResult::Queued {
                        queue_position: position.position,
                        queue_length: position.length,
                    })
                }
            }
        }
    }

    /// Creates the remote voice for an admitted allocation. Worker body.
    ///
    /// `lock_owner` is the slot-lock token minted at admission; the lock is
    /// released on every exit path. Retryable failures surface as errors so
    /// the worker runtime re-dispatches with backoff; terminal failures are
    /// absorbed after marking the voice `error`.
    pub async fn allocate(&self, voice_id: VoiceId, lock_owner: Uuid) -> Result<(), Error> {
        if !self.voices.try_acquire_slot_lock(voice_id, lock_owner, self.lock_ttl())? {
            return Err(Error::LockBusy { voice_id });
        }
        let outcome = self.allocate_under_lock(voice_id).await;
        let _ = self.voices.release_slot_lock(voice_id, lock_owner)?;
        if let Err(error) = &outcome {
            if error.is_retryable() {
                if let Ok(voice) = self.voices.get(voice_id) {
                    let _ = self.voices.record_event(
                        voice_id,
                        voice.user_id,
                        SlotEventType::LockReleased,
                        format!("allocation attempt yielded: {error}"),
                        serde_json::Value::Null,
                    );
                }
            }
        }
        outcome
    }

    async fn allocate_under_lock(&self, voice_id: VoiceId) -> Result<(), Error> {
        let now = self.clock.now();
        let voice = self.voices.get(voice_id)?;
        match voice.allocation_status {
            AllocationStatus::Ready | AllocationStatus::Cooling | AllocationStatus::Error => {
                // Someone else finished (or failed) this voice already.
                return Ok(());
            }
            AllocationStatus::Allocating
            | AllocationStatus::Recorded
            | AllocationStatus::Evicted => {}
        }
        if voice.remote_voice_id.is_some() {
            // A previous attempt created the remote voice and died before
            // finishing the transition.
            let _ = self.voices.transition(voice_id, AllocationStatus::Ready, |v| {
                v.allocated_at.get_or_insert(now);
                v.last_used_at = Some(now);
            })?;
            return Ok(());
        }
        if voice.allocation_status != AllocationStatus::Allocating {
            let _ = self.voices.transition(voice_id, AllocationStatus::Allocating, |_| {})?;
        }
        let _ = self.voices.record_event(
            voice_id,
            voice.user_id.clone(),
            SlotEventType::AllocationStarted,
            "remote allocation started",
            serde_json::Value::Null,
        );

        let sample = match self.blobs.get(&voice.sample_blob_key).await {
            Ok(bytes) => bytes,
            Err(error) => {
                return self.fail_allocation(&voice, format!("sample unavailable: {error}"));
            }
        };
        let created = tokio::time::timeout(
            self.config.workers.provider_call_timeout,
            self.adapter.create_voice(&sample, &voice.name),
        )
        .await;
        let remote_id = match created {
            Err(_) => return Err(Error::Timeout { operation: "create_voice" }),
            Ok(Err(error @ ProviderError::Retryable { .. })) => {
                return Err(Error::Provider(error));
            }
            Ok(Err(error)) => {
                return self.fail_allocation(&voice, error.to_string());
            }
            Ok(Ok(remote_id)) => remote_id,
        };

        let _ = self.voices.bind_remote_id(voice_id, &remote_id)?;
        let _ = self.voices.transition(voice_id, AllocationStatus::Ready, |v| {
            v.allocated_at = Some(now);
            v.last_used_at = Some(now);
            v.error_message = None;
        })?;
        let _ = self.voices.record_event(
            voice_id,
            voice.user_id.clone(),
            SlotEventType::AllocationCompleted,
            "remote voice created",
            serde_json::json!({ "remote_voice_id": remote_id }),
        );
        tracing::info!(
            voice_id = %voice_id,
            provider = voice.provider.as_str(),
            remote_voice_id = %remote_id,
            "voice slot allocated"
        );
        Ok(())
    }

    fn fail_allocation(&self, voice: &Voice, message: String) -> Result<(), Error> {
        let _ = self.voices.transition(voice.voice_id, AllocationStatus::Error, |v| {
            v.error_message = Some(message.clone());
        })?;
        let _ = self.voices.record_event(
            voice.voice_id,
            voice.user_id.clone(),
            SlotEventType::AllocationFailed,
            message.clone(),
            serde_json::Value::Null,
        );
        let _ = self.queue.remove(voice.voice_id);
        tracing::error!(
            voice_id = %voice.voice_id,
            provider = voice.provider.as_str(),
            error = %message,
            "voice allocation failed terminally"
        );
        Ok(())
    }

    /// Drains the provider's waiting queue into free capacity. Beat body.
    ///
    /// At most `max_dispatch_per_cycle` entries are served per call so one
    /// busy provider cannot starve the others.
    pub fn process_queue(&self, provider: Provider) -> Result<usize, Error> {
        let mut dispatched = 0;
        for _ in 0..self.config.slots.max_dispatch_per_cycle {
            let free = self
                .config
                .slots
                .slot_limit
                .saturating_sub(self.voices.count_active(provider));
            if free == 0 || self.queue.is_empty(provider) {
                break;
            }
            let Some(entry) = self.queue.pop_ready(provider, 1).into_iter().next() else {
                break;
            };
            match self.ensure_active(&entry.user_id, entry.voice_id) {
                // Capacity evaporated between the check and admission; the
                // voice went back to the queue inside ensure_active.
                Ok(EnsureResult::Queued { .. }) => {}
                Ok(EnsureResult::Failed { reason }) => {
                    tracing::warn!(
                        voice_id = %entry.voice_id,
                        reason,
                        "dropping unallocatable voice from queue"
                    );
                }
                Ok(_) => dispatched += 1,
                Err(error) => {
                    let _ = self.queue.requeue(entry);
                    return Err(error);
                }
            }
        }
        Ok(dispatched)
    }

    /// Evicts idle voices to free capacity for the waiting queue. Beat body.
    ///
    /// `requested` caps how many slots to free; by default the current queue
    /// length. Never touches voices inside the warm hold, under a live slot
    /// lock, or referenced by a processing job. Candidates go zero-balance
    /// owners first, then oldest `last_used_at`, then smallest voice id.
    pub async fn reclaim_idle(
        &self,
        provider: Provider,
        requested: Option<usize>,
    ) -> Result<usize, Error> {
        let wanted = requested.unwrap_or_else(|| self.queue.len(provider));
        if wanted == 0 {
            return Ok(0);
        }
        let mut candidates = self.voices.eviction_candidates(provider, self.warm_hold());
        candidates.sort_by_key(|v| {
            let has_balance = self.ledger.cached_balance(&v.user_id).unwrap_or(0) > 0;
            (
                has_balance,
                v.last_used_at.unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC),
                v.voice_id,
            )
        });

        let threshold = self.clock.now() - self.warm_hold();
        let mut evicted = 0;
        for candidate in candidates {
            if evicted >= wanted {
                break;
            }
            let voice_id = candidate.voice_id;
            let owner = Uuid::new_v4();
            if !self.voices.try_acquire_slot_lock(voice_id, owner, self.lock_ttl())? {
                continue;
            }
            let outcome = self.evict_under_lock(voice_id, threshold).await;
            let _ = self.voices.release_slot_lock(voice_id, owner)?;
            if outcome? {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(
                provider = provider.as_str(),
                evicted,
                "reclaimed idle voice slots"
            );
            let _ = self.process_queue(provider)?;
        }
        Ok(evicted)
    }

    async fn evict_under_lock(
        &self,
        voice_id: VoiceId,
        idle_threshold: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, Error> {
        // Re-verify eligibility now that the lock is ours.
        let voice = self.voices.get(voice_id)?;
        let still_idle = voice.last_used_at.is_none_or(|used| used < idle_threshold);
        let evictable = matches!(
            voice.allocation_status,
            AllocationStatus::Ready | AllocationStatus::Cooling
        );
        if !evictable || !still_idle || self.jobs.voice_has_processing_job(voice_id) {
            return Ok(false);
        }
        if let Some(remote_id) = &voice.remote_voice_id {
            let deleted = tokio::time::timeout(
                self.config.workers.provider_call_timeout,
                self.adapter.delete_voice(remote_id),
            )
            .await;
            match deleted {
                Ok(Ok(DeleteOutcome::Deleted | DeleteOutcome::NotFound)) => {}
                Ok(Err(error)) => {
                    tracing::warn!(
                        voice_id = %voice_id,
                        error = %error,
                        "remote delete failed; skipping eviction this cycle"
                    );
                    return Ok(false);
                }
                Err(_) => {
                    tracing::warn!(
                        voice_id = %voice_id,
                        "remote delete timed out; skipping eviction this cycle"
                    );
                    return Ok(false);
                }
            }
        }
        let _ = self.voices.clear_remote_id(voice_id)?;
        let _ = self.voices.transition(voice_id, AllocationStatus::Evicted, |v| {
            v.allocated_at = None;
        })?;
        let _ = self.voices.record_event(
            voice_id,
            voice.user_id.clone(),
            SlotEventType::Evicted,
            "idle past warm hold",
            serde_json::Value::Null,
        );
        Ok(true)
    }

    /// Marks an allocation that exhausted its retries as failed, releasing
    /// the slot lock and the queue entry it held. No-op unless the voice is
    /// still `allocating`.
    pub fn abandon_allocation(&self, voice_id: VoiceId, reason: &str) -> Result<(), Error> {
        let (_, voice) = self.voices.update(voice_id, |v| {
            v.slot_lock_owner = None;
            v.slot_lock_expires_at = None;
        })?;
        if voice.allocation_status != AllocationStatus::Allocating {
            return Ok(());
        }
        self.fail_allocation(&voice, reason.to_owned())
    }

    /// Repairs local state after the provider lost a voice: clears the
    /// binding, drops back to `recorded`, and re-enters the queue.
    pub fn repair_drift(&self, voice_id: VoiceId) -> Result<QueuePosition, Error> {
        let voice = self.voices.clear_remote_id(voice_id)?;
        let _ = self.voices.transition(voice_id, AllocationStatus::Recorded, |v| {
            v.allocated_at = None;
        })?;
        let position = self.queue.enqueue(voice.provider, voice_id, voice.user_id.clone());
        let _ = self.voices.record_event(
            voice_id,
            voice.user_id.clone(),
            SlotEventType::DriftRepaired,
            "remote voice disappeared; requeued",
            serde_json::Value::Null,
        );
        tracing::warn!(
            voice_id = %voice_id,
            provider = voice.provider.as_str(),
            "remote voice drifted; repaired and requeued"
        );
        Ok(position)
    }

    /// Tears a voice down everywhere the manager owns state: waiting queue,
    /// remote slot (best effort), voice row. Returns the removed snapshot so
    /// the caller can cascade blob cleanup.
    pub async fn discard(&self, voice_id: VoiceId) -> Result<Voice, Error> {
        let _ = self.queue.remove(voice_id);
        let voice = self.voices.get(voice_id)?;
        if let Some(remote_id) = &voice.remote_voice_id {
            let deleted = tokio::time::timeout(
                self.config.workers.provider_call_timeout,
                self.adapter.delete_voice(remote_id),
            )
            .await;
            if let Ok(Err(error)) = deleted {
                tracing::warn!(
                    voice_id = %voice_id,
                    error = %error,
                    "remote delete during discard failed; continuing"
                );
            }
        }
        Ok(self.voices.remove(voice_id)?)
    }

    /// 1-indexed FIFO rank of a waiting voice, `None` when not queued.
    #[must_use]
    pub fn queue_position(&self, voice_id: VoiceId) -> Option<usize> {
        self.queue.position(voice_id)
    }

    /// Operational snapshot across all providers, for the admin surface.
    #[must_use]
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        Provider::ALL
            .iter()
            .map(|provider| {
                let counts = self.voices.status_counts(*provider);
                let count = |status: AllocationStatus| counts.get(&status).copied().unwrap_or(0);
                let allocating = count(AllocationStatus::Allocating);
                let ready = count(AllocationStatus::Ready);
                let cooling = count(AllocationStatus::Cooling);
                PoolStatus {
                    provider: *provider,
                    slot_limit: self.config.slots.slot_limit,
                    active: allocating + ready + cooling,
                    allocating,
                    ready,
                    cooling,
                    queue_length: self.queue.len(*provider),
                    oldest_wait_seconds: self.queue.oldest_wait(*provider).map(|d| d.num_seconds()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockProvider;
    use chrono::Duration;
    use parking_lot::Mutex;
    use talecast_store::{Clock, JobStatus, ManualClock, MemoryBlobStore, StoryId, Voice};

    #[derive(Debug, Default)]
    struct RecordingDispatcher {
        tasks: Mutex<Vec<(VoiceId, Uuid)>>,
    }

    impl RecordingDispatcher {
        fn take(&self) -> Vec<(VoiceId, Uuid)> {
            self.tasks.lock().drain(..).collect()
        }

        fn count(&self) -> usize {
            self.tasks.lock().len()
        }
    }

    impl TaskDispatcher for RecordingDispatcher {
        fn dispatch_allocate(&self, voice_id: VoiceId, lock_owner: Uuid) {
            self.tasks.lock().push((voice_id, lock_owner));
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        voices: Arc<VoiceStore>,
        queue: Arc<SlotQueue>,
        jobs: Arc<JobStore>,
        ledger: Arc<LedgerStore>,
        blobs: Arc<MemoryBlobStore>,
        provider: Arc<MockProvider>,
        dispatcher: Arc<RecordingDispatcher>,
        manager: Arc<SlotManager>,
    }

    fn fixture(slot_limit: usize) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let voices = Arc::new(VoiceStore::new(clock.clone()));
        let queue = Arc::new(SlotQueue::new(clock.clone()));
        let jobs = Arc::new(JobStore::new(clock.clone()));
        let ledger = Arc::new(LedgerStore::new(clock.clone()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let provider = Arc::new(MockProvider::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut config = Config::default();
        config.slots.slot_limit = slot_limit;
        let manager = Arc::new(SlotManager::new(
            voices.clone(),
            queue.clone(),
            jobs.clone(),
            ledger.clone(),
            blobs.clone(),
            provider.clone(),
            dispatcher.clone(),
            Arc::new(config),
            clock.clone(),
        ));
        Fixture { clock, voices, queue, jobs, ledger, blobs, provider, dispatcher, manager }
    }

    async fn add_voice(f: &Fixture, user: &str) -> VoiceId {
        let voice_id = VoiceId::new();
        let key = format!("samples/{voice_id}");
        f.blobs.put(&key, b"sample-bytes".to_vec()).await.unwrap();
        f.voices
            .insert(Voice {
                voice_id,
                user_id: UserId::from(user),
                name: format!("voice-{user}"),
                provider: Provider::ElevenLabs,
                sample_blob_key: key,
                sample_bytes: 12,
                remote_voice_id: None,
                allocation_status: AllocationStatus::Recorded,
                last_used_at: None,
                allocated_at: None,
                slot_lock_owner: None,
                slot_lock_expires_at: None,
                error_message: None,
                created_at: f.clock.now(),
            })
            .unwrap();
        voice_id
    }

    async fn make_ready(f: &Fixture, user: &str) -> VoiceId {
        let voice_id = add_voice(f, user).await;
        let result = f.manager.ensure_active(&UserId::from(user), voice_id).unwrap();
        assert!(matches!(result, EnsureResult::Allocating { .. }));
        let (dispatched, owner) = f.dispatcher.take().pop().unwrap();
        assert_eq!(dispatched, voice_id);
        f.manager.allocate(voice_id, owner).await.unwrap();
        voice_id
    }

    fn set_balance(f: &Fixture, user: &str, balance: i64) {
        let now = f.clock.now();
        f.ledger.with_user(&UserId::from(user), |state| {
            state.set_cached_balance(balance, now);
        });
    }

    #[tokio::test]
    async fn ensure_admits_once_and_allocate_completes() {
        let f = fixture(2);
        let user = UserId::from("u1");
        let voice_id = add_voice(&f, "u1").await;

        let first = f.manager.ensure_active(&user, voice_id).unwrap();
        assert!(matches!(first, EnsureResult::Allocating { queue_position: None }));
        assert_eq!(f.voices.get(voice_id).unwrap().allocation_status, AllocationStatus::Allocating);

        // A second caller sees the allocation in flight; no second worker,
        // no queue entry.
        let second = f.manager.ensure_active(&user, voice_id).unwrap();
        assert!(matches!(second, EnsureResult::Allocating { .. }));
        assert_eq!(f.dispatcher.count(), 1);
        assert_eq!(f.queue.len(Provider::ElevenLabs), 0);

        let (_, owner) = f.dispatcher.take().pop().unwrap();
        f.manager.allocate(voice_id, owner).await.unwrap();
        let voice = f.voices.get(voice_id).unwrap();
        assert_eq!(voice.allocation_status, AllocationStatus::Ready);
        assert!(voice.remote_voice_id.is_some());
        assert!(voice.slot_lock_owner.is_none());

        let ready = f.manager.ensure_active(&user, voice_id).unwrap();
        assert!(matches!(ready, EnsureResult::Ready { .. }));

        let kinds: Vec<SlotEventType> =
            f.voices.events_for(voice_id).iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&SlotEventType::AllocationStarted));
        assert!(kinds.contains(&SlotEventType::AllocationCompleted));
    }

    #[tokio::test]
    async fn concurrent_ensure_calls_admit_a_single_allocator() {
        let f = fixture(2);
        let voice_id = add_voice(&f, "u1").await;
        let user = UserId::from("u1");

        // Real racers on OS threads; ensure_active itself is synchronous.
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&f.manager);
                let barrier = Arc::clone(&barrier);
                let user = user.clone();
                std::thread::spawn(move || {
                    let _ = barrier.wait();
                    manager.ensure_active(&user, voice_id).unwrap()
                })
            })
            .collect();
        let results: Vec<EnsureResult> =
            racers.into_iter().map(|racer| racer.join().unwrap()).collect();

        // Whatever the interleaving, nobody failed or saw Ready, the slot
        // lock let exactly one racer through admission, and exactly one
        // worker was dispatched.
        assert!(results.iter().all(|result| matches!(
            result,
            EnsureResult::Allocating { .. } | EnsureResult::Queued { .. }
        )));
        assert_eq!(f.dispatcher.count(), 1);
        assert_eq!(
            f.voices.get(voice_id).unwrap().allocation_status,
            AllocationStatus::Allocating
        );
        assert_eq!(f.voices.count_active(Provider::ElevenLabs), 1);
        // The queue deduplicates by voice, so the loser left at most one
        // (stale, consumer-tolerated) entry behind.
        assert!(f.queue.len(Provider::ElevenLabs) <= 1);

        // Finishing the single dispatched worker creates exactly one remote
        // voice.
        let (dispatched, owner) = f.dispatcher.take().pop().unwrap();
        assert_eq!(dispatched, voice_id);
        f.manager.allocate(voice_id, owner).await.unwrap();
        assert_eq!(f.provider.voice_count(), 1);
        let (creates, _, _) = f.provider.call_counts();
        assert_eq!(creates, 1);
        assert!(matches!(
            f.manager.ensure_active(&user, voice_id).unwrap(),
            EnsureResult::Ready { .. }
        ));
    }

    #[tokio::test]
    async fn saturation_parks_the_overflow_voice() {
        let f = fixture(2);
        let _v1 = make_ready(&f, "u1").await;
        let _v2 = make_ready(&f, "u2").await;
        let v3 = add_voice(&f, "u3").await;

        let result = f.manager.ensure_active(&UserId::from("u3"), v3).unwrap();
        assert_eq!(result, EnsureResult::Queued { queue_position: 1, queue_length: 1 });

        // Idempotent: same position, still one entry, no dispatch.
        let again = f.manager.ensure_active(&UserId::from("u3"), v3).unwrap();
        assert_eq!(again, EnsureResult::Queued { queue_position: 1, queue_length: 1 });
        assert_eq!(f.queue.len(Provider::ElevenLabs), 1);
        assert_eq!(f.dispatcher.count(), 0);
        assert_eq!(f.voices.count_active(Provider::ElevenLabs), 2);
    }

    #[tokio::test]
    async fn reclaim_prefers_zero_balance_owners_and_drains_the_queue() {
        let f = fixture(2);
        let v1 = make_ready(&f, "u1").await;
        let v2 = make_ready(&f, "u2").await;
        set_balance(&f, "u1", 0);
        set_balance(&f, "u2", 7);

        let v3 = add_voice(&f, "u3").await;
        let _ = f.manager.ensure_active(&UserId::from("u3"), v3).unwrap();

        f.clock.advance(Duration::seconds(901));
        let evicted = f.manager.reclaim_idle(Provider::ElevenLabs, None).await.unwrap();
        assert_eq!(evicted, 1);

        // The zero-balance owner's voice went first.
        let gone = f.voices.get(v1).unwrap();
        assert_eq!(gone.allocation_status, AllocationStatus::Evicted);
        assert!(gone.remote_voice_id.is_none());
        assert_eq!(f.voices.get(v2).unwrap().allocation_status, AllocationStatus::Ready);
        assert_eq!(f.provider.voice_count(), 1);

        // The freed slot was handed to the waiting voice.
        assert_eq!(f.voices.get(v3).unwrap().allocation_status, AllocationStatus::Allocating);
        assert_eq!(f.queue.len(Provider::ElevenLabs), 0);
        assert_eq!(f.dispatcher.count(), 1);

        let kinds: Vec<SlotEventType> =
            f.voices.events_for(v1).iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&SlotEventType::Evicted));
    }

    #[tokio::test]
    async fn warm_hold_protects_recently_used_voices() {
        let f = fixture(1);
        let v1 = make_ready(&f, "u1").await;
        let v2 = add_voice(&f, "u2").await;
        let _ = f.manager.ensure_active(&UserId::from("u2"), v2).unwrap();

        let evicted = f.manager.reclaim_idle(Provider::ElevenLabs, None).await.unwrap();
        assert_eq!(evicted, 0);
        assert_eq!(f.voices.get(v1).unwrap().allocation_status, AllocationStatus::Ready);
        assert_eq!(f.queue.len(Provider::ElevenLabs), 1);
    }

    #[tokio::test]
    async fn in_flight_synthesis_shields_a_voice_from_eviction() {
        let f = fixture(1);
        let v1 = make_ready(&f, "u1").await;
        let (job, _) = f.jobs.find_or_create(&UserId::from("u1"), v1, &StoryId::from("s1"));
        let _ = f.jobs.update(job.job_id, |j| j.status = JobStatus::Processing).unwrap();

        let v2 = add_voice(&f, "u2").await;
        let _ = f.manager.ensure_active(&UserId::from("u2"), v2).unwrap();
        f.clock.advance(Duration::seconds(901));

        let evicted = f.manager.reclaim_idle(Provider::ElevenLabs, None).await.unwrap();
        assert_eq!(evicted, 0);
        assert_eq!(f.voices.get(v1).unwrap().allocation_status, AllocationStatus::Ready);
    }

    #[tokio::test]
    async fn terminal_allocation_failure_marks_the_voice() {
        let f = fixture(2);
        let voice_id = add_voice(&f, "u1").await;
        f.provider.fail_next_create(ProviderError::Fatal { details: "sample rejected".to_owned() });

        let _ = f.manager.ensure_active(&UserId::from("u1"), voice_id).unwrap();
        let (_, owner) = f.dispatcher.take().pop().unwrap();
        f.manager.allocate(voice_id, owner).await.unwrap();

        let voice = f.voices.get(voice_id).unwrap();
        assert_eq!(voice.allocation_status, AllocationStatus::Error);
        assert!(voice.error_message.is_some());

        let result = f.manager.ensure_active(&UserId::from("u1"), voice_id).unwrap();
        assert!(matches!(result, EnsureResult::Failed { .. }));

        let kinds: Vec<SlotEventType> =
            f.voices.events_for(voice_id).iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&SlotEventType::AllocationFailed));
    }

    #[tokio::test]
    async fn retryable_allocation_failure_leaves_the_voice_allocating() {
        let f = fixture(2);
        let voice_id = add_voice(&f, "u1").await;
        f.provider.fail_next_create(ProviderError::Retryable { details: "503".to_owned() });

        let _ = f.manager.ensure_active(&UserId::from("u1"), voice_id).unwrap();
        let (_, owner) = f.dispatcher.take().pop().unwrap();

        let err = f.manager.allocate(voice_id, owner).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.voices.get(voice_id).unwrap().allocation_status, AllocationStatus::Allocating);

        // The runtime re-dispatches with the same lock token; the retry wins.
        f.manager.allocate(voice_id, owner).await.unwrap();
        assert_eq!(f.voices.get(voice_id).unwrap().allocation_status, AllocationStatus::Ready);
    }

    #[tokio::test]
    async fn drift_repair_requeues_the_voice() {
        let f = fixture(2);
        let voice_id = make_ready(&f, "u1").await;
        let remote_id = f.voices.get(voice_id).unwrap().remote_voice_id.unwrap();
        f.provider.drop_remote_voice(&remote_id);

        let position = f.manager.repair_drift(voice_id).unwrap();
        assert_eq!(position.position, 1);

        let voice = f.voices.get(voice_id).unwrap();
        assert_eq!(voice.allocation_status, AllocationStatus::Recorded);
        assert!(voice.remote_voice_id.is_none());
        assert_eq!(f.queue.position(voice_id), Some(1));

        let kinds: Vec<SlotEventType> =
            f.voices.events_for(voice_id).iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&SlotEventType::DriftRepaired));
    }

    #[tokio::test]
    async fn discard_tears_down_queue_remote_and_row() {
        let f = fixture(2);
        let voice_id = make_ready(&f, "u1").await;
        assert_eq!(f.provider.voice_count(), 1);

        let removed = f.manager.discard(voice_id).await.unwrap();
        assert_eq!(removed.voice_id, voice_id);
        assert_eq!(f.provider.voice_count(), 0);
        assert!(f.voices.get(voice_id).is_err());
        assert!(f.queue.position(voice_id).is_none());
    }

    #[tokio::test]
    async fn pool_status_reports_per_provider() {
        let f = fixture(2);
        let _v1 = make_ready(&f, "u1").await;
        let v2 = add_voice(&f, "u2").await;
        let _v2r = f.manager.ensure_active(&UserId::from("u2"), v2).unwrap();
        let v3 = add_voice(&f, "u3").await;
        let _ = f.manager.ensure_active(&UserId::from("u3"), v3).unwrap();

        let status = f.manager.pool_status();
        let eleven = status.iter().find(|s| s.provider == Provider::ElevenLabs).unwrap();
        assert_eq!(eleven.slot_limit, 2);
        assert_eq!(eleven.active, 2);
        assert_eq!(eleven.ready, 1);
        assert_eq!(eleven.allocating, 1);
        assert_eq!(eleven.queue_length, 1);

        let cartesia = status.iter().find(|s| s.provider == Provider::Cartesia).unwrap();
        assert_eq!(cartesia.active, 0);
        assert_eq!(cartesia.queue_length, 0);
    }
}
