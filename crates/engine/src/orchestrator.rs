// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Synthesis orchestration.
//!
//! `start_synthesis` is the handshake between the ledger and the slot pool:
//! price the story, find or create the job, debit idempotently, ensure the
//! voice holds a slot, then either hand the job to a synthesis worker or
//! leave it pending behind the queue. Callers poll by repeating the same
//! request; every path is idempotent: at most one debit per job, one queue
//! entry per voice, one in-flight synthesis per job.
//!
//! A debit whose pipeline terminates without an artifact is always refunded,
//! and the refund lands in the exact lots the debit consumed.

use crate::error::Error;
use crate::worker::{Task, TaskQueue};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use talecast_config::Config;
use talecast_ledger::{CreditLedger, required_credits};
use talecast_slots::{EnsureResult, ProviderError, RemoteVoiceAdapter, SlotManager};
use talecast_store::{
    AllocationStatus, BlobStore, CreditSource, JobId, JobStatus, JobStore, LedgerStore, Provider,
    SharedClock, StoryId, StoryStore, SynthesisJob, UserId, Voice, VoiceId, VoiceStore,
};

/// How often a waiting synthesis worker re-checks voice readiness.
const READINESS_POLL: Duration = Duration::from_secs(2);

/// Outcome of a synthesis request.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The artifact already exists; nothing was charged.
    AlreadyReady {
        /// Existing job.
        job_id: JobId,
        /// Blob key of the stored audio.
        artifact_blob_key: String,
        /// Remote voice binding, when the voice still holds its slot.
        remote_voice_id: Option<String>,
    },
    /// A worker is synthesizing now.
    Processing {
        /// The in-flight job.
        job_id: JobId,
    },
    /// The voice is being allocated; the job waits for it.
    AllocatingVoice {
        /// The pending job.
        job_id: JobId,
        /// FIFO rank if the voice is still queued.
        queue_position: Option<usize>,
    },
    /// The slot pool is saturated; the voice waits in the queue.
    QueuedForSlot {
        /// The pending job.
        job_id: JobId,
        /// 1-indexed FIFO rank.
        queue_position: usize,
        /// Entries waiting on the provider.
        queue_length: usize,
    },
    /// The user cannot cover the charge. Nothing was written.
    PaymentRequired {
        /// Credits the story costs.
        required: i64,
        /// Credits spendable right now.
        available: i64,
    },
    /// The voice cannot be allocated; the debit was refunded.
    VoiceUnavailable {
        /// Human-readable cause.
        reason: String,
    },
}

/// How an artifact is handed to the caller.
#[derive(Debug, Clone)]
pub enum ArtifactContent {
    /// The audio bytes, streamed by the service.
    Bytes(Vec<u8>),
    /// A directly fetchable URL minted by the blob backend.
    Url(String),
}

/// The synthesis orchestrator and voice/user service layer.
pub struct Orchestrator {
    voices: Arc<VoiceStore>,
    jobs: Arc<JobStore>,
    stories: Arc<StoryStore>,
    ledger: Arc<CreditLedger>,
    ledger_store: Arc<LedgerStore>,
    manager: Arc<SlotManager>,
    adapter: Arc<dyn RemoteVoiceAdapter>,
    blobs: Arc<dyn BlobStore>,
    tasks: Arc<TaskQueue>,
    config: Arc<Config>,
    clock: SharedClock,
    synth_inflight: Mutex<HashSet<JobId>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wires the orchestrator over the shared stores and services.
    #[must_use]
    pub fn new(
        voices: Arc<VoiceStore>,
        jobs: Arc<JobStore>,
        stories: Arc<StoryStore>,
        ledger: Arc<CreditLedger>,
        ledger_store: Arc<LedgerStore>,
        manager: Arc<SlotManager>,
        adapter: Arc<dyn RemoteVoiceAdapter>,
        blobs: Arc<dyn BlobStore>,
        tasks: Arc<TaskQueue>,
        config: Arc<Config>,
        clock: SharedClock,
    ) -> Self {
        Self {
            voices,
            jobs,
            stories,
            ledger,
            ledger_store,
            manager,
            adapter,
            blobs,
            tasks,
            config,
            clock,
            synth_inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a user on first contact, granting the configured initial
    /// credits from the `free` source.
    pub fn touch_user(&self, user_id: &UserId) {
        if !self.ledger_store.ensure_user(user_id) {
            return;
        }
        let initial = self.config.credits.initial_credits;
        if initial > 0 {
            if let Err(error) = self.ledger.grant(
                user_id,
                initial,
                CreditSource::Free,
                None,
                "signup",
                serde_json::Value::Null,
            ) {
                tracing::error!(user_id = %user_id, error = %error, "initial grant failed");
            }
        }
    }

    /// The voice, if it exists and belongs to `user_id`.
    pub fn owned_voice(&self, user_id: &UserId, voice_id: VoiceId) -> Result<Voice, Error> {
        let voice = self.voices.get(voice_id)?;
        if &voice.user_id != user_id {
            return Err(Error::Forbidden { entity: "voice", id: voice_id.to_string() });
        }
        Ok(voice)
    }

    /// All voices belonging to `user_id`.
    #[must_use]
    pub fn list_voices(&self, user_id: &UserId) -> Vec<Voice> {
        self.voices.list_for_user(user_id)
    }

    /// Stores a new voice sample and its `recorded` row.
    pub async fn create_voice(
        &self,
        user_id: &UserId,
        name: &str,
        provider: Provider,
        sample: Vec<u8>,
    ) -> Result<Voice, Error> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument { details: "voice name must not be empty".into() });
        }
        if sample.is_empty() {
            return Err(Error::InvalidArgument {
                details: "voice sample must not be empty".into(),
            });
        }
        self.touch_user(user_id);
        let voice_id = VoiceId::new();
        let sample_bytes = sample.len() as u64;
        let sample_blob_key = format!("samples/{user_id}/{voice_id}");
        self.blobs.put(&sample_blob_key, sample).await?;
        let voice = Voice {
            voice_id,
            user_id: user_id.clone(),
            name: name.to_owned(),
            provider,
            sample_blob_key,
            sample_bytes,
            remote_voice_id: None,
            allocation_status: AllocationStatus::Recorded,
            last_used_at: None,
            allocated_at: None,
            slot_lock_owner: None,
            slot_lock_expires_at: None,
            error_message: None,
            created_at: self.clock.now(),
        };
        self.voices.insert(voice.clone())?;
        tracing::info!(
            user_id = %user_id,
            voice_id = %voice_id,
            provider = provider.as_str(),
            sample_bytes,
            "voice recorded"
        );
        Ok(voice)
    }

    /// Deletes a voice and everything hanging off it: the remote slot (best
    /// effort), the queue entry, the sample blob, and stored artifacts of
    /// its jobs.
    pub async fn delete_voice(&self, user_id: &UserId, voice_id: VoiceId) -> Result<(), Error> {
        let _ = self.owned_voice(user_id, voice_id)?;
        let removed = self.manager.discard(voice_id).await?;
        self.blobs.delete(&removed.sample_blob_key).await?;
        for job in self.jobs.jobs_for_voice(voice_id) {
            if let Some(key) = &job.artifact_blob_key {
                self.blobs.delete(key).await?;
            }
        }
        tracing::info!(user_id = %user_id, voice_id = %voice_id, "voice deleted");
        Ok(())
    }

    fn dispatch_synthesize(&self, job_id: JobId) {
        if self.synth_inflight.lock().insert(job_id) {
            self.tasks.dispatch(Task::Synthesize { job_id });
        }
    }

    fn finish_synthesize(&self, job_id: JobId) {
        let _ = self.synth_inflight.lock().remove(&job_id);
    }

    /// Starts (or re-polls) synthesis of `story_id` with `voice_id`.
    pub fn start_synthesis(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
        story_id: &StoryId,
    ) -> Result<StartOutcome, Error> {
        let voice = self.owned_voice(user_id, voice_id)?;
        let story = self.stories.get(story_id)?;
        let required = required_credits(&story.text, self.config.credits.unit_size);

        let (job, created) = self.jobs.find_or_create(user_id, voice_id, story_id);
        match job.status {
            JobStatus::Ready => {
                if let Some(artifact_blob_key) = job.artifact_blob_key.clone() {
                    return Ok(StartOutcome::AlreadyReady {
                        job_id: job.job_id,
                        artifact_blob_key,
                        remote_voice_id: voice.remote_voice_id,
                    });
                }
                // Ready without an artifact is a repair case: run it again.
                let _ = self.jobs.update(job.job_id, |j| j.status = JobStatus::Pending)?;
            }
            JobStatus::Processing => {
                return Ok(StartOutcome::Processing { job_id: job.job_id });
            }
            JobStatus::Error => {
                // A failed job was refunded; polling it again is a fresh try.
                let _ = self.jobs.update(job.job_id, |j| {
                    j.status = JobStatus::Pending;
                    j.error_message = None;
                })?;
            }
            JobStatus::Pending => {}
        }

        let reason = format!("synthesis:{}", job.job_id);
        match self.ledger.debit(user_id, required, job.job_id, Some(story_id.clone()), &reason) {
            Ok(_) => {}
            Err(talecast_ledger::Error::InsufficientCredits { required, available }) => {
                if created {
                    let _ = self.jobs.remove(job.job_id);
                }
                return Ok(StartOutcome::PaymentRequired { required, available });
            }
            Err(error) => {
                if created {
                    let _ = self.jobs.remove(job.job_id);
                }
                return Err(error.into());
            }
        }
        let _ = self.jobs.update(job.job_id, |j| j.credits_charged = required)?;

        match self.manager.ensure_active(user_id, voice_id)? {
            EnsureResult::Ready { .. } => {
                let _ = self.jobs.update(job.job_id, |j| j.status = JobStatus::Processing)?;
                self.dispatch_synthesize(job.job_id);
                Ok(StartOutcome::Processing { job_id: job.job_id })
            }
            EnsureResult::Allocating { queue_position } => {
                self.dispatch_synthesize(job.job_id);
                Ok(StartOutcome::AllocatingVoice { job_id: job.job_id, queue_position })
            }
            EnsureResult::Queued { queue_position, queue_length } => {
                self.dispatch_synthesize(job.job_id);
                Ok(StartOutcome::QueuedForSlot {
                    job_id: job.job_id,
                    queue_position,
                    queue_length,
                })
            }
            EnsureResult::Failed { reason } => {
                let _ = self.ledger.refund_by_job(job.job_id, "voice_unavailable")?;
                let _ = self.jobs.update(job.job_id, |j| {
                    j.status = JobStatus::Error;
                    j.error_message = Some(reason.clone());
                })?;
                Ok(StartOutcome::VoiceUnavailable { reason })
            }
        }
    }

    /// Drives one synthesis job. Worker body.
    ///
    /// Waits (bounded) for the voice to become ready, synthesizes, persists
    /// the artifact, and cools the voice. Retryable conditions surface as
    /// errors so the runtime re-dispatches with backoff; terminal failures
    /// fail the job and refund its debit here.
    pub async fn synthesize_job(&self, job_id: JobId) -> Result<(), Error> {
        let Ok(job) = self.jobs.get(job_id) else {
            self.finish_synthesize(job_id);
            return Ok(());
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            self.finish_synthesize(job_id);
            return Ok(());
        }
        let story = self.stories.get(&job.story_id)?;

        let wait_deadline =
            tokio::time::Instant::now() + self.config.slots.allocation_wait_deadline;
        let remote_voice_id = loop {
            match self.manager.ensure_active(&job.user_id, job.voice_id)? {
                EnsureResult::Ready { remote_voice_id } => break remote_voice_id,
                EnsureResult::Failed { reason } => {
                    self.fail_job(job_id, &reason)?;
                    return Ok(());
                }
                EnsureResult::Allocating { .. } | EnsureResult::Queued { .. } => {
                    if tokio::time::Instant::now() >= wait_deadline {
                        // Do not fail the job; come back for it later.
                        return Err(Error::VoiceNotReady { job_id });
                    }
                    tokio::time::sleep(READINESS_POLL).await;
                }
            }
        };

        let _ = self.jobs.update(job_id, |j| j.status = JobStatus::Processing)?;
        let synthesized = tokio::time::timeout(
            self.config.workers.provider_call_timeout,
            self.adapter.synthesize(&remote_voice_id, &story.text),
        )
        .await;
        let audio = match synthesized {
            Err(_) => return Err(Error::Timeout { operation: "synthesize" }),
            Ok(Err(ProviderError::RemoteVoiceMissing)) => {
                // The provider dropped the voice underneath us; repair and
                // let the job re-enter through the queue.
                let _ = self.manager.repair_drift(job.voice_id)?;
                let _ = self.jobs.update(job_id, |j| j.status = JobStatus::Pending)?;
                return Err(Error::VoiceNotReady { job_id });
            }
            Ok(Err(error @ ProviderError::Retryable { .. })) => {
                return Err(Error::Provider(error));
            }
            Ok(Err(error)) => {
                self.fail_job(job_id, &error.to_string())?;
                return Ok(());
            }
            Ok(Ok(audio)) => audio,
        };

        let artifact_blob_key = format!("artifacts/{}/{}", job.user_id, job_id);
        self.blobs.put(&artifact_blob_key, audio).await?;
        let now = self.clock.now();
        let _ = self.jobs.update(job_id, |j| {
            j.status = JobStatus::Ready;
            j.artifact_blob_key = Some(artifact_blob_key.clone());
            j.error_message = None;
        })?;
        // The voice idles warm until its next use or eviction.
        if let Err(error) = self
            .voices
            .transition(job.voice_id, AllocationStatus::Cooling, |v| {
                v.last_used_at = Some(now);
            })
        {
            tracing::debug!(voice_id = %job.voice_id, error = %error, "voice left uncooled");
        }
        self.finish_synthesize(job_id);
        tracing::info!(job_id = %job_id, user_id = %job.user_id, "synthesis complete");
        Ok(())
    }

    /// Fails a job terminally and refunds its debit. Refunding is idempotent,
    /// so duplicate failure signals collapse into one refund.
    pub fn fail_job(&self, job_id: JobId, reason: &str) -> Result<(), Error> {
        let _ = self.jobs.update(job_id, |j| {
            j.status = JobStatus::Error;
            j.error_message = Some(reason.to_owned());
        })?;
        let _ = self.ledger.refund_by_job(job_id, "synthesis_failed")?;
        self.finish_synthesize(job_id);
        tracing::warn!(job_id = %job_id, reason, "synthesis failed; debit refunded");
        Ok(())
    }

    /// Absorbs a task that exhausted its retries.
    pub fn dead_letter(&self, task: &Task, error: &Error) {
        match task {
            Task::Synthesize { job_id } => {
                if let Err(inner) =
                    self.fail_job(*job_id, &format!("retries exhausted: {error}"))
                {
                    tracing::error!(job_id = %job_id, error = %inner, "dead-letter cleanup failed");
                }
            }
            Task::Allocate { voice_id, .. } => {
                if let Err(inner) = self
                    .manager
                    .abandon_allocation(*voice_id, &format!("retries exhausted: {error}"))
                {
                    tracing::error!(voice_id = %voice_id, error = %inner, "dead-letter cleanup failed");
                }
            }
            Task::ProcessQueue { .. } | Task::ReclaimIdle { .. } | Task::ExpireLots => {}
        }
    }

    /// The stored artifact for `(voice, story)` when the job is ready;
    /// `None` while the job is absent, pending, or failed.
    pub async fn fetch_artifact(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
        story_id: &StoryId,
    ) -> Result<Option<(SynthesisJob, ArtifactContent)>, Error> {
        let _ = self.owned_voice(user_id, voice_id)?;
        let Some(job) = self.jobs.find(user_id, voice_id, story_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Ready {
            return Ok(None);
        }
        let Some(key) = job.artifact_blob_key.clone() else {
            return Ok(None);
        };
        if let Some(url) = self.blobs.url_for(&key) {
            return Ok(Some((job, ArtifactContent::Url(url))));
        }
        let bytes = self.blobs.get(&key).await?;
        Ok(Some((job, ArtifactContent::Bytes(bytes))))
    }

    /// The job for `(user, voice, story)` if one exists.
    #[must_use]
    pub fn find_job(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
        story_id: &StoryId,
    ) -> Option<SynthesisJob> {
        self.jobs.find(user_id, voice_id, story_id)
    }
}
