// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Synthesis job rows, indexed by id and by `(user, voice, story)`.

use crate::clock::SharedClock;
use crate::error::Error;
use crate::model::{JobId, JobStatus, StoryId, SynthesisJob, UserId, VoiceId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct JobInner {
    jobs: HashMap<JobId, SynthesisJob>,
    by_request: HashMap<(UserId, VoiceId, StoryId), JobId>,
}

/// Store of synthesis jobs.
#[derive(Debug)]
pub struct JobStore {
    clock: SharedClock,
    inner: Mutex<JobInner>,
}

impl JobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { clock, inner: Mutex::new(JobInner::default()) }
    }

    /// Returns the job for `(user, voice, story)`, creating a `pending` row
    /// with no charge on first request. The boolean reports creation.
    pub fn find_or_create(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
        story_id: &StoryId,
    ) -> (SynthesisJob, bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let request = (user_id.clone(), voice_id, story_id.clone());
        if let Some(job_id) = inner.by_request.get(&request) {
            if let Some(job) = inner.jobs.get(job_id) {
                return (job.clone(), false);
            }
        }
        let job = SynthesisJob {
            job_id: JobId::new(),
            user_id: user_id.clone(),
            voice_id,
            story_id: story_id.clone(),
            status: JobStatus::Pending,
            credits_charged: 0,
            artifact_blob_key: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let _ = inner.by_request.insert(request, job.job_id);
        let _ = inner.jobs.insert(job.job_id, job.clone());
        (job, true)
    }

    /// A snapshot of the job.
    pub fn get(&self, job_id: JobId) -> Result<SynthesisJob, Error> {
        self.inner
            .lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound { entity: "synthesis job", id: job_id.to_string() })
    }

    /// The job for `(user, voice, story)` if one exists.
    #[must_use]
    pub fn find(
        &self,
        user_id: &UserId,
        voice_id: VoiceId,
        story_id: &StoryId,
    ) -> Option<SynthesisJob> {
        let inner = self.inner.lock();
        let job_id = inner.by_request.get(&(user_id.clone(), voice_id, story_id.clone()))?;
        inner.jobs.get(job_id).cloned()
    }

    /// Mutates the job under the store lock, refreshing `updated_at`, and
    /// returns the updated snapshot.
    pub fn update<R>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut SynthesisJob) -> R,
    ) -> Result<(R, SynthesisJob), Error> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound { entity: "synthesis job", id: job_id.to_string() })?;
        let out = f(job);
        job.updated_at = now;
        Ok((out, job.clone()))
    }

    /// Deletes a job row and its request-index entry. Used to unwind a job
    /// created by a request that was then rejected before any charge.
    pub fn remove(&self, job_id: JobId) -> Option<SynthesisJob> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.remove(&job_id)?;
        let _ = inner
            .by_request
            .remove(&(job.user_id.clone(), job.voice_id, job.story_id.clone()));
        Some(job)
    }

    /// Snapshots of all jobs referencing `voice_id`.
    #[must_use]
    pub fn jobs_for_voice(&self, voice_id: VoiceId) -> Vec<SynthesisJob> {
        self.inner.lock().jobs.values().filter(|j| j.voice_id == voice_id).cloned().collect()
    }

    /// Whether any job referencing `voice_id` is mid-synthesis.
    #[must_use]
    pub fn voice_has_processing_job(&self, voice_id: VoiceId) -> bool {
        self.inner
            .lock()
            .jobs
            .values()
            .any(|j| j.voice_id == voice_id && j.status == JobStatus::Processing)
    }
}
