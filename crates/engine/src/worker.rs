// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Background worker runtime.
//!
//! Work is a typed [`Task`] stream over a bounded MPMC channel. A pool of
//! worker tasks consumes it in parallel; ordering per voice is provided by
//! the slot locks, not by the channel. Retryable failures are re-dispatched
//! with jittered exponential backoff up to `max_retries`, then dead-lettered
//! to the orchestrator (which fails the owning job and refunds its debit).
//!
//! A beat task feeds the periodic work: queue drain per provider, idle
//! reclaim, and the daily lot-expiration sweep.
//!
//! Every task runs under a deadline. A task killed by its deadline does not
//! unwind state by hand; the slot locks it held lapse via their TTL, which
//! is the crash-safe release path.

use crate::error::Error;
use crate::orchestrator::Orchestrator;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use talecast_config::{Config, WorkerSettings};
use talecast_ledger::CreditLedger;
use talecast_slots::{SlotManager, TaskDispatcher};
use talecast_store::{JobId, Provider, VoiceId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One unit of background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Create the remote voice for an admitted allocation.
    Allocate {
        /// Voice to allocate.
        voice_id: VoiceId,
        /// Slot-lock token minted at admission.
        lock_owner: Uuid,
    },
    /// Drive one synthesis job to completion.
    Synthesize {
        /// Job to synthesize.
        job_id: JobId,
    },
    /// Drain the provider's waiting queue into free capacity.
    ProcessQueue {
        /// Provider whose queue to drain.
        provider: Provider,
    },
    /// Evict idle voices to make room for the waiting queue.
    ReclaimIdle {
        /// Provider whose pool to reclaim.
        provider: Provider,
    },
    /// Zero all lapsed credit lots.
    ExpireLots,
}

impl Task {
    /// Stable task name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Allocate { .. } => "allocate",
            Task::Synthesize { .. } => "synthesize",
            Task::ProcessQueue { .. } => "process_queue",
            Task::ReclaimIdle { .. } => "reclaim_idle",
            Task::ExpireLots => "expire_lots",
        }
    }
}

/// A task plus its delivery attempt counter.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The work.
    pub task: Task,
    /// Zero-based attempt number.
    pub attempt: u32,
}

/// Producer half of the task stream.
///
/// Cheap to clone behind an `Arc`; the orchestrator, the slot manager (via
/// [`TaskDispatcher`]) and the beats all dispatch through one instance.
#[derive(Debug)]
pub struct TaskQueue {
    tx: async_channel::Sender<Envelope>,
}

impl TaskQueue {
    /// Creates the task stream with the given capacity.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Arc<Self>, async_channel::Receiver<Envelope>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Arc::new(Self { tx }), rx)
    }

    /// Dispatches fresh work.
    pub fn dispatch(&self, task: Task) {
        self.send(Envelope { task, attempt: 0 });
    }

    /// Re-dispatches work after a retryable failure.
    pub fn redispatch(&self, task: Task, attempt: u32) {
        self.send(Envelope { task, attempt });
    }

    /// Whether the consumer side is still attached. Readiness signal.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, envelope: Envelope) {
        // A full queue sheds load instead of blocking request paths; dropped
        // allocations recover through lock TTLs and the next poll or beat.
        if let Err(error) = self.tx.try_send(envelope) {
            let envelope = error.into_inner();
            tracing::error!(
                task = envelope.task.kind(),
                attempt = envelope.attempt,
                "task queue full or closed; dropping task"
            );
        }
    }
}

impl TaskDispatcher for TaskQueue {
    fn dispatch_allocate(&self, voice_id: VoiceId, lock_owner: Uuid) {
        self.dispatch(Task::Allocate { voice_id, lock_owner });
    }
}

/// Everything a worker needs to execute tasks.
#[derive(Clone)]
pub struct TaskContext {
    /// Producer handle, for retry re-dispatch.
    pub tasks: Arc<TaskQueue>,
    /// Orchestrator, for synthesis tasks and dead-lettering.
    pub orchestrator: Arc<Orchestrator>,
    /// Slot manager, for allocation and pool beats.
    pub manager: Arc<SlotManager>,
    /// Ledger, for the expiration beat.
    pub ledger: Arc<CreditLedger>,
    /// Service configuration.
    pub config: Arc<Config>,
}

/// Runs one task to completion.
pub async fn execute(ctx: &TaskContext, task: Task) -> Result<(), Error> {
    match task {
        Task::Allocate { voice_id, lock_owner } => {
            ctx.manager.allocate(voice_id, lock_owner).await.map_err(Error::from)
        }
        Task::Synthesize { job_id } => ctx.orchestrator.synthesize_job(job_id).await,
        Task::ProcessQueue { provider } => {
            ctx.manager.process_queue(provider).map(|_| ()).map_err(Error::from)
        }
        Task::ReclaimIdle { provider } => {
            ctx.manager.reclaim_idle(provider, None).await.map(|_| ()).map_err(Error::from)
        }
        Task::ExpireLots => {
            ctx.ledger.expire_now(None, None).map(|_| ()).map_err(Error::from)
        }
    }
}

/// Deadline applied to one task execution.
fn deadline_for(config: &Config, task: &Task) -> Duration {
    const GRACE: Duration = Duration::from_secs(30);
    match task {
        Task::Allocate { .. } => config.workers.provider_call_timeout + GRACE,
        Task::Synthesize { .. } => {
            config.slots.allocation_wait_deadline + config.workers.provider_call_timeout + GRACE
        }
        // Beats touch several voices; give them a few provider calls' worth.
        Task::ProcessQueue { .. } | Task::ReclaimIdle { .. } => {
            config.workers.provider_call_timeout * 4 + GRACE
        }
        Task::ExpireLots => GRACE * 2,
    }
}

/// Exponential backoff with jitter for attempt `attempt` (zero-based).
fn backoff_delay(workers: &WorkerSettings, attempt: u32) -> Duration {
    let exponential = workers.backoff_base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exponential.min(workers.backoff_cap);
    let jitter_bound = capped.as_millis().min(1_000) as u64;
    let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_bound));
    capped + jitter
}

async fn handle_envelope(ctx: &TaskContext, envelope: Envelope) {
    let kind = envelope.task.kind();
    let deadline = deadline_for(&ctx.config, &envelope.task);
    let result = match tokio::time::timeout(deadline, execute(ctx, envelope.task.clone())).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { operation: "task deadline" }),
    };
    match result {
        Ok(()) => {}
        Err(error) if error.is_retryable() && envelope.attempt < ctx.config.workers.max_retries => {
            let delay = backoff_delay(&ctx.config.workers, envelope.attempt);
            tracing::warn!(
                task = kind,
                attempt = envelope.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task failed; retrying with backoff"
            );
            let tasks = Arc::clone(&ctx.tasks);
            let attempt = envelope.attempt + 1;
            let task = envelope.task;
            drop(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tasks.redispatch(task, attempt);
            }));
        }
        Err(error) => {
            tracing::error!(
                task = kind,
                attempts = envelope.attempt + 1,
                error = %error,
                "task failed terminally; dead-lettering"
            );
            ctx.orchestrator.dead_letter(&envelope.task, &error);
        }
    }
}

async fn worker_loop(
    worker: usize,
    receiver: async_channel::Receiver<Envelope>,
    ctx: TaskContext,
    cancel: CancellationToken,
) {
    tracing::debug!(worker, "worker started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(envelope) => handle_envelope(&ctx, envelope).await,
                Err(_) => break,
            },
        }
    }
    tracing::debug!(worker, "worker stopped");
}

async fn beat_loop(tasks: Arc<TaskQueue>, config: Arc<Config>, cancel: CancellationToken) {
    let mut queue_tick = tokio::time::interval(config.slots.queue_poll_interval);
    let mut reclaim_tick = tokio::time::interval(config.slots.reclaim_interval);
    let mut expire_tick = tokio::time::interval(config.workers.expire_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = queue_tick.tick() => {
                for provider in Provider::ALL {
                    tasks.dispatch(Task::ProcessQueue { provider });
                }
            }
            _ = reclaim_tick.tick() => {
                for provider in Provider::ALL {
                    tasks.dispatch(Task::ReclaimIdle { provider });
                }
            }
            _ = expire_tick.tick() => tasks.dispatch(Task::ExpireLots),
        }
    }
}

/// The running worker pool and its beats.
pub struct WorkerRuntime {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Spawns `worker_count` workers over `receiver` plus the beat task.
    /// All of them stop when `cancel` fires.
    #[must_use]
    pub fn spawn(
        receiver: async_channel::Receiver<Envelope>,
        ctx: TaskContext,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();
        for worker in 0..ctx.config.workers.worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker,
                receiver.clone(),
                ctx.clone(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(beat_loop(
            Arc::clone(&ctx.tasks),
            Arc::clone(&ctx.config),
            cancel,
        )));
        Self { handles }
    }

    /// Waits for every worker and beat to finish. Call after cancelling.
    pub async fn shutdown(self) {
        for handle in self.handles {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers() -> WorkerSettings {
        WorkerSettings::default()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let settings = workers();
        let first = backoff_delay(&settings, 0);
        assert!(first >= Duration::from_secs(1));
        assert!(first < Duration::from_secs(3));

        let late = backoff_delay(&settings, 20);
        assert!(late >= settings.backoff_cap);
        assert!(late <= settings.backoff_cap + Duration::from_secs(1));
    }

    #[test]
    fn deadlines_scale_with_the_task() {
        let config = Config::default();
        let allocate = deadline_for(
            &config,
            &Task::Allocate { voice_id: VoiceId::new(), lock_owner: Uuid::new_v4() },
        );
        let synthesize = deadline_for(&config, &Task::Synthesize { job_id: JobId::new() });
        assert!(synthesize > allocate);
    }

    #[test]
    fn task_kinds_are_stable() {
        assert_eq!(Task::ExpireLots.kind(), "expire_lots");
        assert_eq!(
            Task::ProcessQueue { provider: Provider::Cartesia }.kind(),
            "process_queue"
        );
    }
}
