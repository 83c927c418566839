// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! TaleCast service entrypoint.
//!
//! Loads configuration (defaults, optional JSON file, `TALECAST_*`
//! environment), wires the stores, ledger, slot manager and orchestrator
//! together, spawns the worker runtime with its beats, and serves the HTTP
//! API until SIGINT/SIGTERM.
//!
//! The binary runs against the in-process blob store and the deterministic
//! mock TTS provider, so the whole coordination layer is exercisable without
//! external services; production deployments substitute real adapters at the
//! wiring points below.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use talecast_api::AppState;
use talecast_config::Config;
use talecast_engine::{Orchestrator, TaskContext, TaskQueue, WorkerRuntime};
use talecast_ledger::CreditLedger;
use talecast_slots::{MockProvider, SlotManager};
use talecast_store::{
    JobStore, LedgerStore, MemoryBlobStore, SharedClock, SlotQueue, StoryId, StoryStore,
    SystemClock, VoiceStore,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "talecast", version, about = "Bedtime-story narration service")]
struct Cli {
    /// Path to a JSON configuration file. `TALECAST_*` environment
    /// variables override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed a handful of demo stories at startup.
    #[arg(long)]
    seed_demo_stories: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "service terminated");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::load(cli.config.as_deref())?);
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(config, cli.seed_demo_stories))
}

async fn serve(
    config: Arc<Config>,
    seed_demo_stories: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: SharedClock = Arc::new(SystemClock);
    let voices = Arc::new(VoiceStore::new(clock.clone()));
    let queue = Arc::new(SlotQueue::new(clock.clone()));
    let jobs = Arc::new(JobStore::new(clock.clone()));
    let stories = Arc::new(StoryStore::new(clock.clone()));
    let ledger_store = Arc::new(LedgerStore::new(clock.clone()));
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(MockProvider::new());
    let (tasks, receiver) = TaskQueue::bounded(1024);

    let manager = Arc::new(SlotManager::new(
        voices.clone(),
        queue,
        jobs.clone(),
        ledger_store.clone(),
        blobs.clone(),
        provider.clone(),
        tasks.clone(),
        config.clone(),
        clock.clone(),
    ));
    let ledger = Arc::new(CreditLedger::new(ledger_store.clone(), config.clone(), clock.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        voices,
        jobs,
        stories.clone(),
        ledger.clone(),
        ledger_store,
        manager.clone(),
        provider,
        blobs,
        tasks.clone(),
        config.clone(),
        clock,
    ));

    if seed_demo_stories {
        seed_stories(&stories);
    }

    let cancel = CancellationToken::new();
    let worker_ctx = TaskContext {
        tasks: tasks.clone(),
        orchestrator: orchestrator.clone(),
        manager: manager.clone(),
        ledger: ledger.clone(),
        config: config.clone(),
    };
    let workers = WorkerRuntime::spawn(receiver, worker_ctx, cancel.clone());

    let state = AppState { orchestrator, manager, ledger, tasks, config };
    let mut server = tokio::spawn(talecast_api::run(state, cancel.clone()));

    tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
        result = &mut server => {
            cancel.cancel();
            workers.shutdown().await;
            return Ok(result??);
        }
    }

    workers.shutdown().await;
    server.await??;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn seed_stories(stories: &StoryStore) {
    let demo: [(&str, &str, &str); 3] = [
        (
            "the-sleepy-lighthouse",
            "The Sleepy Lighthouse",
            "At the edge of a quiet bay stood a lighthouse who loved its work \
             but could never stay awake past the first star. Every evening the \
             moon tiptoed over the water to wind its great lamp for it, and \
             every morning the lighthouse woke to find the ships safely home.",
        ),
        (
            "granny-oaks-umbrella",
            "Granny Oak's Umbrella",
            "Granny Oak kept an umbrella so old it remembered every rain it had \
             ever met. When the little fox lost his way in a drizzle, the \
             umbrella hummed the road home, drop by drop, until his paws found \
             the den and his eyes found sleep.",
        ),
        (
            "the-star-counting-bear",
            "The Star-Counting Bear",
            "A small bear decided to count every star before bedtime. He got to \
             eleven, then to twelve, then to a yawn so wide the whole forest \
             heard it, and the stars agreed to count themselves from then on.",
        ),
    ];
    for (id, title, text) in demo {
        stories.put(StoryId::from(id), title, text);
    }
    tracing::info!(count = demo.len(), "demo stories seeded");
}
