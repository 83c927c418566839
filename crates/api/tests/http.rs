// Copyright The TaleCast Authors
// SPDX-License-Identifier: Apache-2.0

//! Status-code and payload contract of the HTTP surface, exercised with
//! in-memory services and `tower::ServiceExt::oneshot`.

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http_body_util::BodyExt;
use std::sync::Arc;
use talecast_api::{AppState, router};
use talecast_config::Config;
use talecast_engine::{Envelope, Orchestrator, TaskContext, TaskQueue, execute};
use talecast_ledger::CreditLedger;
use talecast_slots::{MockProvider, SlotManager};
use talecast_store::{
    CreditSource, JobStore, LedgerStore, ManualClock, MemoryBlobStore, SlotQueue, StoryId,
    StoryStore, UserId, VoiceStore,
};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token";

struct App {
    router: Router,
    config: Arc<Config>,
    stories: Arc<StoryStore>,
    ledger: Arc<CreditLedger>,
    ctx: TaskContext,
    rx: async_channel::Receiver<Envelope>,
}

fn app_with(mut config: Config) -> App {
    config.http.admin_token = ADMIN_TOKEN.to_owned();
    let config = Arc::new(config);
    let clock = Arc::new(ManualClock::starting_now());
    let voices = Arc::new(VoiceStore::new(clock.clone()));
    let queue = Arc::new(SlotQueue::new(clock.clone()));
    let jobs = Arc::new(JobStore::new(clock.clone()));
    let stories = Arc::new(StoryStore::new(clock.clone()));
    let ledger_store = Arc::new(LedgerStore::new(clock.clone()));
    let blobs = Arc::new(MemoryBlobStore::new());
    let provider = Arc::new(MockProvider::new());
    let (tasks, rx) = TaskQueue::bounded(256);

    let manager = Arc::new(SlotManager::new(
        voices.clone(),
        queue.clone(),
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
    let ctx = TaskContext {
        tasks: tasks.clone(),
        orchestrator: orchestrator.clone(),
        manager: manager.clone(),
        ledger: ledger.clone(),
        config: config.clone(),
    };
    let state = AppState {
        orchestrator,
        manager,
        ledger: ledger.clone(),
        tasks,
        config: config.clone(),
    };
    App { router: router(state), config, stories, ledger, ctx, rx }
}

fn app() -> App {
    app_with(Config::default())
}

async fn drain(app: &App) {
    for _ in 0..100 {
        let Ok(envelope) = app.rx.try_recv() else {
            break;
        };
        match execute(&app.ctx, envelope.task.clone()).await {
            Ok(()) => {}
            Err(error)
                if error.is_retryable() && envelope.attempt < app.config.workers.max_retries =>
            {
                app.ctx.tasks.redispatch(envelope.task, envelope.attempt + 1);
            }
            Err(error) => app.ctx.orchestrator.dead_letter(&envelope.task, &error),
        }
    }
}

async fn send(app: &App, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

fn get(path: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-user-id", user)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, user: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("x-user-id", user)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn upload_voice(app: &App, user: &str) -> String {
    let body = serde_json::json!({
        "name": "mum",
        "provider": "elevenlabs",
        "sample": BASE64.encode(b"sample-bytes"),
    });
    let (status, _, bytes) = send(app, post_json("/voices", user, body)).await;
    assert_eq!(status, StatusCode::CREATED);
    let view = json(&bytes);
    assert_eq!(view["status"], "recorded");
    view["voice_id"].as_str().unwrap().to_owned()
}

async fn ready_voice(app: &App, user: &str) -> String {
    let voice_id = upload_voice(app, user).await;
    let parsed = voice_id.parse().unwrap();
    let _ = app.ctx.manager.ensure_active(&UserId::from(user), parsed).unwrap();
    drain(app).await;
    voice_id
}

fn grant(app: &App, user: &str, amount: i64) {
    let _ = app
        .ledger
        .grant(
            &UserId::from(user),
            amount,
            CreditSource::Free,
            None,
            "test",
            serde_json::Value::Null,
        )
        .unwrap();
}

fn add_story(app: &App, id: &str, codepoints: usize) {
    app.stories.put(StoryId::from(id), format!("story {id}"), "z".repeat(codepoints));
}

#[tokio::test]
async fn identity_header_is_required() {
    let app = app();
    let request = Request::builder().method("GET").uri("/voices").body(Body::empty()).unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json(&bytes)["error"]["kind"], "unauthenticated");
}

#[tokio::test]
async fn voice_upload_validates_input() {
    let app = app();

    let bad_provider = serde_json::json!({
        "name": "mum", "provider": "unknown-tts", "sample": BASE64.encode(b"s"),
    });
    let (status, _, _) = send(&app, post_json("/voices", "u1", bad_provider)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bad_sample = serde_json::json!({
        "name": "mum", "provider": "elevenlabs", "sample": "@@not-base64@@",
    });
    let (status, _, _) = send(&app, post_json("/voices", "u1", bad_sample)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/voices")
        .header("x-user-id", "u1")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn voice_access_is_scoped_to_the_owner() {
    let app = app();
    let voice_id = upload_voice(&app, "u1").await;

    let (status, _, _) = send(&app, get(&format!("/voices/{voice_id}"), "u1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, bytes) = send(&app, get(&format!("/voices/{voice_id}"), "u2")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json(&bytes)["error"]["kind"], "forbidden");

    let (status, _, _) =
        send(&app, get("/voices/00000000-0000-4000-8000-000000000000", "u1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/voices/not-a-voice", "u1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, bytes) = send(&app, get("/voices", "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&bytes).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn synthesis_without_credits_is_402_with_amounts() {
    let app = app();
    grant(&app, "u1", 1);
    let voice_id = ready_voice(&app, "u1").await;
    add_story(&app, "moon", 2500);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/voices/{voice_id}/stories/moon/audio"))
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let body = json(&bytes);
    assert_eq!(body["required"], 3);
    assert_eq!(body["available"], 1);
    assert_eq!(body["error"]["kind"], "insufficient_credits");
}

#[tokio::test]
async fn saturated_pool_returns_202_with_queue_headers() {
    let mut config = Config::default();
    config.slots.slot_limit = 1;
    let app = app_with(config);
    let _holder = ready_voice(&app, "holder").await;

    grant(&app, "u1", 10);
    let voice_id = upload_voice(&app, "u1").await;
    add_story(&app, "moon", 500);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/voices/{voice_id}/stories/moon/audio"))
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body = json(&bytes);
    assert_eq!(body["status"], "queued_for_slot");
    assert_eq!(body["queue_position"], 1);
    assert_eq!(body["queue_length"], 1);
    assert_eq!(headers.get("x-voice-queue-position").unwrap(), "1");
    assert_eq!(headers.get("x-voice-queue-length").unwrap(), "1");
}

#[tokio::test]
async fn synthesis_completes_and_serves_audio() {
    let app = app();
    grant(&app, "u1", 10);
    let voice_id = ready_voice(&app, "u1").await;
    add_story(&app, "moon", 500);
    let audio_path = format!("/voices/{voice_id}/stories/moon/audio");

    // Not ready yet.
    let (status, _, bytes) = send(&app, get(&audio_path, "u1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json(&bytes)["error"]["kind"], "not_ready");

    let request = Request::builder()
        .method("POST")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json(&bytes)["status"], "processing");

    drain(&app).await;

    // Polling the same request reports ready with the remote binding.
    let request = Request::builder()
        .method("POST")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&bytes)["status"], "ready");
    assert!(headers.get("x-voice-remote-id").is_some());

    let (status, headers, bytes) = send(&app, get(&audio_path, "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "audio/mpeg");
    assert!(!bytes.is_empty());
}

#[tokio::test]
async fn range_requests_get_partial_content() {
    let app = app();
    grant(&app, "u1", 10);
    let voice_id = ready_voice(&app, "u1").await;
    add_story(&app, "moon", 500);
    let audio_path = format!("/voices/{voice_id}/stories/moon/audio");

    let request = Request::builder()
        .method("POST")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    drain(&app).await;

    let (status, headers, full) = send(&app, get(&audio_path, "u1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
    let total = full.len();
    assert!(total > 4);

    // A bounded range.
    let request = Request::builder()
        .method("GET")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .header("range", "bytes=0-3")
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(bytes, &full[..4]);
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        format!("bytes 0-3/{total}")
    );

    // A suffix range returns the tail.
    let request = Request::builder()
        .method("GET")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .header("range", "bytes=-4")
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(bytes, &full[total - 4..]);
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        format!("bytes {}-{}/{total}", total - 4, total - 1)
    );

    // A range past the end is unsatisfiable.
    let request = Request::builder()
        .method("GET")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .header("range", format!("bytes={total}-"))
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        format!("bytes */{total}")
    );

    // A malformed range falls back to the full body.
    let request = Request::builder()
        .method("GET")
        .uri(&audio_path)
        .header("x-user-id", "u1")
        .header("range", "pages=1-2")
        .body(Body::empty())
        .unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes.len(), total);
}

#[tokio::test]
async fn unknown_story_is_404() {
    let app = app();
    grant(&app, "u1", 10);
    let voice_id = ready_voice(&app, "u1").await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/voices/{voice_id}/stories/never-written/audio"))
        .header("x-user-id", "u1")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn credits_summary_and_history_page() {
    let mut config = Config::default();
    config.credits.initial_credits = 5;
    let app = app_with(config);

    let (status, _, bytes) = send(&app, get("/me/credits", "newcomer")).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&bytes);
    assert_eq!(body["balance"], 5);
    assert_eq!(body["lots"].as_array().unwrap().len(), 1);
    assert_eq!(body["history"].as_array().unwrap().len(), 1);

    let (status, _, bytes) =
        send(&app, get("/me/credits/history?limit=1&type=credit", "newcomer")).await;
    assert_eq!(status, StatusCode::OK);
    let page = json(&bytes);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["kind"], "credit");

    let (status, _, _) = send(&app, get("/me/credits/history?type=bogus", "newcomer")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_surface_requires_the_token() {
    let app = app();

    let (status, _, _) = send(&app, get("/admin/voice-slots/status", "u1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("GET")
        .uri("/admin/voice-slots/status")
        .header("x-user-id", "u1")
        .header("x-admin-token", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("GET")
        .uri("/admin/voice-slots/status")
        .header("x-admin-token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let pools = json(&bytes);
    assert_eq!(pools[0]["slot_limit"], 10);
}

#[tokio::test]
async fn admin_grant_and_force_beats() {
    let app = app();

    let request = Request::builder()
        .method("POST")
        .uri("/admin/users/u9/credits/grant")
        .header("x-admin-token", ADMIN_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "amount": 12, "source": "event" }).to_string(),
        ))
        .unwrap();
    let (status, _, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&bytes)["amount_remaining"], 12);
    assert_eq!(app.ledger.summary(&UserId::from("u9")).active_balance, 12);

    let request = Request::builder()
        .method("POST")
        .uri("/admin/users/u9/credits/grant")
        .header("x-admin-token", ADMIN_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "amount": 12, "source": "gold" }).to_string(),
        ))
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/admin/voice-slots/process-queue")
        .header("x-admin-token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // The beat landed on the task stream.
    assert!(app.rx.try_recv().is_ok());
}

#[tokio::test]
async fn probes_answer() {
    let app = app();
    let request = Request::builder().method("GET").uri("/livez").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder().method("GET").uri("/readyz").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}
