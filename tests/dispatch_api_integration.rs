//! Integration tests for the dispatch REST + worker stream surface.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory libSQL ledger and drives it the way callers and workers do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use task_dispatch::api::{AppState, dispatch_routes};
use task_dispatch::channels::{BroadcastNotifier, MemoryCompletionChannel, PassthroughPayloadResolver};
use task_dispatch::config::DispatchConfig;
use task_dispatch::dispatch::{Collaborators, DispatchService, spawn_sync_reconciler};
use task_dispatch::eligibility::InMemoryWorkerDirectory;
use task_dispatch::store::{LibSqlLedger, TaskFilter, TaskLedger};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Server {
    base: String,
    port: u16,
    ledger: Arc<LibSqlLedger>,
    http: reqwest::Client,
}

/// Start an Axum server on a random port with a fast sync reconciler.
async fn start_server() -> Server {
    let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
    let directory = Arc::new(InMemoryWorkerDirectory::new(Duration::from_secs(60)));
    let notifier = Arc::new(BroadcastNotifier::new());
    let service = Arc::new(DispatchService::new(
        DispatchConfig::default(),
        Collaborators {
            ledger: ledger.clone(),
            directory: directory.clone(),
            notifier: notifier.clone(),
            completion: Arc::new(MemoryCompletionChannel::new()),
            resolver: Arc::new(PassthroughPayloadResolver),
        },
    ));
    spawn_sync_reconciler(service.sync_bridge(), Duration::from_millis(20));

    let app = dispatch_routes(AppState {
        service,
        directory,
        notifier,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}/api/accounts/acct"),
        port,
        ledger,
        http: reqwest::Client::new(),
    }
}

impl Server {
    async fn poll(&self, worker: &str, capabilities: &str) -> Vec<Value> {
        self.http
            .get(format!(
                "{}/workers/{worker}/events?capabilities={capabilities}",
                self.base
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn queue(&self, body: Value) -> Value {
        let resp = self
            .http
            .post(format!("{}/tasks", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        resp.json().await.unwrap()
    }

    async fn acquire(&self, worker: &str, task_id: &str) -> reqwest::Response {
        self.http
            .post(format!("{}/workers/{worker}/tasks/{task_id}/acquire", self.base))
            .send()
            .await
            .unwrap()
    }

    async fn respond(&self, worker: &str, task_id: &str, body: Value) -> Value {
        self.http
            .post(format!("{}/workers/{worker}/tasks/{task_id}/response", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn get(&self, task_id: &str) -> reqwest::Response {
        self.http
            .get(format!("{}/tasks/{task_id}", self.base))
            .send()
            .await
            .unwrap()
    }

    /// Poll until a task shows up for the worker.
    async fn wait_for_task(&self, worker: &str) -> String {
        loop {
            if let Some(event) = self.poll(worker, "").await.first() {
                return event["task_id"].as_str().unwrap().to_string();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ── Sync execution ───────────────────────────────────────────────────

#[tokio::test]
async fn execute_without_workers_fails_fast_and_leaves_nothing() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let started = Instant::now();
        let resp = server
            .http
            .post(format!("{}/tasks/execute", server.base))
            .json(&json!({"task_type": "http", "timeout_ms": 2000}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(started.elapsed() < Duration::from_secs(1));

        let rows = server.ledger.scan(&TaskFilter::default()).await.unwrap();
        assert!(rows.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn execute_returns_worker_result_and_removes_row() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server().await);
        server.poll("w1", "").await;

        let caller = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .http
                    .post(format!("{}/tasks/execute", server.base))
                    .json(&json!({"task_type": "shell", "timeout_ms": 5000}))
                    .send()
                    .await
                    .unwrap()
            })
        };

        let task_id = server.wait_for_task("w1").await;
        let lease: Value = server.acquire("w1", &task_id).await.json().await.unwrap();
        assert_eq!(lease["outcome"], "leased");
        assert_eq!(lease["assigned_worker_id"], "w1");

        let outcome = server
            .respond("w1", &task_id, json!({"code": "OK", "data": {"exit": 0}}))
            .await;
        assert_eq!(outcome["outcome"], "finished");

        let resp = caller.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result: Value = resp.json().await.unwrap();
        assert_eq!(result["code"], "OK");
        assert_eq!(result["data"]["exit"], 0);

        assert_eq!(server.get(&task_id).await.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn execute_times_out_naming_the_silent_worker() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server().await);
        server.poll("w1", "").await;

        let caller = {
            let server = server.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let resp = server
                    .http
                    .post(format!("{}/tasks/execute", server.base))
                    .json(&json!({"task_type": "shell", "timeout_ms": 500}))
                    .send()
                    .await
                    .unwrap();
                (resp, started.elapsed())
            })
        };

        let task_id = server.wait_for_task("w1").await;
        assert_eq!(server.acquire("w1", &task_id).await.status(), StatusCode::OK);

        let (resp, elapsed) = caller.await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(elapsed >= Duration::from_millis(500));
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("w1"));

        assert_eq!(server.get(&task_id).await.status(), StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}

// ── Leasing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_acquire_grants_one_lease() {
    timeout(TEST_TIMEOUT, async {
        let server = Arc::new(start_server().await);
        server.poll("w1", "").await;
        server.poll("w2", "").await;
        let task = server.queue(json!({"task_type": "shell"})).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let (a, b) = tokio::join!(server.acquire("w1", &task_id), server.acquire("w2", &task_id));
        let statuses = [a.status(), b.status()];
        assert_eq!(
            statuses.iter().filter(|s| **s == StatusCode::OK).count(),
            1,
            "exactly one worker must win: {statuses:?}"
        );
        assert_eq!(
            statuses.iter().filter(|s| **s == StatusCode::NO_CONTENT).count(),
            1
        );

        let stored: Value = server.get(&task_id).await.json().await.unwrap();
        assert_eq!(stored["status"], "started");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retry_moves_task_to_other_worker() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.poll("w1", "").await;
        server.poll("w2", "").await;
        let task = server.queue(json!({"task_type": "shell"})).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        assert_eq!(server.acquire("w1", &task_id).await.status(), StatusCode::OK);
        let outcome = server
            .respond("w1", &task_id, json!({"code": "RETRY_ON_OTHER_WORKER"}))
            .await;
        assert_eq!(outcome["outcome"], "requeued");

        let stored: Value = server.get(&task_id).await.json().await.unwrap();
        assert_eq!(stored["status"], "queued");
        assert_eq!(stored["already_tried_workers"], json!(["w1"]));

        assert_eq!(server.acquire("w1", &task_id).await.status(), StatusCode::NO_CONTENT);
        assert_eq!(server.acquire("w2", &task_id).await.status(), StatusCode::OK);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn capability_task_goes_through_validation() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.poll("w1", "https://a").await;
        let task = server
            .queue(json!({"task_type": "http", "capabilities": ["https://a"]}))
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let first: Value = server.acquire("w1", &task_id).await.json().await.unwrap();
        assert_eq!(first["outcome"], "validation_required");

        let lease: Value = server
            .http
            .post(format!("{}/workers/w1/tasks/{task_id}/validation", server.base))
            .json(&json!({"proven": true}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(lease["assigned_worker_id"], "w1");

        let stored: Value = server.get(&task_id).await.json().await.unwrap();
        assert_eq!(stored["status"], "started");
        assert_eq!(stored["validating_workers"], json!([]));
    })
    .await
    .expect("test timed out");
}

// ── Abort ────────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_twice_is_harmless() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let task = server.queue(json!({"task_type": "shell"})).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        for _ in 0..2 {
            let resp = server
                .http
                .post(format!("{}/tasks/{task_id}/abort", server.base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["status"], "aborted");
        }
    })
    .await
    .expect("test timed out");
}

// ── Worker stream ────────────────────────────────────────────────────

#[tokio::test]
async fn stream_carries_available_and_abort_signals() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (mut ws, _resp) = connect_async(format!(
            "ws://127.0.0.1:{}/stream/worker/acct?worker_id=w1",
            server.port
        ))
        .await
        .expect("WS connect failed");
        // Let the stream subscribe before anything is broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let task = server.queue(json!({"task_type": "shell"})).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(text(&frame), "TASK_AVAILABLE");

        assert_eq!(server.acquire("w1", &task_id).await.status(), StatusCode::OK);
        server
            .http
            .post(format!("{}/tasks/{task_id}/abort", server.base))
            .send()
            .await
            .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(text(&frame), format!("TASK_ABORT:{task_id}"));

        let events = server.poll("w1", "").await;
        assert_eq!(events, vec![json!({"event": "abort", "task_id": task_id})]);
    })
    .await
    .expect("test timed out");
}

fn text(msg: &Message) -> String {
    match msg {
        Message::Text(txt) => txt.as_str().to_string(),
        other => panic!("expected Text frame, got {other:?}"),
    }
}
