//! HTTP and WebSocket surface for callers and workers.

mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::channels::BroadcastNotifier;
use crate::dispatch::DispatchService;
use crate::eligibility::InMemoryWorkerDirectory;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DispatchService>,
    /// Presence registry fed by worker polls.
    pub directory: Arc<InMemoryWorkerDirectory>,
    pub notifier: Arc<BroadcastNotifier>,
}

/// Build the router with every caller and worker endpoint.
pub fn dispatch_routes(state: AppState) -> Router {
    let worker = "/api/accounts/{account_id}/workers/{worker_id}";

    Router::new()
        .route("/health", get(routes::health))
        .route(&format!("{worker}/events"), get(routes::poll_events))
        .route(&format!("{worker}/tasks/{{task_id}}/acquire"), post(routes::acquire))
        .route(
            &format!("{worker}/tasks/{{task_id}}/validation"),
            post(routes::report_validation),
        )
        .route(&format!("{worker}/tasks/{{task_id}}/response"), post(routes::respond))
        .route("/api/accounts/{account_id}/tasks", post(routes::queue_task))
        .route("/api/accounts/{account_id}/tasks/execute", post(routes::execute))
        .route("/api/accounts/{account_id}/tasks/{task_id}", get(routes::get_task))
        .route("/api/accounts/{account_id}/tasks/{task_id}/abort", post(routes::abort))
        .route("/api/accounts/{account_id}/tasks/{task_id}/expire", post(routes::expire))
        .route("/stream/worker/{account_id}", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
