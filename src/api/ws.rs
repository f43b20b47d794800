//! Worker signal stream.
//!
//! Each connection subscribes to its account's broadcast channel and
//! forwards `TASK_AVAILABLE` / `TASK_ABORT:<id>` text frames. Workers are
//! expected to poll after every frame; the stream carries no task data.

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::eligibility::InMemoryWorkerDirectory;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct StreamQuery {
    /// When set, every frame from the client refreshes this worker's presence.
    worker_id: Option<String>,
    capabilities: Option<String>,
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    info!(account_id = %account_id, worker_id = ?query.worker_id, "Worker stream connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, account_id, query))
}

async fn refresh_presence(
    directory: &InMemoryWorkerDirectory,
    account_id: &str,
    query: &StreamQuery,
) {
    if let Some(worker_id) = &query.worker_id {
        let capabilities = query
            .capabilities
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty());
        directory.touch(account_id, worker_id, capabilities).await;
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    account_id: String,
    query: StreamQuery,
) {
    let directory: Arc<InMemoryWorkerDirectory> = state.directory;
    refresh_presence(&directory, &account_id, &query).await;

    let mut rx = state.notifier.subscribe(&account_id).await;
    info!(account_id = %account_id, "Worker stream connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(signal) => {
                        if socket.send(Message::Text(signal.into())).await.is_err() {
                            debug!("Worker disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Missed signals are recovered by the worker's next poll.
                        warn!(missed = n, "Worker stream lagged behind broadcast");
                        if socket
                            .send(Message::Text("TASK_AVAILABLE".into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(_))) => {
                        refresh_presence(&directory, &account_id, &query).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        refresh_presence(&directory, &account_id, &query).await;
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(account_id = %account_id, "Worker stream disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(account_id = %account_id, "Worker stream closed");
}
