//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use super::AppState;
use crate::error::{DatabaseError, DispatchError};
use crate::tasks::{NewTask, TaskId, TaskResponse};

/// A dispatch failure rendered as `{"error": ...}` with a matching status.
pub(super) struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::SyncTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::TaskAborted { .. } => StatusCode::CONFLICT,
            DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DispatchError::Database(DatabaseError::DuplicateId(_)) => StatusCode::CONFLICT,
            DispatchError::Channel(_) => StatusCode::BAD_GATEWAY,
            DispatchError::TaskVanished { .. } | DispatchError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(status = %status, error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(DispatchError::InvalidArgument(format!("Invalid task ID: {raw}"))))
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Task not found"})),
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "task-dispatch"
    }))
}

// ── Worker protocol ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct PollQuery {
    sync_only: bool,
    /// Comma-separated capability descriptors the worker holds.
    capabilities: Option<String>,
}

pub(super) async fn poll_events(
    State(state): State<AppState>,
    Path((account_id, worker_id)): Path<(String, String)>,
    Query(query): Query<PollQuery>,
) -> Result<Response, ApiError> {
    let capabilities: Vec<String> = query
        .capabilities
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    state
        .directory
        .touch(&account_id, &worker_id, capabilities)
        .await;

    let events = state
        .service
        .poll_events(&account_id, &worker_id, query.sync_only)
        .await?;
    Ok(Json(events).into_response())
}

pub(super) async fn acquire(
    State(state): State<AppState>,
    Path((account_id, worker_id, task_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    match state.service.acquire(&account_id, &worker_id, task_id).await? {
        Some(acquisition) => Ok(Json(acquisition).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ValidationReport {
    proven: bool,
}

pub(super) async fn report_validation(
    State(state): State<AppState>,
    Path((account_id, worker_id, task_id)): Path<(String, String, String)>,
    Json(report): Json<ValidationReport>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let lease = state
        .service
        .report_validation(&account_id, &worker_id, task_id, report.proven)
        .await?;
    match lease {
        Some(package) => Ok(Json(package).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub(super) async fn respond(
    State(state): State<AppState>,
    Path((account_id, worker_id, task_id)): Path<(String, String, String)>,
    Json(response): Json<TaskResponse>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let outcome = state
        .service
        .respond(&account_id, task_id, &worker_id, response)
        .await?;
    Ok(Json(serde_json::json!({"outcome": outcome})).into_response())
}

// ── Caller side ─────────────────────────────────────────────────────────

pub(super) async fn queue_task(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(new): Json<NewTask>,
) -> Result<Response, ApiError> {
    let task = state.service.queue_task(&account_id, new).await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

pub(super) async fn execute(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(new): Json<NewTask>,
) -> Result<Response, ApiError> {
    let result = state.service.execute(&account_id, new).await?;
    Ok(Json(result).into_response())
}

pub(super) async fn get_task(
    State(state): State<AppState>,
    Path((account_id, task_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    match state.service.get_task(&account_id, task_id).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(not_found()),
    }
}

pub(super) async fn abort(
    State(state): State<AppState>,
    Path((account_id, task_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    match state.service.abort(&account_id, task_id).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(not_found()),
    }
}

pub(super) async fn expire(
    State(state): State<AppState>,
    Path((account_id, task_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    match state.service.expire(&account_id, task_id).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(not_found()),
    }
}
