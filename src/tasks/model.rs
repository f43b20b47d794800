//! Task record, caller-facing inputs and worker-facing outputs.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskId;
use super::state::{TaskMode, TaskStatus};

/// Default execution timeout for sync callers that do not set one.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// Current time truncated to the millisecond precision the ledger stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Whitelist key for a set of capability requirements.
///
/// Two tasks whose requirements differ only in order or duplicates share
/// a signature.
pub fn task_signature(capabilities: &[String]) -> String {
    let unique: BTreeSet<&str> = capabilities.iter().map(String::as_str).collect();
    unique.into_iter().collect::<Vec<_>>().join(",")
}

/// Outcome reported by a worker for a leased task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    Failed,
    RetryOnOtherWorker,
}

/// Result payload stored on a task. Opaque to the dispatch core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub code: ResponseCode,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            code: ResponseCode::Ok,
            data,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Failed,
            data: serde_json::Value::Null,
            error_message: Some(message.into()),
        }
    }
}

/// Caller input for queueing or executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Capability descriptors a worker must hold.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Async completion handle for the originating caller.
    #[serde(default)]
    pub wait_id: Option<String>,
    /// Override of the configured task expiry.
    #[serde(default)]
    pub expiry_ms: Option<u64>,
    /// How long a sync caller waits for the result.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            capabilities: Vec::new(),
            wait_id: None,
            expiry_ms: None,
            timeout_ms: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wait_id(mut self, wait_id: impl Into<String>) -> Self {
        self.wait_id = Some(wait_id.into());
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry_ms = Some(expiry.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// A unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub account_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub capabilities: Vec<String>,
    /// Set only while `status` is started, finished or error.
    pub assigned_worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expiry_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_broadcast_at: Option<DateTime<Utc>>,
    pub broadcast_count: u32,
    pub validation_started_at: Option<DateTime<Utc>>,
    pub validating_workers: BTreeSet<String>,
    pub validation_complete_workers: BTreeSet<String>,
    /// Workers that relinquished the task after a retryable failure. Only grows.
    pub already_tried_workers: BTreeSet<String>,
    /// Worker that held the lease when the task was aborted and has not
    /// yet been told about it.
    pub abort_pending_for: Option<String>,
    pub wait_id: Option<String>,
    pub timeout_ms: u64,
    pub result: Option<TaskResponse>,
    /// Bumped by every successful conditional update.
    pub version: i64,
}

impl Task {
    /// Build a fresh queued task, counting the creation as its first broadcast.
    pub fn queued(
        account_id: impl Into<String>,
        new: NewTask,
        mode: TaskMode,
        default_expiry: Duration,
    ) -> Self {
        let created_at = now();
        let expiry = new
            .expiry_ms
            .map(Duration::from_millis)
            .unwrap_or(default_expiry);
        let expiry_at = chrono::Duration::from_std(expiry)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            task_type: new.task_type,
            payload: new.payload,
            mode,
            status: TaskStatus::Queued,
            capabilities: new.capabilities,
            assigned_worker_id: None,
            created_at,
            expiry_at,
            started_at: None,
            last_broadcast_at: Some(created_at),
            broadcast_count: 1,
            validation_started_at: None,
            validating_workers: BTreeSet::new(),
            validation_complete_workers: BTreeSet::new(),
            already_tried_workers: BTreeSet::new(),
            abort_pending_for: None,
            wait_id: new.wait_id,
            timeout_ms: new.timeout_ms.unwrap_or(DEFAULT_SYNC_TIMEOUT_MS),
            result: None,
            version: 0,
        }
    }

    pub fn signature(&self) -> String {
        task_signature(&self.capabilities)
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.expiry_at <= at
    }

    /// Queued and not held by any worker.
    pub fn is_unleased(&self) -> bool {
        self.status == TaskStatus::Queued && self.assigned_worker_id.is_none()
    }

    pub fn is_leased_to(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::Started && self.assigned_worker_id.as_deref() == Some(worker_id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What a worker receives when it holds the lease.
///
/// Built only from stored task fields plus the resolved payload, so a
/// re-delivery to the same worker yields an equal package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasePackage {
    pub task_id: TaskId,
    pub account_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub mode: TaskMode,
    pub capabilities: Vec<String>,
    pub assigned_worker_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub expiry_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

impl LeasePackage {
    pub fn new(task: &Task, worker_id: &str, payload: serde_json::Value) -> Self {
        Self {
            task_id: task.id,
            account_id: task.account_id.clone(),
            task_type: task.task_type.clone(),
            payload,
            mode: task.mode,
            capabilities: task.capabilities.clone(),
            assigned_worker_id: worker_id.to_string(),
            started_at: task.started_at,
            expiry_at: task.expiry_at,
            timeout_ms: task.timeout_ms,
        }
    }
}

/// Result of a worker asking for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Acquisition {
    /// The worker holds the lease.
    Leased(LeasePackage),
    /// The worker must prove it can reach the task's dependencies first.
    ValidationRequired {
        task_id: TaskId,
        capabilities: Vec<String>,
    },
}

impl Acquisition {
    pub fn lease(&self) -> Option<&LeasePackage> {
        match self {
            Self::Leased(package) => Some(package),
            Self::ValidationRequired { .. } => None,
        }
    }

    pub fn into_lease(self) -> Option<LeasePackage> {
        match self {
            Self::Leased(package) => Some(package),
            Self::ValidationRequired { .. } => None,
        }
    }
}

/// An entry in a worker's poll result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Available { task_id: TaskId, mode: TaskMode },
    Abort { task_id: TaskId },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Available { task_id, .. } | Self::Abort { task_id } => *task_id,
        }
    }
}
