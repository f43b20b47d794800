//! Error types for the dispatch core.

use std::time::Duration;

use crate::tasks::TaskId;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Task {0} already exists")]
    DuplicateId(TaskId),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced at the caller-facing boundary of the dispatch core.
///
/// Lease races and duplicate responses never show up here: they are
/// reported as `None` or absorbed as no-ops.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No eligible workers available for {task_type} tasks in account {account_id}")]
    ServiceUnavailable {
        account_id: String,
        task_type: String,
    },

    #[error("Task {task_id} did not complete within {timeout:?} (assigned worker: {})", .worker_id.as_deref().unwrap_or("none"))]
    SyncTimeout {
        task_id: TaskId,
        worker_id: Option<String>,
        timeout: Duration,
    },

    #[error("Task {task_id} disappeared while a caller was waiting on it")]
    TaskVanished { task_id: TaskId },

    #[error("Task {task_id} was aborted before it completed")]
    TaskAborted { task_id: TaskId },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors from the outbound notifier / completion adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}
