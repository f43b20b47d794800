//! Eligibility gate: which connected workers may take a task.
//!
//! Presence and capability matching belong to a `WorkerDirectory`; the gate
//! only intersects the two and raises alerts when the result is empty.

pub mod diagnostics;
pub mod directory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tasks::Task;

pub use directory::{Alert, InMemoryWorkerDirectory};

/// Kinds of operator alert raised by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NoActiveWorkers,
    NoEligibleWorkers,
}

/// Source of worker presence and capability facts.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    /// Workers currently connected for the account.
    async fn list_connected_workers(&self, account_id: &str) -> Vec<String>;

    /// Whether the worker can serve the task's capability requirements.
    async fn is_capable(&self, worker_id: &str, task: &Task) -> bool;

    /// Fire an operator alert. Never fails the caller.
    async fn alert(&self, account_id: &str, kind: AlertKind, details: &str);

    /// Forget workers whose presence lapsed. Returns how many were dropped.
    async fn evict_stale(&self) -> usize {
        0
    }
}

/// Thin wrapper computing eligible workers for a task.
pub struct EligibilityGate {
    directory: Arc<dyn WorkerDirectory>,
}

impl EligibilityGate {
    pub fn new(directory: Arc<dyn WorkerDirectory>) -> Self {
        Self { directory }
    }

    pub async fn connected_workers(&self, account_id: &str) -> Vec<String> {
        self.directory.list_connected_workers(account_id).await
    }

    pub async fn is_capable(&self, worker_id: &str, task: &Task) -> bool {
        self.directory.is_capable(worker_id, task).await
    }

    pub async fn evict_stale(&self) -> usize {
        self.directory.evict_stale().await
    }

    /// Connected workers that pass the capability predicate.
    pub async fn eligible_workers(&self, task: &Task) -> Vec<String> {
        let connected = self.connected_workers(&task.account_id).await;
        if connected.is_empty() {
            self.directory
                .alert(
                    &task.account_id,
                    AlertKind::NoActiveWorkers,
                    &diagnostics::no_active_workers(&task.account_id),
                )
                .await;
            return Vec::new();
        }

        let mut eligible = Vec::with_capacity(connected.len());
        for worker_id in &connected {
            if self.directory.is_capable(worker_id, task).await {
                eligible.push(worker_id.clone());
            }
        }

        if eligible.is_empty() {
            self.directory
                .alert(
                    &task.account_id,
                    AlertKind::NoEligibleWorkers,
                    &diagnostics::capability_mismatch(task, &connected),
                )
                .await;
        }
        eligible
    }
}
