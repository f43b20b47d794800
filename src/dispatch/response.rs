//! Worker responses: finalize, or hand the task to another worker.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channels::{CompletionChannel, Notifier, Signal};
use crate::eligibility::EligibilityGate;
use crate::error::DispatchError;
use crate::store::{TaskLedger, TaskPredicate, TaskUpdate};
use crate::tasks::{ResponseCode, Task, TaskId, TaskMode, TaskResponse, TaskStatus, now};
use crate::validation::WhitelistCache;

/// What a response did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Reset to queued for another worker.
    Requeued,
    /// Stored as the final result.
    Finished,
    /// Duplicate, stale or for a missing task.
    Ignored,
}

pub struct ResponseHandler {
    ledger: Arc<dyn TaskLedger>,
    gate: Arc<EligibilityGate>,
    whitelist: Arc<WhitelistCache>,
    notifier: Arc<dyn Notifier>,
    completion: Arc<dyn CompletionChannel>,
}

impl ResponseHandler {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        gate: Arc<EligibilityGate>,
        whitelist: Arc<WhitelistCache>,
        notifier: Arc<dyn Notifier>,
        completion: Arc<dyn CompletionChannel>,
    ) -> Self {
        Self {
            ledger,
            gate,
            whitelist,
            notifier,
            completion,
        }
    }

    /// Apply a worker's response. Only the current lease holder is heard;
    /// anything else is absorbed as a no-op.
    pub async fn on_worker_response(
        &self,
        task_id: TaskId,
        worker_id: &str,
        response: TaskResponse,
    ) -> Result<ResponseOutcome, DispatchError> {
        let Some(task) = self.ledger.get(task_id).await? else {
            debug!(task_id = %task_id, worker_id, "Response for missing task ignored");
            return Ok(ResponseOutcome::Ignored);
        };
        if !task.is_leased_to(worker_id) {
            debug!(
                task_id = %task_id,
                worker_id,
                status = %task.status,
                "Duplicate or stale response ignored"
            );
            return Ok(ResponseOutcome::Ignored);
        }

        if response.code == ResponseCode::RetryOnOtherWorker {
            let remaining = self.remaining_workers(&task, worker_id).await;
            if !remaining.is_empty() {
                return self.requeue(&task, worker_id, remaining.len()).await;
            }
            info!(task_id = %task_id, worker_id, "Retry requested but no other worker remains");
        }

        self.finish(&task, worker_id, response).await
    }

    /// Connected, eligible workers minus the responder and everyone already tried.
    async fn remaining_workers(&self, task: &Task, worker_id: &str) -> Vec<String> {
        self.gate
            .eligible_workers(task)
            .await
            .into_iter()
            .filter(|w| w != worker_id && !task.already_tried_workers.contains(w))
            .collect()
    }

    async fn requeue(
        &self,
        task: &Task,
        worker_id: &str,
        remaining: usize,
    ) -> Result<ResponseOutcome, DispatchError> {
        let requeued = self
            .ledger
            .conditional_update(
                task.id,
                &TaskPredicate::LeasedTo(worker_id.to_string()),
                &TaskUpdate::new().requeue_without(worker_id, now()),
            )
            .await?;

        match requeued {
            Some(_) => {
                info!(
                    task_id = %task.id,
                    worker_id,
                    remaining,
                    "Task requeued for another worker"
                );
                self.notifier
                    .notify(&task.account_id, Signal::TaskAvailable)
                    .await;
                Ok(ResponseOutcome::Requeued)
            }
            None => {
                debug!(task_id = %task.id, worker_id, "Lost race while requeueing");
                Ok(ResponseOutcome::Ignored)
            }
        }
    }

    async fn finish(
        &self,
        task: &Task,
        worker_id: &str,
        response: TaskResponse,
    ) -> Result<ResponseOutcome, DispatchError> {
        let finished = self
            .ledger
            .conditional_update(
                task.id,
                &TaskPredicate::LeasedTo(worker_id.to_string()),
                &TaskUpdate::new()
                    .status(TaskStatus::Finished)
                    .result(response.clone()),
            )
            .await?;

        let Some(task) = finished else {
            debug!(task_id = %task.id, worker_id, "Lost race while finishing");
            return Ok(ResponseOutcome::Ignored);
        };
        info!(task_id = %task.id, worker_id, code = ?response.code, "Task finished");

        if response.code == ResponseCode::Ok {
            self.whitelist.record(worker_id, &task.signature(), true);
        }

        // Sync callers are woken by the bridge's reconciliation scan.
        if task.mode == TaskMode::Async {
            if let Some(wait_id) = &task.wait_id {
                if let Err(e) = self.completion.complete(wait_id, &response).await {
                    warn!(task_id = %task.id, wait_id, error = %e, "Completion delivery failed");
                }
            }
        }
        Ok(ResponseOutcome::Finished)
    }
}
