//! Exactly-once lease of a task to one worker.

use std::sync::Arc;

use tracing::{debug, info};

use crate::channels::PayloadResolver;
use crate::error::DispatchError;
use crate::store::{TaskLedger, TaskPredicate, TaskUpdate};
use crate::tasks::{LeasePackage, Task, TaskId, now};

/// Grants leases through the ledger's conditional update.
///
/// Every concurrent `assign` for a task races on the same "queued and
/// unassigned" guard, so at most one of them can win.
pub struct AssignmentEngine {
    ledger: Arc<dyn TaskLedger>,
    resolver: Arc<dyn PayloadResolver>,
}

impl AssignmentEngine {
    pub fn new(ledger: Arc<dyn TaskLedger>, resolver: Arc<dyn PayloadResolver>) -> Self {
        Self { ledger, resolver }
    }

    /// Lease the task to `worker_id`.
    ///
    /// Returns the lease package on a fresh lease, the same package again if
    /// the worker already holds the lease, and `None` otherwise (held by
    /// someone else, expired, or gone). `None` means "keep polling".
    pub async fn assign(
        &self,
        task_id: TaskId,
        worker_id: &str,
    ) -> Result<Option<LeasePackage>, DispatchError> {
        let at = now();
        let guard = TaskPredicate::unleased()
            .and(TaskPredicate::NotExpiredAt(at))
            .and(TaskPredicate::NotTried(worker_id.to_string()));

        if let Some(task) = self
            .ledger
            .conditional_update(task_id, &guard, &TaskUpdate::new().lease_to(worker_id, at))
            .await?
        {
            info!(task_id = %task_id, worker_id, task_type = %task.task_type, "Task assigned");
            return self.package(&task, worker_id).await.map(Some);
        }

        match self.ledger.get(task_id).await? {
            Some(task) if task.is_leased_to(worker_id) => {
                info!(task_id = %task_id, worker_id, "Lease re-delivered to holder");
                self.package(&task, worker_id).await.map(Some)
            }
            Some(task) => {
                debug!(
                    task_id = %task_id,
                    worker_id,
                    status = %task.status,
                    holder = ?task.assigned_worker_id,
                    "Lease not granted"
                );
                Ok(None)
            }
            None => {
                debug!(task_id = %task_id, worker_id, "Lease requested for missing task");
                Ok(None)
            }
        }
    }

    async fn package(&self, task: &Task, worker_id: &str) -> Result<LeasePackage, DispatchError> {
        let payload = self.resolver.resolve(task).await?;
        Ok(LeasePackage::new(task, worker_id, payload))
    }
}
