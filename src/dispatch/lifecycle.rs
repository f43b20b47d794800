//! Administrative abort and expiry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::{CompletionChannel, Notifier, Signal};
use crate::eligibility::{EligibilityGate, diagnostics};
use crate::error::DispatchError;
use crate::store::{TaskLedger, TaskPredicate, TaskUpdate};
use crate::tasks::{Task, TaskId, TaskMode, TaskResponse, TaskStatus};

pub struct LifecycleManager {
    ledger: Arc<dyn TaskLedger>,
    gate: Arc<EligibilityGate>,
    notifier: Arc<dyn Notifier>,
    completion: Arc<dyn CompletionChannel>,
}

impl LifecycleManager {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        gate: Arc<EligibilityGate>,
        notifier: Arc<dyn Notifier>,
        completion: Arc<dyn CompletionChannel>,
    ) -> Self {
        Self {
            ledger,
            gate,
            notifier,
            completion,
        }
    }

    /// Abort a queued or started task and signal its holder.
    ///
    /// Aborting a terminal task is a no-op. Returns the current record, or
    /// `None` if the task does not exist in this account.
    pub async fn abort(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Task>, DispatchError> {
        let guard = TaskPredicate::Account(account_id.to_string()).and(TaskPredicate::NonTerminal);
        let aborted = self
            .ledger
            .conditional_update(task_id, &guard, &TaskUpdate::new().abort())
            .await?;

        let Some(task) = aborted else {
            return self.current(account_id, task_id, "abort").await;
        };

        info!(task_id = %task_id, account_id, holder = ?task.abort_pending_for, "Task aborted");
        self.notifier
            .notify(account_id, Signal::TaskAbort(task_id))
            .await;
        self.complete_waiter(&task, &TaskResponse::failed("Task was aborted"))
            .await;
        Ok(Some(task))
    }

    /// Fail a task that no worker took before it could be dispatched,
    /// attaching a diagnostic of who was consulted.
    pub async fn expire(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Task>, DispatchError> {
        let Some(task) = self.current(account_id, task_id, "expire").await? else {
            return Ok(None);
        };
        if !task.is_unleased() {
            debug!(task_id = %task_id, status = %task.status, "Expire skipped, task not queued");
            return Ok(Some(task));
        }

        let connected = self.gate.connected_workers(account_id).await;
        let response = TaskResponse::failed(diagnostics::expiry_message(&task, &connected));

        let guard = TaskPredicate::Account(account_id.to_string()).and(TaskPredicate::unleased());
        let expired = self
            .ledger
            .conditional_update(
                task_id,
                &guard,
                &TaskUpdate::new()
                    .status(TaskStatus::Error)
                    .result(response.clone()),
            )
            .await?;

        let Some(task) = expired else {
            return self.current(account_id, task_id, "expire").await;
        };

        info!(
            task_id = %task_id,
            account_id,
            connected = connected.len(),
            "Task expired"
        );
        self.notifier
            .notify(account_id, Signal::TaskAbort(task_id))
            .await;
        self.complete_waiter(&task, &response).await;
        Ok(Some(task))
    }

    async fn current(
        &self,
        account_id: &str,
        task_id: TaskId,
        op: &str,
    ) -> Result<Option<Task>, DispatchError> {
        match self.ledger.get(task_id).await? {
            Some(task) if task.account_id == account_id => {
                debug!(task_id = %task_id, status = %task.status, op, "No-op on settled task");
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    async fn complete_waiter(&self, task: &Task, response: &TaskResponse) {
        if task.mode != TaskMode::Async {
            return;
        }
        if let Some(wait_id) = &task.wait_id {
            if let Err(e) = self.completion.complete(wait_id, response).await {
                warn!(task_id = %task.id, wait_id, error = %e, "Completion delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channels::{BroadcastNotifier, MemoryCompletionChannel};
    use crate::eligibility::InMemoryWorkerDirectory;
    use crate::store::MemoryLedger;
    use crate::tasks::{NewTask, ResponseCode, now};

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        directory: Arc<InMemoryWorkerDirectory>,
        notifier: Arc<BroadcastNotifier>,
        completion: Arc<MemoryCompletionChannel>,
        manager: LifecycleManager,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let directory = Arc::new(InMemoryWorkerDirectory::new(Duration::from_secs(60)));
        let notifier = Arc::new(BroadcastNotifier::new());
        let completion = Arc::new(MemoryCompletionChannel::new());
        let manager = LifecycleManager::new(
            ledger.clone(),
            Arc::new(EligibilityGate::new(directory.clone())),
            notifier.clone(),
            completion.clone(),
        );
        Fixture {
            ledger,
            directory,
            notifier,
            completion,
            manager,
        }
    }

    async fn insert(f: &Fixture, caps: &[&str]) -> Task {
        let t = Task::queued(
            "acct",
            NewTask::new("http", serde_json::Value::Null)
                .with_capabilities(caps.iter().copied())
                .with_wait_id("wait-1"),
            TaskMode::Async,
            Duration::from_secs(600),
        );
        f.ledger.insert(&t).await.unwrap();
        t
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let f = fixture();
        let mut signals = f.notifier.subscribe("acct").await;
        let t = insert(&f, &[]).await;
        f.ledger
            .conditional_update(t.id, &TaskPredicate::unleased(), &TaskUpdate::new().lease_to("w1", now()))
            .await
            .unwrap();

        let first = f.manager.abort("acct", t.id).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Aborted);
        assert!(first.assigned_worker_id.is_none());
        assert_eq!(first.abort_pending_for.as_deref(), Some("w1"));
        assert_eq!(signals.recv().await.unwrap(), format!("TASK_ABORT:{}", t.id));

        let second = f.manager.abort("acct", t.id).await.unwrap().unwrap();
        assert_eq!(second, first);
        assert!(signals.try_recv().is_err());
        assert_eq!(f.completion.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn abort_respects_account_scope() {
        let f = fixture();
        let t = insert(&f, &[]).await;
        assert!(f.manager.abort("other", t.id).await.unwrap().is_none());
        assert_eq!(
            f.ledger.get(t.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn expire_attaches_diagnostic() {
        let f = fixture();
        f.directory.touch("acct", "w1", Vec::<String>::new()).await;
        let t = insert(&f, &["https://a", "https://b", "https://c", "https://d", "https://e"]).await;
        f.ledger
            .conditional_update(
                t.id,
                &TaskPredicate::unleased(),
                &TaskUpdate::new().validation_started("w1", now()),
            )
            .await
            .unwrap();

        let expired = f.manager.expire("acct", t.id).await.unwrap().unwrap();
        assert_eq!(expired.status, TaskStatus::Error);
        let result = expired.result.unwrap();
        assert_eq!(result.code, ResponseCode::Failed);
        let message = result.error_message.unwrap();
        assert!(message.contains("+1 more"));
        assert!(message.contains("Did not report: [w1]"));

        let delivered = f.completion.delivered().await;
        assert_eq!(delivered[0].wait_id, "wait-1");
    }

    #[tokio::test]
    async fn expire_leaves_started_tasks_alone() {
        let f = fixture();
        let t = insert(&f, &[]).await;
        f.ledger
            .conditional_update(t.id, &TaskPredicate::unleased(), &TaskUpdate::new().lease_to("w1", now()))
            .await
            .unwrap();

        let current = f.manager.expire("acct", t.id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Started);
        assert!(f.completion.delivered().await.is_empty());
    }
}
