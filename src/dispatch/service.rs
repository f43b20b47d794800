//! Caller- and worker-facing entry points of the dispatch core.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::assignment::AssignmentEngine;
use super::lifecycle::LifecycleManager;
use super::response::{ResponseHandler, ResponseOutcome};
use super::sync_bridge::SyncBridge;
use crate::channels::{CompletionChannel, Notifier, PayloadResolver, Signal};
use crate::config::DispatchConfig;
use crate::eligibility::{EligibilityGate, WorkerDirectory};
use crate::error::DispatchError;
use crate::store::{TaskFilter, TaskLedger, TaskPredicate, TaskUpdate};
use crate::tasks::{
    Acquisition, LeasePackage, NewTask, Task, TaskEvent, TaskId, TaskMode, TaskResponse,
    TaskStatus, now,
};
use crate::validation::{ValidationCoordinator, WhitelistCache};

/// Counts from one pass of the dispatch sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub validation_failed: usize,
    pub rebroadcast: usize,
    pub collected: usize,
}

/// Everything the dispatch core needs from the outside.
pub struct Collaborators {
    pub ledger: Arc<dyn TaskLedger>,
    pub directory: Arc<dyn WorkerDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub completion: Arc<dyn CompletionChannel>,
    pub resolver: Arc<dyn PayloadResolver>,
}

/// Facade wiring the ledger, gate, coordinator, engine and handlers.
pub struct DispatchService {
    config: DispatchConfig,
    ledger: Arc<dyn TaskLedger>,
    gate: Arc<EligibilityGate>,
    whitelist: Arc<WhitelistCache>,
    coordinator: ValidationCoordinator,
    responses: ResponseHandler,
    lifecycle: LifecycleManager,
    bridge: Arc<SyncBridge>,
    notifier: Arc<dyn Notifier>,
}

fn ago(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl DispatchService {
    pub fn new(config: DispatchConfig, deps: Collaborators) -> Self {
        let Collaborators {
            ledger,
            directory,
            notifier,
            completion,
            resolver,
        } = deps;

        let gate = Arc::new(EligibilityGate::new(directory));
        let whitelist = Arc::new(WhitelistCache::new(
            config.whitelist_ttl,
            config.blacklist_ttl,
        ));
        let engine = Arc::new(AssignmentEngine::new(Arc::clone(&ledger), resolver));
        let coordinator = ValidationCoordinator::new(
            Arc::clone(&ledger),
            Arc::clone(&whitelist),
            engine,
            config.validation_ceiling,
        );
        let responses = ResponseHandler::new(
            Arc::clone(&ledger),
            Arc::clone(&gate),
            Arc::clone(&whitelist),
            Arc::clone(&notifier),
            Arc::clone(&completion),
        );
        let lifecycle = LifecycleManager::new(
            Arc::clone(&ledger),
            Arc::clone(&gate),
            Arc::clone(&notifier),
            completion,
        );
        let bridge = Arc::new(SyncBridge::new(Arc::clone(&ledger), Arc::clone(&notifier)));

        Self {
            config,
            ledger,
            gate,
            whitelist,
            coordinator,
            responses,
            lifecycle,
            bridge,
            notifier,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn sync_bridge(&self) -> Arc<SyncBridge> {
        Arc::clone(&self.bridge)
    }

    pub fn whitelist(&self) -> &WhitelistCache {
        &self.whitelist
    }

    fn check_new_task(new: &NewTask) -> Result<(), DispatchError> {
        if new.task_type.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "task_type must not be empty".to_string(),
            ));
        }
        if new.timeout_ms == Some(0) {
            return Err(DispatchError::InvalidArgument(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Persist an async task and announce it to the account's workers.
    pub async fn queue_task(&self, account_id: &str, new: NewTask) -> Result<Task, DispatchError> {
        Self::check_new_task(&new)?;
        let task = Task::queued(account_id, new, TaskMode::Async, self.config.default_task_expiry);
        self.ledger.insert(&task).await?;
        info!(
            task_id = %task.id,
            account_id,
            task_type = %task.task_type,
            "Task queued"
        );
        self.notifier.notify(account_id, Signal::TaskAvailable).await;
        Ok(task)
    }

    /// Run a sync task and block until it settles or times out.
    ///
    /// Fails with `ServiceUnavailable` before anything is persisted when no
    /// connected worker is eligible.
    pub async fn execute(
        &self,
        account_id: &str,
        new: NewTask,
    ) -> Result<TaskResponse, DispatchError> {
        Self::check_new_task(&new)?;
        let task = Task::queued(account_id, new, TaskMode::Sync, self.config.default_task_expiry);

        if self.gate.eligible_workers(&task).await.is_empty() {
            return Err(DispatchError::ServiceUnavailable {
                account_id: account_id.to_string(),
                task_type: task.task_type,
            });
        }
        self.bridge.execute(task).await
    }

    pub async fn get_task(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Task>, DispatchError> {
        Ok(self
            .ledger
            .get(task_id)
            .await?
            .filter(|t| t.account_id == account_id))
    }

    /// Queued tasks the worker may ask for (sync first, then async), plus
    /// abort notices for tasks it held. Each abort notice is surfaced once.
    pub async fn poll_events(
        &self,
        account_id: &str,
        worker_id: &str,
        sync_only: bool,
    ) -> Result<Vec<TaskEvent>, DispatchError> {
        let at = now();
        let queued = TaskFilter {
            account_id: Some(account_id.to_string()),
            statuses: vec![TaskStatus::Queued],
            mode: sync_only.then_some(TaskMode::Sync),
            unassigned_only: true,
            created_after: Some(ago(at, self.config.poll_window)),
            not_expired_at: Some(at),
            ..TaskFilter::default()
        };

        let (sync, not_sync): (Vec<Task>, Vec<Task>) = self
            .ledger
            .scan(&queued)
            .await?
            .into_iter()
            .filter(|t| !t.already_tried_workers.contains(worker_id))
            .partition(|t| t.mode == TaskMode::Sync);

        let mut events: Vec<TaskEvent> = sync
            .iter()
            .chain(not_sync.iter())
            .map(|t| TaskEvent::Available {
                task_id: t.id,
                mode: t.mode,
            })
            .collect();

        let aborted = TaskFilter {
            account_id: Some(account_id.to_string()),
            statuses: vec![TaskStatus::Aborted],
            abort_pending_for: Some(worker_id.to_string()),
            ..TaskFilter::default()
        };
        for task in self.ledger.scan(&aborted).await? {
            let delivered = self
                .ledger
                .conditional_update(
                    task.id,
                    &TaskPredicate::AbortPendingFor(worker_id.to_string()),
                    &TaskUpdate::new().abort_delivered(),
                )
                .await?;
            if delivered.is_some() {
                events.push(TaskEvent::Abort { task_id: task.id });
            }
        }

        debug!(account_id, worker_id, events = events.len(), "Poll served");
        Ok(events)
    }

    /// A worker asks for a task it saw in a poll.
    ///
    /// `None` means "keep polling": the task is gone, held by someone else,
    /// expired, or this worker is excluded from it.
    pub async fn acquire(
        &self,
        account_id: &str,
        worker_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Acquisition>, DispatchError> {
        let Some(task) = self.get_task(account_id, task_id).await? else {
            return Ok(None);
        };

        if task.is_leased_to(worker_id) {
            return Ok(self
                .coordinator
                .lease(task_id, worker_id)
                .await?
                .map(Acquisition::Leased));
        }
        if !task.is_unleased()
            || task.is_expired_at(now())
            || task.already_tried_workers.contains(worker_id)
        {
            debug!(task_id = %task_id, worker_id, status = %task.status, "Acquire refused");
            return Ok(None);
        }

        if !self.gate.is_capable(worker_id, &task).await {
            // Raises the gate's alert when no connected worker qualifies.
            self.gate.eligible_workers(&task).await;
            debug!(task_id = %task_id, worker_id, "Worker lacks required capabilities");
            return Ok(None);
        }

        let signature = task.signature();
        if task.capabilities.is_empty() || self.whitelist.is_whitelisted(worker_id, &signature) {
            return Ok(self
                .coordinator
                .lease(task_id, worker_id)
                .await?
                .map(Acquisition::Leased));
        }
        if self.whitelist.is_blacklisted(worker_id, &signature) {
            debug!(task_id = %task_id, worker_id, "Worker recently failed validation for this signature");
            return Ok(None);
        }

        Ok(self
            .coordinator
            .start_validation(task_id, worker_id)
            .await?
            .map(|task| Acquisition::ValidationRequired {
                task_id,
                capabilities: task.capabilities,
            }))
    }

    /// A worker reports whether it could reach the task's dependencies.
    pub async fn report_validation(
        &self,
        account_id: &str,
        worker_id: &str,
        task_id: TaskId,
        proven: bool,
    ) -> Result<Option<LeasePackage>, DispatchError> {
        let Some(task) = self.get_task(account_id, task_id).await? else {
            return Ok(None);
        };
        if task.already_tried_workers.contains(worker_id) {
            return Ok(None);
        }
        self.coordinator
            .record_validation_result(task_id, worker_id, proven)
            .await
    }

    pub async fn respond(
        &self,
        account_id: &str,
        task_id: TaskId,
        worker_id: &str,
        response: TaskResponse,
    ) -> Result<ResponseOutcome, DispatchError> {
        if self.get_task(account_id, task_id).await?.is_none() {
            debug!(task_id = %task_id, worker_id, "Response for unknown task ignored");
            return Ok(ResponseOutcome::Ignored);
        }
        self.responses
            .on_worker_response(task_id, worker_id, response)
            .await
    }

    pub async fn abort(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Task>, DispatchError> {
        self.lifecycle.abort(account_id, task_id).await
    }

    pub async fn expire(
        &self,
        account_id: &str,
        task_id: TaskId,
    ) -> Result<Option<Task>, DispatchError> {
        self.lifecycle.expire(account_id, task_id).await
    }

    /// One pass over the ledger: expire overdue tasks, fail tasks whose
    /// validation round found nobody, re-announce stale tasks and delete
    /// old settled async tasks.
    pub async fn sweep_once(&self) -> Result<SweepReport, DispatchError> {
        let at = now();
        let mut report = SweepReport::default();

        let overdue = TaskFilter {
            statuses: vec![TaskStatus::Queued],
            unassigned_only: true,
            expired_at: Some(at),
            ..TaskFilter::default()
        };
        for task in self.ledger.scan(&overdue).await? {
            if self.expire_quietly(&task).await {
                report.expired += 1;
            }
        }

        let open = TaskFilter {
            statuses: vec![TaskStatus::Queued],
            unassigned_only: true,
            not_expired_at: Some(at),
            ..TaskFilter::default()
        };
        let stale_before = ago(at, self.config.rebroadcast_interval);
        let mut announce: BTreeSet<String> = BTreeSet::new();

        for task in self.ledger.scan(&open).await? {
            if task.validation_started_at.is_some()
                && self.coordinator.is_validation_complete(&task)
                && !self.has_whitelisted_worker(&task).await
            {
                if self.expire_quietly(&task).await {
                    report.validation_failed += 1;
                }
                continue;
            }

            if task.last_broadcast_at.is_none_or(|t| t <= stale_before) {
                let bumped = self
                    .ledger
                    .conditional_update(task.id, &TaskPredicate::unleased(), &TaskUpdate::new().rebroadcast(at))
                    .await?;
                if bumped.is_some() {
                    report.rebroadcast += 1;
                    announce.insert(task.account_id.clone());
                }
            }
        }
        join_all(
            announce
                .iter()
                .map(|account_id| self.notifier.notify(account_id, Signal::TaskAvailable)),
        )
        .await;

        let settled = TaskFilter {
            statuses: TaskStatus::TERMINAL.to_vec(),
            mode: Some(TaskMode::Async),
            created_before: Some(ago(at, self.config.async_retention)),
            ..TaskFilter::default()
        };
        for task in self.ledger.scan(&settled).await? {
            if self.ledger.delete(task.id).await? {
                report.collected += 1;
            }
        }

        // Sync rows whose caller is gone and whose wait window has closed.
        let orphaned = TaskFilter {
            statuses: TaskStatus::TERMINAL.to_vec(),
            mode: Some(TaskMode::Sync),
            ..TaskFilter::default()
        };
        for task in self.ledger.scan(&orphaned).await? {
            if self.bridge.is_waiting(task.id) || ago(at, task.timeout()) < task.created_at {
                continue;
            }
            if self.ledger.delete(task.id).await? {
                debug!(task_id = %task.id, "Collected orphaned sync task");
                report.collected += 1;
            }
        }

        let evicted = self.whitelist.evict_expired();
        let forgotten = self.gate.evict_stale().await;
        if report != SweepReport::default() || evicted > 0 || forgotten > 0 {
            info!(
                expired = report.expired,
                validation_failed = report.validation_failed,
                rebroadcast = report.rebroadcast,
                collected = report.collected,
                evicted,
                forgotten,
                "Dispatch sweep"
            );
        }
        Ok(report)
    }

    /// Some connected, capable worker not excluded from the task is
    /// whitelisted for its signature.
    async fn has_whitelisted_worker(&self, task: &Task) -> bool {
        let signature = task.signature();
        for worker_id in self.gate.connected_workers(&task.account_id).await {
            if task.already_tried_workers.contains(&worker_id)
                || !self.whitelist.is_whitelisted(&worker_id, &signature)
            {
                continue;
            }
            if self.gate.is_capable(&worker_id, task).await {
                return true;
            }
        }
        false
    }

    async fn expire_quietly(&self, task: &Task) -> bool {
        match self.lifecycle.expire(&task.account_id, task.id).await {
            Ok(Some(t)) => t.status == TaskStatus::Error,
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Sweep failed to expire task");
                false
            }
        }
    }
}
