//! Guards, mutations and scan filters shared by every ledger backend.
//!
//! They are plain data so each backend evaluates them with the same code:
//! `TaskPredicate::matches` decides whether a conditional update applies,
//! `TaskUpdate::apply` performs it, `TaskFilter::matches` narrows scans.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::tasks::{Task, TaskId, TaskMode, TaskResponse, TaskStatus};

/// Condition on the stored record that must hold for an update to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPredicate {
    Always,
    Account(String),
    Status(TaskStatus),
    NonTerminal,
    Unassigned,
    /// Started and held by this worker.
    LeasedTo(String),
    AbortPendingFor(String),
    NotExpiredAt(DateTime<Utc>),
    /// Worker has not relinquished this task before.
    NotTried(String),
    /// Some validation bookkeeping is present.
    ValidationRecorded,
    All(Vec<TaskPredicate>),
}

impl TaskPredicate {
    /// `status == QUEUED AND assignedWorkerId unset`.
    pub fn unleased() -> Self {
        Self::All(vec![Self::Status(TaskStatus::Queued), Self::Unassigned])
    }

    pub fn and(self, other: TaskPredicate) -> Self {
        match self {
            Self::All(mut parts) => {
                parts.push(other);
                Self::All(parts)
            }
            Self::Always => other,
            first => Self::All(vec![first, other]),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Always => true,
            Self::Account(account_id) => task.account_id == *account_id,
            Self::Status(status) => task.status == *status,
            Self::NonTerminal => !task.status.is_terminal(),
            Self::Unassigned => task.assigned_worker_id.is_none(),
            Self::LeasedTo(worker_id) => task.is_leased_to(worker_id),
            Self::AbortPendingFor(worker_id) => {
                task.abort_pending_for.as_deref() == Some(worker_id.as_str())
            }
            Self::NotExpiredAt(at) => !task.is_expired_at(*at),
            Self::NotTried(worker_id) => !task.already_tried_workers.contains(worker_id),
            Self::ValidationRecorded => {
                task.validation_started_at.is_some()
                    || !task.validating_workers.is_empty()
                    || !task.validation_complete_workers.is_empty()
            }
            Self::All(parts) => parts.iter().all(|p| p.matches(task)),
        }
    }
}

/// A single field mutation.
#[derive(Debug, Clone, PartialEq)]
enum UpdateOp {
    Status(TaskStatus),
    AssignedWorker(Option<String>),
    StartedAt(Option<DateTime<Utc>>),
    AddValidating(String),
    StampValidationStarted(DateTime<Utc>),
    AddValidationComplete(String),
    ClearValidation,
    AddAlreadyTried(String),
    ResetBroadcast(DateTime<Utc>),
    BumpBroadcast(DateTime<Utc>),
    Result(TaskResponse),
    ParkAssignmentForAbort,
    ClearAbortPending,
}

/// An ordered list of mutations applied atomically by `conditional_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    ops: Vec<UpdateOp>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, op: UpdateOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn status(self, status: TaskStatus) -> Self {
        self.push(UpdateOp::Status(status))
    }

    /// Grant the lease: started, held by `worker_id`, stamped `at`.
    pub fn lease_to(self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self.status(TaskStatus::Started)
            .push(UpdateOp::AssignedWorker(Some(worker_id.to_string())))
            .push(UpdateOp::StartedAt(Some(at)))
    }

    /// Return a leased task to the queue, excluding `worker_id` from it for good.
    pub fn requeue_without(self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self.status(TaskStatus::Queued)
            .push(UpdateOp::AssignedWorker(None))
            .push(UpdateOp::StartedAt(None))
            .push(UpdateOp::ClearValidation)
            .push(UpdateOp::ResetBroadcast(at))
            .push(UpdateOp::AddAlreadyTried(worker_id.to_string()))
    }

    /// Add to `validatingWorkers`; stamp `validationStartedAt` only if absent.
    pub fn validation_started(self, worker_id: &str, at: DateTime<Utc>) -> Self {
        self.push(UpdateOp::AddValidating(worker_id.to_string()))
            .push(UpdateOp::StampValidationStarted(at))
    }

    pub fn validation_completed(self, worker_id: &str) -> Self {
        self.push(UpdateOp::AddValidationComplete(worker_id.to_string()))
    }

    pub fn clear_validation(self) -> Self {
        self.push(UpdateOp::ClearValidation)
    }

    pub fn rebroadcast(self, at: DateTime<Utc>) -> Self {
        self.push(UpdateOp::BumpBroadcast(at))
    }

    pub fn result(self, response: TaskResponse) -> Self {
        self.push(UpdateOp::Result(response))
    }

    /// Mark aborted and move the current holder into `abortPendingFor`.
    pub fn abort(self) -> Self {
        self.status(TaskStatus::Aborted)
            .push(UpdateOp::ParkAssignmentForAbort)
    }

    pub fn abort_delivered(self) -> Self {
        self.push(UpdateOp::ClearAbortPending)
    }

    /// Whether every status change in this update is a legal transition
    /// from the task's current status.
    pub fn permits(&self, task: &Task) -> bool {
        let mut current = task.status;
        for op in &self.ops {
            if let UpdateOp::Status(target) = op {
                if *target != current && !current.can_transition_to(*target) {
                    return false;
                }
                current = *target;
            }
        }
        true
    }

    /// Apply every mutation in order and bump the record version.
    pub fn apply(&self, task: &mut Task) {
        for op in &self.ops {
            match op {
                UpdateOp::Status(status) => task.status = *status,
                UpdateOp::AssignedWorker(worker) => task.assigned_worker_id = worker.clone(),
                UpdateOp::StartedAt(at) => task.started_at = *at,
                UpdateOp::AddValidating(worker) => {
                    task.validating_workers.insert(worker.clone());
                }
                UpdateOp::StampValidationStarted(at) => {
                    if task.validation_started_at.is_none() {
                        task.validation_started_at = Some(*at);
                    }
                }
                UpdateOp::AddValidationComplete(worker) => {
                    task.validation_complete_workers.insert(worker.clone());
                }
                UpdateOp::ClearValidation => {
                    task.validating_workers.clear();
                    task.validation_complete_workers.clear();
                    task.validation_started_at = None;
                }
                UpdateOp::AddAlreadyTried(worker) => {
                    task.already_tried_workers.insert(worker.clone());
                }
                UpdateOp::ResetBroadcast(at) => {
                    task.broadcast_count = 1;
                    task.last_broadcast_at = Some(*at);
                }
                UpdateOp::BumpBroadcast(at) => {
                    task.broadcast_count = task.broadcast_count.saturating_add(1);
                    task.last_broadcast_at = Some(*at);
                }
                UpdateOp::Result(response) => task.result = Some(response.clone()),
                UpdateOp::ParkAssignmentForAbort => {
                    if let Some(worker) = task.assigned_worker_id.take() {
                        task.abort_pending_for = Some(worker);
                    }
                }
                UpdateOp::ClearAbortPending => task.abort_pending_for = None,
            }
        }
        task.version += 1;
    }
}

/// Scan criteria. Empty / `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub account_id: Option<String>,
    pub statuses: Vec<TaskStatus>,
    pub mode: Option<TaskMode>,
    pub ids: Option<HashSet<TaskId>>,
    pub unassigned_only: bool,
    pub abort_pending_for: Option<String>,
    /// Poll-window cutoff: only tasks created strictly after this.
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub not_expired_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(account_id) = &self.account_id {
            if task.account_id != *account_id {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if self.mode.is_some_and(|m| m != task.mode) {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&task.id) {
                return false;
            }
        }
        if self.unassigned_only && task.assigned_worker_id.is_some() {
            return false;
        }
        if let Some(worker) = &self.abort_pending_for {
            if task.abort_pending_for.as_deref() != Some(worker.as_str()) {
                return false;
            }
        }
        if self.created_after.is_some_and(|t| task.created_at <= t) {
            return false;
        }
        if self.created_before.is_some_and(|t| task.created_at >= t) {
            return false;
        }
        if self.not_expired_at.is_some_and(|t| task.is_expired_at(t)) {
            return false;
        }
        if self.expired_at.is_some_and(|t| !task.is_expired_at(t)) {
            return false;
        }
        true
    }
}
