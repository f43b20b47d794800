//! Blocks sync callers until their task settles.
//!
//! Waiters live in a process-local table keyed by task id. A periodic
//! reconciliation scan looks for settled sync tasks that have a waiter and
//! wakes it. The table is not shared between replicas: a sync caller only
//! wakes when the reconciliation scan runs in its own process.
//!
//! A caller that goes away mid-wait (its future dropped) still has its row
//! deleted: the wait guard hands the delete to the runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::channels::{Notifier, Signal};
use crate::error::{DatabaseError, DispatchError};
use crate::store::{TaskFilter, TaskLedger};
use crate::tasks::{Task, TaskId, TaskMode, TaskResponse, TaskStatus};

pub struct SyncBridge {
    ledger: Arc<dyn TaskLedger>,
    notifier: Arc<dyn Notifier>,
    waiters: Mutex<HashMap<TaskId, Arc<Notify>>>,
}

/// Removes the wait entry on every exit path, and the row too unless
/// `execute` got far enough to discard it itself.
struct WaitGuard<'a> {
    bridge: &'a SyncBridge,
    task_id: TaskId,
    owns_row: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.bridge.waiters().remove(&self.task_id);
        if !self.owns_row {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(task_id = %self.task_id, "Sync caller dropped outside a runtime, row left behind");
            return;
        };
        let ledger = Arc::clone(&self.bridge.ledger);
        let task_id = self.task_id;
        info!(task_id = %task_id, "Sync caller went away, deleting its row");
        runtime.spawn(async move {
            if let Err(e) = ledger.delete(task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to delete abandoned sync task row");
            }
        });
    }
}

impl SyncBridge {
    pub fn new(ledger: Arc<dyn TaskLedger>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ledger,
            notifier,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Poisoning is ignored: every critical section is a single map operation.
    fn waiters(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<Notify>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of callers currently blocked.
    pub fn pending(&self) -> usize {
        self.waiters().len()
    }

    /// A caller in this process is blocked on the task.
    pub fn is_waiting(&self, task_id: TaskId) -> bool {
        self.waiters().contains_key(&task_id)
    }

    fn register(&self, task_id: TaskId) -> (WaitGuard<'_>, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        self.waiters().insert(task_id, Arc::clone(&notify));
        (
            WaitGuard {
                bridge: self,
                task_id,
                owns_row: false,
            },
            notify,
        )
    }

    /// Persist a queued sync task and wait for its result.
    ///
    /// The task row is deleted before returning, whatever the outcome.
    pub async fn execute(&self, task: Task) -> Result<TaskResponse, DispatchError> {
        let task_id = task.id;
        let timeout = task.timeout();

        // Register before the row exists so a fast worker cannot finish unseen.
        let (mut guard, notify) = self.register(task_id);
        self.ledger.insert(&task).await?;
        guard.owns_row = true;
        info!(task_id = %task_id, account_id = %task.account_id, ?timeout, "Sync task queued");
        self.notifier
            .notify(&task.account_id, Signal::TaskAvailable)
            .await;

        let woken = tokio::time::timeout(timeout, notify.notified()).await.is_ok();
        debug!(task_id = %task_id, woken, "Sync wait over");

        let settled = match self.ledger.get(task_id).await {
            Ok(settled) => settled,
            Err(e) => {
                self.discard(task_id).await;
                guard.owns_row = false;
                return Err(e.into());
            }
        };
        let Some(settled) = settled else {
            guard.owns_row = false;
            error!(task_id = %task_id, "Sync task row vanished while a caller was waiting");
            return Err(DispatchError::TaskVanished { task_id });
        };
        self.discard(task_id).await;
        guard.owns_row = false;

        match (settled.status.is_terminal(), settled.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(DispatchError::TaskAborted { task_id }),
            (false, _) => {
                warn!(
                    task_id = %task_id,
                    worker_id = ?settled.assigned_worker_id,
                    "Sync task timed out"
                );
                Err(DispatchError::SyncTimeout {
                    task_id,
                    worker_id: settled.assigned_worker_id,
                    timeout,
                })
            }
        }
    }

    async fn discard(&self, task_id: TaskId) {
        if let Err(e) = self.ledger.delete(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to delete sync task row");
        }
    }

    /// Wake every waiter whose sync task has settled. Returns how many woke.
    pub async fn reconcile(&self) -> Result<usize, DatabaseError> {
        let ids: HashSet<TaskId> = self.waiters().keys().copied().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let filter = TaskFilter {
            ids: Some(ids),
            mode: Some(TaskMode::Sync),
            statuses: TaskStatus::TERMINAL.to_vec(),
            ..TaskFilter::default()
        };
        let settled = self.ledger.scan(&filter).await?;

        let mut woken = 0;
        let waiters = self.waiters();
        for task in &settled {
            if let Some(notify) = waiters.get(&task.id) {
                notify.notify_one();
                woken += 1;
            }
        }
        drop(waiters);
        if woken > 0 {
            debug!(woken, "Sync waiters woken");
        }
        Ok(woken)
    }
}
