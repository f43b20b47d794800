//! Validation handshake: a worker proves it can reach a task's
//! dependencies before it is trusted with the lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::whitelist::WhitelistCache;
use crate::dispatch::assignment::AssignmentEngine;
use crate::error::{DatabaseError, DispatchError};
use crate::store::{TaskLedger, TaskPredicate, TaskUpdate};
use crate::tasks::{LeasePackage, Task, TaskId, TaskStatus, now};

/// Whether a task's validation round is over.
///
/// Complete when every worker that started validating has reported (and at
/// least one did), or when the round has been open longer than `ceiling`
/// because workers can vanish mid-round without reporting. Either signal
/// counts, so a round can complete on other workers' reports alone.
pub fn is_validation_complete_at(task: &Task, at: DateTime<Utc>, ceiling: Duration) -> bool {
    let all_reported = !task.validating_workers.is_empty()
        && !task.validation_complete_workers.is_empty()
        && task
            .validation_complete_workers
            .is_superset(&task.validating_workers);

    let ceiling_elapsed = match (task.validation_started_at, chrono::Duration::from_std(ceiling)) {
        (Some(started), Ok(ceiling)) => at - started > ceiling,
        _ => false,
    };

    all_reported || ceiling_elapsed
}

/// Runs validation rounds and hands proven workers to the assignment engine.
pub struct ValidationCoordinator {
    ledger: Arc<dyn TaskLedger>,
    whitelist: Arc<WhitelistCache>,
    engine: Arc<AssignmentEngine>,
    ceiling: Duration,
}

impl ValidationCoordinator {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        whitelist: Arc<WhitelistCache>,
        engine: Arc<AssignmentEngine>,
        ceiling: Duration,
    ) -> Self {
        Self {
            ledger,
            whitelist,
            engine,
            ceiling,
        }
    }

    pub fn whitelist(&self) -> &WhitelistCache {
        &self.whitelist
    }

    /// Add the worker to the round, opening it if this is the first attempt.
    ///
    /// `None` if the task is gone, already leased, or was given up by this worker.
    pub async fn start_validation(
        &self,
        task_id: TaskId,
        worker_id: &str,
    ) -> Result<Option<Task>, DispatchError> {
        let updated = self
            .ledger
            .conditional_update(
                task_id,
                &TaskPredicate::unleased().and(TaskPredicate::NotTried(worker_id.to_string())),
                &TaskUpdate::new().validation_started(worker_id, now()),
            )
            .await?;

        match &updated {
            Some(task) => info!(
                task_id = %task_id,
                worker_id,
                validating = task.validating_workers.len(),
                "Validation started"
            ),
            None => debug!(task_id = %task_id, worker_id, "Validation start skipped, task not queued"),
        }
        Ok(updated)
    }

    /// Record a worker's verdict and lease the task to it when proven.
    pub async fn record_validation_result(
        &self,
        task_id: TaskId,
        worker_id: &str,
        proven: bool,
    ) -> Result<Option<LeasePackage>, DispatchError> {
        let updated = self
            .ledger
            .conditional_update(
                task_id,
                &TaskPredicate::unleased().and(TaskPredicate::NotTried(worker_id.to_string())),
                &TaskUpdate::new().validation_completed(worker_id),
            )
            .await?;

        let Some(task) = updated else {
            // Already leased: a repeated proven report from the holder is a re-delivery.
            if proven {
                return self.engine.assign(task_id, worker_id).await;
            }
            return Ok(None);
        };

        self.whitelist.record(worker_id, &task.signature(), proven);
        if !proven {
            info!(task_id = %task_id, worker_id, "Worker could not validate task");
            return Ok(None);
        }
        self.lease(task_id, worker_id).await
    }

    /// Assign through the engine, then drop the round's bookkeeping.
    pub async fn lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
    ) -> Result<Option<LeasePackage>, DispatchError> {
        let package = self.engine.assign(task_id, worker_id).await?;
        if package.is_some() {
            self.clear_validation_state(task_id).await?;
        }
        Ok(package)
    }

    pub fn is_validation_complete(&self, task: &Task) -> bool {
        is_validation_complete_at(task, now(), self.ceiling)
    }

    /// Unset both worker sets and the round start once the task is leased.
    pub async fn clear_validation_state(&self, task_id: TaskId) -> Result<(), DatabaseError> {
        self.ledger
            .conditional_update(
                task_id,
                &TaskPredicate::Status(TaskStatus::Started).and(TaskPredicate::ValidationRecorded),
                &TaskUpdate::new().clear_validation(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::payload::PassthroughPayloadResolver;
    use crate::store::MemoryLedger;
    use crate::tasks::{NewTask, TaskMode};

    const CEILING: Duration = Duration::from_secs(12);

    fn task() -> Task {
        Task::queued(
            "acct",
            NewTask::new("http", serde_json::Value::Null).with_capabilities(["https://a"]),
            TaskMode::Async,
            Duration::from_secs(600),
        )
    }

    fn workers(ids: &[&str]) -> std::collections::BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn coordinator() -> (Arc<MemoryLedger>, ValidationCoordinator) {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = Arc::new(AssignmentEngine::new(
            ledger.clone(),
            Arc::new(PassthroughPayloadResolver),
        ));
        let whitelist = Arc::new(WhitelistCache::new(
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ));
        let coordinator = ValidationCoordinator::new(ledger.clone(), whitelist, engine, CEILING);
        (ledger, coordinator)
    }

    #[test]
    fn complete_when_every_validator_reported() {
        let mut t = task();
        let started = now();
        t.validation_started_at = Some(started);
        t.validating_workers = workers(&["w1"]);
        assert!(!is_validation_complete_at(&t, started, CEILING));

        t.validation_complete_workers = workers(&["w1"]);
        assert!(is_validation_complete_at(&t, started, CEILING));
    }

    #[test]
    fn empty_sets_are_not_complete() {
        let mut t = task();
        t.validation_started_at = Some(now());
        assert!(!is_validation_complete_at(&t, now(), CEILING));

        t.validation_complete_workers = workers(&["w1"]);
        assert!(!is_validation_complete_at(&t, now(), CEILING));
    }

    #[test]
    fn ceiling_completes_a_silent_round() {
        let mut t = task();
        let started = now();
        t.validation_started_at = Some(started);
        t.validating_workers = workers(&["w1", "w2"]);
        t.validation_complete_workers = workers(&["w1"]);

        let just_before = started + chrono::Duration::milliseconds(12_000);
        let just_after = started + chrono::Duration::milliseconds(12_001);
        assert!(!is_validation_complete_at(&t, just_before, CEILING));
        assert!(is_validation_complete_at(&t, just_after, CEILING));
    }

    #[test]
    fn both_paths_agree_after_ceiling() {
        let mut t = task();
        let started = now();
        t.validation_started_at = Some(started);
        t.validating_workers = workers(&["w1"]);
        t.validation_complete_workers = workers(&["w1"]);
        let later = started + chrono::Duration::milliseconds(12_001);
        assert!(is_validation_complete_at(&t, later, CEILING));
    }

    #[tokio::test]
    async fn start_validation_stamps_once() {
        let (ledger, coordinator) = coordinator().await;
        let t = task();
        ledger.insert(&t).await.unwrap();

        let first = coordinator.start_validation(t.id, "w1").await.unwrap().unwrap();
        let second = coordinator.start_validation(t.id, "w2").await.unwrap().unwrap();
        assert_eq!(first.validation_started_at, second.validation_started_at);
        assert_eq!(second.validating_workers, workers(&["w1", "w2"]));
    }

    #[tokio::test]
    async fn proven_result_leases_and_clears_round() {
        let (ledger, coordinator) = coordinator().await;
        let t = task();
        ledger.insert(&t).await.unwrap();
        coordinator.start_validation(t.id, "w1").await.unwrap();

        let package = coordinator
            .record_validation_result(t.id, "w1", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(package.assigned_worker_id, "w1");
        assert!(coordinator.whitelist().is_whitelisted("w1", &t.signature()));

        let stored = ledger.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Started);
        assert!(stored.validating_workers.is_empty());
        assert!(stored.validation_complete_workers.is_empty());
        assert!(stored.validation_started_at.is_none());

        // Repeated report from the holder re-delivers the same lease.
        let again = coordinator
            .record_validation_result(t.id, "w1", true)
            .await
            .unwrap();
        assert_eq!(again, Some(package));
    }

    #[tokio::test]
    async fn refused_result_blacklists_without_lease() {
        let (ledger, coordinator) = coordinator().await;
        let t = task();
        ledger.insert(&t).await.unwrap();
        coordinator.start_validation(t.id, "w1").await.unwrap();

        let package = coordinator
            .record_validation_result(t.id, "w1", false)
            .await
            .unwrap();
        assert!(package.is_none());
        assert!(coordinator.whitelist().is_blacklisted("w1", &t.signature()));

        let stored = ledger.get(t.id).await.unwrap().unwrap();
        assert!(stored.is_unleased());
        assert!(coordinator.is_validation_complete(&stored));
    }

    #[tokio::test]
    async fn late_proof_from_other_worker_gets_nothing() {
        let (ledger, coordinator) = coordinator().await;
        let t = task();
        ledger.insert(&t).await.unwrap();
        coordinator.start_validation(t.id, "w1").await.unwrap();
        coordinator.start_validation(t.id, "w2").await.unwrap();

        assert!(
            coordinator
                .record_validation_result(t.id, "w1", true)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            coordinator
                .record_validation_result(t.id, "w2", true)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn requeued_worker_cannot_validate_its_way_back() {
        let (ledger, coordinator) = coordinator().await;
        let t = task();
        ledger.insert(&t).await.unwrap();
        coordinator.lease(t.id, "w1").await.unwrap().unwrap();
        ledger
            .conditional_update(
                t.id,
                &TaskPredicate::LeasedTo("w1".into()),
                &TaskUpdate::new().requeue_without("w1", now()),
            )
            .await
            .unwrap()
            .unwrap();

        assert!(coordinator.start_validation(t.id, "w1").await.unwrap().is_none());
        assert!(
            coordinator
                .record_validation_result(t.id, "w1", true)
                .await
                .unwrap()
                .is_none()
        );

        let stored = ledger.get(t.id).await.unwrap().unwrap();
        assert!(stored.is_unleased());
        assert!(stored.validating_workers.is_empty());
        assert!(stored.validation_complete_workers.is_empty());
    }
}
