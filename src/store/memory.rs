//! In-process ledger backed by a locked map.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::predicate::{TaskFilter, TaskPredicate, TaskUpdate};
use crate::store::traits::TaskLedger;
use crate::tasks::{Task, TaskId};

/// Ledger held entirely in memory.
///
/// The write lock spans predicate check and mutation, which makes
/// `conditional_update` atomic. No lock is held across any other await.
#[derive(Default)]
pub struct MemoryLedger {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskLedger for MemoryLedger {
    async fn insert(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(DatabaseError::DuplicateId(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn conditional_update(
        &self,
        id: TaskId,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        if !predicate.matches(task) || !update.permits(task) {
            return Ok(None);
        }
        update.apply(task);
        Ok(Some(task.clone()))
    }

    async fn delete(&self, id: TaskId) -> Result<bool, DatabaseError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn scan(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::tasks::{NewTask, TaskMode, TaskStatus, now};

    fn task(account: &str) -> Task {
        Task::queued(
            account,
            NewTask::new("http", serde_json::json!({"n": 1})),
            TaskMode::Async,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn insert_get_delete() {
        let ledger = MemoryLedger::new();
        let t = task("acct");
        ledger.insert(&t).await.unwrap();
        assert_eq!(ledger.get(t.id).await.unwrap(), Some(t.clone()));

        assert!(matches!(
            ledger.insert(&t).await,
            Err(DatabaseError::DuplicateId(id)) if id == t.id
        ));

        assert!(ledger.delete(t.id).await.unwrap());
        assert!(!ledger.delete(t.id).await.unwrap());
        assert!(ledger.get(t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn predicate_mismatch_is_not_an_error() {
        let ledger = MemoryLedger::new();
        let t = task("acct");
        ledger.insert(&t).await.unwrap();

        let won = ledger
            .conditional_update(t.id, &TaskPredicate::unleased(), &TaskUpdate::new().lease_to("w1", now()))
            .await
            .unwrap();
        assert_eq!(won.map(|t| t.status), Some(TaskStatus::Started));

        let lost = ledger
            .conditional_update(t.id, &TaskPredicate::unleased(), &TaskUpdate::new().lease_to("w2", now()))
            .await
            .unwrap();
        assert!(lost.is_none());
        let stored = ledger.get(t.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn concurrent_updates_have_one_winner() {
        let ledger = Arc::new(MemoryLedger::new());
        let t = task("acct");
        ledger.insert(&t).await.unwrap();

        let id = t.id;
        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .conditional_update(
                        id,
                        &TaskPredicate::unleased(),
                        &TaskUpdate::new().lease_to(&format!("w{i}"), now()),
                    )
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn scan_orders_by_creation() {
        let ledger = MemoryLedger::new();
        let first = task("acct");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = task("acct");
        let other = task("other");
        ledger.insert(&second).await.unwrap();
        ledger.insert(&other).await.unwrap();
        ledger.insert(&first).await.unwrap();

        let found = ledger.scan(&TaskFilter::account("acct")).await.unwrap();
        let ids: Vec<_> = found.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
