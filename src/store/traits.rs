//! Backend-agnostic task ledger trait.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::predicate::{TaskFilter, TaskPredicate, TaskUpdate};
use crate::tasks::{Task, TaskId};

/// Durable store of task records.
///
/// `conditional_update` is the only serialization point for a task: every
/// order-sensitive transition goes through it, and a backend must evaluate
/// the predicate and write the mutation as one atomic step.
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Persist a new task. Fails with `DuplicateId` if the id is taken.
    async fn insert(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Point lookup. `None` if absent or deleted.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError>;

    /// Apply `update` iff the stored record satisfies `predicate`.
    ///
    /// Returns the post-mutation record, or `None` when the record is
    /// missing or the predicate no longer holds (someone else won).
    async fn conditional_update(
        &self,
        id: TaskId,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Physical removal. Returns whether a row was deleted.
    async fn delete(&self, id: TaskId) -> Result<bool, DatabaseError>;

    /// Tasks matching `filter`, oldest first.
    async fn scan(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;
}
