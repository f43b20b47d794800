//! Task model: the dispatchable unit of work and its lifecycle.

pub mod model;
pub mod state;

pub use model::{
    Acquisition, LeasePackage, NewTask, ResponseCode, Task, TaskEvent, TaskResponse, now,
    task_signature,
};
pub use state::{TaskMode, TaskStatus};

/// Opaque task identifier.
pub type TaskId = uuid::Uuid;
