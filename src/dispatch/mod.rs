//! Assignment, responses, lifecycle and the sync bridge, plus the
//! `DispatchService` facade that the API layer talks to.

pub mod assignment;
pub mod lifecycle;
pub mod response;
pub mod service;
pub mod sweep;
pub mod sync_bridge;

pub use assignment::AssignmentEngine;
pub use lifecycle::LifecycleManager;
pub use response::{ResponseHandler, ResponseOutcome};
pub use service::{Collaborators, DispatchService, SweepReport};
pub use sweep::{spawn_dispatch_sweep, spawn_sync_reconciler};
pub use sync_bridge::SyncBridge;
