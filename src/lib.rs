//! Task dispatch: a ledger of queued work, capability-gated leasing to
//! polling workers, and sync/async result delivery.

pub mod api;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod eligibility;
pub mod error;
pub mod store;
pub mod tasks;
pub mod validation;
