//! Task ledger: durable task records with predicate-guarded updates.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod predicate;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use memory::MemoryLedger;
pub use predicate::{TaskFilter, TaskPredicate, TaskUpdate};
pub use traits::TaskLedger;
