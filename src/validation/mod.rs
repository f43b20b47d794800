//! Validation coordinator and the whitelist cache that lets proven
//! workers skip it.

pub mod coordinator;
pub mod whitelist;

pub use coordinator::{ValidationCoordinator, is_validation_complete_at};
pub use whitelist::WhitelistCache;
