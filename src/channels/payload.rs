//! Payload resolution at lease time.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::tasks::Task;

/// Rewrites a leased task's payload (secret expansion, decryption) before
/// it is handed to the worker. The dispatch core treats both sides as opaque.
#[async_trait]
pub trait PayloadResolver: Send + Sync {
    async fn resolve(&self, task: &Task) -> Result<serde_json::Value, ChannelError>;
}

/// Hands the stored payload through unchanged.
pub struct PassthroughPayloadResolver;

#[async_trait]
impl PayloadResolver for PassthroughPayloadResolver {
    async fn resolve(&self, task: &Task) -> Result<serde_json::Value, ChannelError> {
        Ok(task.payload.clone())
    }
}
