//! Lightweight "task available" / "task aborted" signals to workers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::tasks::TaskId;

/// Default per-account broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

const TASK_AVAILABLE: &str = "TASK_AVAILABLE";
const TASK_ABORT_PREFIX: &str = "TASK_ABORT:";

/// A payload-free signal. On the wire it is a short string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    TaskAvailable,
    TaskAbort(TaskId),
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskAvailable => write!(f, "{TASK_AVAILABLE}"),
            Self::TaskAbort(id) => write!(f, "{TASK_ABORT_PREFIX}{id}"),
        }
    }
}

impl std::str::FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == TASK_AVAILABLE {
            return Ok(Self::TaskAvailable);
        }
        s.strip_prefix(TASK_ABORT_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(Self::TaskAbort)
            .ok_or_else(|| format!("unknown signal: {s}"))
    }
}

/// Push side of the poll/pull protocol. Fire-and-forget, best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account_id: &str, signal: Signal);
}

/// Per-account broadcast fan-out, consumed by the worker WebSocket stream.
pub struct BroadcastNotifier {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to an account's signals. Each worker stream calls this.
    pub async fn subscribe(&self, account_id: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.write().await;
        channels
            .entry(account_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, account_id: &str, signal: Signal) {
        let channels = self.channels.read().await;
        let delivered = channels
            .get(account_id)
            .and_then(|tx| tx.send(signal.to_string()).ok())
            .unwrap_or(0);
        // Workers still poll, so a signal nobody hears is fine.
        debug!(account_id, signal = %signal, delivered, "Signal broadcast");
    }
}
