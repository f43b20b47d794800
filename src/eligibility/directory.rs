//! Worker directory fed by worker polls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{AlertKind, WorkerDirectory};
use crate::tasks::Task;

/// Alerts retained for inspection.
const MAX_RETAINED_ALERTS: usize = 256;

#[derive(Debug, Clone)]
struct Presence {
    capabilities: BTreeSet<String>,
    last_seen: Instant,
}

/// A raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub account_id: String,
    pub kind: AlertKind,
    pub details: String,
    pub raised_at: DateTime<Utc>,
}

/// Tracks which workers polled recently and what they advertised.
///
/// A worker is connected while its last poll is within the presence
/// window, and capable when its advertised capabilities cover everything
/// the task requires.
pub struct InMemoryWorkerDirectory {
    workers: RwLock<HashMap<String, BTreeMap<String, Presence>>>,
    alerts: RwLock<Vec<Alert>>,
    presence_window: Duration,
}

impl InMemoryWorkerDirectory {
    pub fn new(presence_window: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            alerts: RwLock::new(Vec::new()),
            presence_window,
        }
    }

    /// Record a poll from a worker, replacing its advertised capabilities.
    pub async fn touch<I, S>(&self, account_id: &str, worker_id: &str, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let presence = Presence {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            last_seen: Instant::now(),
        };
        let mut workers = self.workers.write().await;
        let previous = workers
            .entry(account_id.to_string())
            .or_default()
            .insert(worker_id.to_string(), presence);
        if previous.is_none() {
            debug!(account_id, worker_id, "Worker connected");
        }
    }

    /// Forget a worker immediately.
    pub async fn disconnect(&self, account_id: &str, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(account) = workers.get_mut(account_id) {
            account.remove(worker_id);
            if account.is_empty() {
                workers.remove(account_id);
            }
        }
    }

    /// Workers tracked across all accounts, present or not.
    pub async fn len(&self) -> usize {
        self.workers.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    fn is_present(&self, presence: &Presence) -> bool {
        presence.last_seen.elapsed() <= self.presence_window
    }
}

#[async_trait]
impl WorkerDirectory for InMemoryWorkerDirectory {
    async fn list_connected_workers(&self, account_id: &str) -> Vec<String> {
        let workers = self.workers.read().await;
        workers
            .get(account_id)
            .map(|account| {
                account
                    .iter()
                    .filter(|(_, presence)| self.is_present(presence))
                    .map(|(worker_id, _)| worker_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn is_capable(&self, worker_id: &str, task: &Task) -> bool {
        let workers = self.workers.read().await;
        let Some(presence) = workers
            .get(&task.account_id)
            .and_then(|account| account.get(worker_id))
        else {
            return false;
        };
        task.capabilities
            .iter()
            .all(|cap| presence.capabilities.contains(cap))
    }

    async fn alert(&self, account_id: &str, kind: AlertKind, details: &str) {
        warn!(account_id, kind = ?kind, "{details}");
        let mut alerts = self.alerts.write().await;
        if alerts.len() >= MAX_RETAINED_ALERTS {
            alerts.remove(0);
        }
        alerts.push(Alert {
            account_id: account_id.to_string(),
            kind,
            details: details.to_string(),
            raised_at: Utc::now(),
        });
    }

    async fn evict_stale(&self) -> usize {
        let mut workers = self.workers.write().await;
        let mut evicted = 0;
        workers.retain(|account_id, account| {
            account.retain(|worker_id, presence| {
                let keep = self.is_present(presence);
                if !keep {
                    debug!(account_id = %account_id, worker_id = %worker_id, "Worker presence lapsed");
                    evicted += 1;
                }
                keep
            });
            !account.is_empty()
        });
        evicted
    }
}
