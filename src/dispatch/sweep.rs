//! Background loops driving the time-based parts of dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

use super::service::DispatchService;
use super::sync_bridge::SyncBridge;

/// Periodically wake sync callers whose tasks have settled.
pub fn spawn_sync_reconciler(bridge: Arc<SyncBridge>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = bridge.reconcile().await {
                error!(error = %e, "Sync reconciliation failed");
            }
        }
    })
}

/// Periodically expire, rebroadcast and collect tasks.
pub fn spawn_dispatch_sweep(service: Arc<DispatchService>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = service.sweep_once().await {
                error!(error = %e, "Dispatch sweep failed");
            }
        }
    })
}
