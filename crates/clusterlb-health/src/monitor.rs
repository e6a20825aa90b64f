//! Health monitor: one background task per dispatch worker.
//!
//! Each task probes its worker on an interval that backs off on failure
//! and mirrors the tracker status into the node's live-status error
//! flag. A task ends by itself once the node's slot is reused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clusterlb_state::{ClusterStore, StatsHandle, epoch_millis};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::checker::{HealthStatus, HealthTracker, NodeProbe, ProbeTarget};

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health monitors for all dispatch workers.
pub struct HealthMonitor {
    store: ClusterStore,
    probe: Arc<dyn NodeProbe>,
    interval: Duration,
    unhealthy_threshold: u32,
    /// Active monitors: worker key → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(store: ClusterStore, probe: Arc<dyn NodeProbe>, interval: Duration) -> Self {
        Self {
            store,
            probe,
            interval,
            unhealthy_threshold: 1,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Failures in a row before the worker is put in error.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Start monitoring a worker, replacing any monitor under `key`.
    pub async fn start(
        &self,
        key: &str,
        target: ProbeTarget,
        handle: StatsHandle,
        timeout: Duration,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = key.to_string();
        let store = self.store.clone();
        let probe = Arc::clone(&self.probe);
        let tracker = HealthTracker::new(self.unhealthy_threshold, self.interval);

        let task = tokio::spawn(async move {
            run_health_loop(&worker, target, handle, timeout, store, probe, tracker, shutdown_rx)
                .await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            key.to_string(),
            MonitorSlot {
                handle: task,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(worker = %key, "health monitor started");
    }

    pub async fn stop(&self, key: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(key) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(worker = %key, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (key, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(worker = %key, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        self.monitors.read().await.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, key: &str) -> bool {
        self.monitors.read().await.contains_key(key)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_health_loop(
    worker: &str,
    target: ProbeTarget,
    handle: StatsHandle,
    timeout: Duration,
    store: ClusterStore,
    probe: Arc<dyn NodeProbe>,
    mut tracker: HealthTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%worker, address = %target.address(), "health loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tracker.next_interval()) => {
                let result = probe.probe(&target, timeout).await;
                let Some(stats) = store.nodes().stats(handle) else {
                    debug!(%worker, "node slot reused, health loop exiting");
                    break;
                };
                match tracker.record(result) {
                    HealthStatus::Healthy => stats.clear_error(),
                    HealthStatus::Unhealthy => stats.mark_error(epoch_millis()),
                    HealthStatus::Unknown => {}
                }
            }
            _ = shutdown.changed() => {
                debug!(%worker, "health loop shutting down");
                break;
            }
        }
    }
}
