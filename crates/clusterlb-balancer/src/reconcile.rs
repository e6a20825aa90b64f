//! Watchdog reconciliation.
//!
//! One pass, each step independent of the others:
//!
//! 1. sync every registry's workers with the node table
//! 2. detach orphaned workers, retire idle workers of removed nodes
//! 3. delete removed nodes nobody references once the grace period and
//!    enough clean passes have gone by
//! 4. recompute lbstatus, probing nodes that saw no traffic
//! 5. expire session and domain entries
//!
//! Table changes happen under the node lock, which is released before
//! any probe runs.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterlb_core::config::WatchdogConfig;
use clusterlb_core::limits::REMOVED_ROUTE;
use clusterlb_health::{HealthMonitor, ProbePool, ProbeResult, ProbeTarget};
use clusterlb_state::{ClusterStore, Domain, EntityTable, StatsHandle, epoch_millis};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::worker::{Worker, WorkerRegistry};

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub created: usize,
    pub relinked: usize,
    pub detached: usize,
    pub deleted_nodes: usize,
    pub recomputed: usize,
    pub probes: usize,
    pub expired_sessions: usize,
    pub expired_domains: usize,
}

struct IdleProbe {
    handle: StatsHandle,
    target: ProbeTarget,
    timeout: Duration,
}

pub struct Reconciler {
    store: ClusterStore,
    registries: Vec<Arc<WorkerRegistry>>,
    config: WatchdogConfig,
    pool: ProbePool,
    monitor: Option<Arc<HealthMonitor>>,
    stopping: watch::Receiver<bool>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        store: ClusterStore,
        registries: Vec<Arc<WorkerRegistry>>,
        config: WatchdogConfig,
        pool: ProbePool,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registries,
            config,
            pool,
            monitor: None,
            stopping,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Register new workers with `monitor` and stop them there when they
    /// are detached.
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Run passes every `interval` until the stopping flag is raised,
    /// then wait for in-flight probes.
    pub async fn run(&self) {
        let mut stopping = self.stopping.clone();
        info!(interval_ms = self.config.interval_ms, "watchdog started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    let stats = self.run_pass().await;
                    debug!(?stats, "reconciliation pass complete");
                }
                _ = stopping.changed() => {
                    break;
                }
            }
            if self.is_stopping() {
                break;
            }
        }
        self.settle().await;
        if let Some(monitor) = &self.monitor {
            monitor.stop_all().await;
        }
        info!("watchdog stopped");
    }

    pub async fn run_pass(&self) -> PassStats {
        self.run_pass_at(epoch_millis()).await
    }

    /// One pass with `now` (epoch millis) as the clock.
    pub async fn run_pass_at(&self, now: u64) -> PassStats {
        let mut stats = PassStats::default();
        self.reap();

        for registry in &self.registries {
            if self.is_stopping() {
                return stats;
            }
            let report = registry.sync(&self.store);
            stats.created += report.created.len();
            stats.relinked += report.relinked.len();
            for worker in report.created.iter().chain(&report.relinked) {
                self.watch(registry, worker).await;
            }

            let mut detached = registry.detach_orphans(&self.store);
            detached.extend(registry.retire_idle_workers(&self.store));
            stats.detached += detached.len();
            for worker in &detached {
                self.unwatch(registry, worker).await;
            }
        }

        stats.deleted_nodes = self.delete_removed_nodes(now);

        let jobs = self.recompute_lbstatus(now, &mut stats);
        for job in jobs {
            if self.is_stopping() {
                return stats;
            }
            self.submit_idle_probe(job).await;
            stats.probes += 1;
        }

        stats.expired_sessions = self
            .store
            .sessions()
            .expire(now, self.config.session_ttl_secs.saturating_mul(1000));
        stats.expired_domains = self
            .store
            .domains()
            .expire(now, self.config.domain_ttl_secs.saturating_mul(1000));
        stats
    }

    /// Wait for every dispatched probe to finish.
    pub async fn settle(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "idle probe task failed");
            }
        }
    }

    fn reap(&self) {
        self.lock_pending().retain(|h| !h.is_finished());
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Health monitor ─────────────────────────────────────────────

    fn monitor_key(registry: &WorkerRegistry, worker: &Worker) -> String {
        format!("{}/{}/{}", registry.name(), worker.balancer(), worker.url())
    }

    async fn watch(&self, registry: &WorkerRegistry, worker: &Worker) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let Some(handle) = worker.handle() else {
            return;
        };
        let key = worker.key();
        let target = ProbeTarget::new(key.scheme, key.host.clone(), key.port);
        let timeout = worker
            .ping_timeout()
            .unwrap_or_else(|| self.config.probe_timeout());
        monitor
            .start(&Self::monitor_key(registry, worker), target, handle, timeout)
            .await;
    }

    async fn unwatch(&self, registry: &WorkerRegistry, worker: &Worker) {
        if let Some(monitor) = &self.monitor {
            monitor.stop(&Self::monitor_key(registry, worker)).await;
        }
    }

    // ── Removed nodes ──────────────────────────────────────────────

    /// Delete removed nodes that no worker references, once their mark
    /// is older than the wait interval and more than the threshold of
    /// consecutive passes agreed.
    fn delete_removed_nodes(&self, now: u64) -> usize {
        let wait_ms = self.config.wait_for_remove_secs.saturating_mul(1000);
        let _nodes = self.store.lock_nodes();
        let _contexts = self.store.lock_contexts();
        let nodes = self.store.nodes();
        let mut deleted = 0;

        for node in nodes.records().into_iter().filter(|n| n.remove) {
            if self.registries.iter().any(|r| r.references_node(node.id)) {
                if node.num_remove_check > 0 {
                    let _ = nodes.update(node.id, |n| n.num_remove_check = 0);
                }
                continue;
            }
            if now.saturating_sub(node.updated_at) < wait_ms {
                continue;
            }
            let checks = match nodes.update(node.id, |n| {
                n.num_remove_check += 1;
                n.last_clean_try = now;
                n.num_remove_check
            }) {
                Ok(checks) => checks,
                Err(e) => {
                    error!(id = node.id, error = %e, "removal check failed");
                    continue;
                }
            };
            if checks <= self.config.remove_check_threshold {
                continue;
            }

            if !node.domain.is_empty() && node.route != REMOVED_ROUTE {
                let domain = Domain {
                    domain: node.domain.clone(),
                    route: node.route.clone(),
                    balancer: node.balancer.clone(),
                    ..Domain::default()
                };
                if let Err(e) = self.store.domains().insert_or_update(domain, now) {
                    error!(route = %node.route, error = %e, "domain not remembered");
                }
            }
            self.store.remove_host_context(node.id);
            match nodes.remove(node.id) {
                Ok(_) => {
                    info!(id = node.id, route = %node.route, "removed node deleted");
                    deleted += 1;
                }
                Err(e) => error!(id = node.id, error = %e, "removed node not deleted"),
            }
        }

        if deleted > 0 {
            self.store.bump_version();
        }
        deleted
    }

    // ── Load recompute ─────────────────────────────────────────────

    /// Recompute lbstatus of nodes due for it and collect idle nodes to
    /// probe.
    fn recompute_lbstatus(&self, now: u64, stats: &mut PassStats) -> Vec<IdleProbe> {
        let recalc_ms = self.config.lbstatus_recalc_secs.saturating_mul(1000);
        let _guard = self.store.lock_nodes();
        let nodes = self.store.nodes();
        let mut jobs = Vec::new();

        for node in nodes.records().into_iter().filter(|n| !n.remove) {
            if now.saturating_sub(node.updated_lb_at) < recalc_ms {
                continue;
            }
            let handle = node.stats_handle();
            let Some(live) = nodes.stats(handle) else {
                continue;
            };
            let elected = live.elected();
            let read = live.read_bytes();
            let recent = elected.saturating_sub(node.old_elected) as i64;
            let lbstatus = recent * 1000 / i64::from(live.lbfactor().max(1));
            live.lbstatus.store(lbstatus, Ordering::Relaxed);

            let idle = read == node.old_read;
            let updated = nodes.update(node.id, |n| {
                n.old_elected = elected;
                n.old_read = read;
                n.updated_lb_at = now;
                if !idle {
                    n.num_failure_idle = 0;
                }
            });
            if let Err(e) = updated {
                error!(route = %node.route, error = %e, "lbstatus bookkeeping failed");
                continue;
            }
            stats.recomputed += 1;

            if idle {
                let timeout = match node.ping_secs {
                    0 => self.config.probe_timeout(),
                    secs => Duration::from_secs(u64::from(secs)),
                };
                jobs.push(IdleProbe {
                    handle,
                    target: ProbeTarget::from_node(&node),
                    timeout,
                });
            }
        }
        jobs
    }

    async fn submit_idle_probe(&self, job: IdleProbe) {
        let store = self.store.clone();
        let stopping = self.stopping.clone();
        let threshold = self.config.failure_idle_threshold;
        let handle = job.handle;
        let spawned = self
            .pool
            .submit(job.target, job.timeout, move |result| {
                apply_idle_probe(&store, handle, result, threshold, &stopping);
            })
            .await;
        if let Some(task) = spawned {
            self.lock_pending().push(task);
        }
    }
}

/// Fold one idle-probe result into the node's failure count.
fn apply_idle_probe(
    store: &ClusterStore,
    handle: StatsHandle,
    result: ProbeResult,
    threshold: u32,
    stopping: &watch::Receiver<bool>,
) {
    if *stopping.borrow() {
        return;
    }
    let _guard = store.lock_nodes();
    let nodes = store.nodes();
    let Some(live) = nodes.stats(handle) else {
        return;
    };
    if result.is_healthy() {
        let _ = nodes.update(handle.id, |n| n.num_failure_idle = 0);
        return;
    }

    live.mark_error(epoch_millis());
    let failures = match nodes.update(handle.id, |n| {
        n.num_failure_idle += 1;
        n.num_failure_idle
    }) {
        Ok(failures) => failures,
        Err(_) => return,
    };
    warn!(id = handle.id, failures, "idle probe failed");
    if failures > threshold {
        match nodes.mark_removed(handle.id, false, epoch_millis()) {
            Ok(()) => info!(id = handle.id, failures, "unreachable idle node marked removed"),
            Err(e) => error!(id = handle.id, error = %e, "idle node not marked removed"),
        }
    }
}
