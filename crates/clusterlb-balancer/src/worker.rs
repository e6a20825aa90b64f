//! Dispatch workers and the per-server registry that owns them.
//!
//! A worker is the proxy-side object requests are dispatched through,
//! one per `scheme://host:port` inside a balancer. It never owns node
//! data: it holds a [`StatsHandle`] into the store and re-reads the node
//! through it. A worker whose handle is gone is logically removed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use clusterlb_state::{
    Balancer, ClusterStore, EntityTable, LiveStatus, Node, NodeType, SlotId, StatsHandle,
};
use tracing::{debug, info, warn};

/// Identity of a worker inside one balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub scheme: NodeType,
    /// Lower-cased host name or address.
    pub host: String,
    pub port: u16,
}

impl WorkerKey {
    pub fn of(node: &Node) -> Self {
        Self {
            scheme: node.node_type,
            host: node.host.to_ascii_lowercase(),
            port: node.port,
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Fields copied from the node when the worker is linked.
#[derive(Debug, Clone, Default)]
struct WorkerLink {
    stats: Option<StatsHandle>,
    route: String,
    secret: String,
    upgrade: String,
    response_field_size: usize,
    ping_secs: u32,
}

#[derive(Debug)]
pub struct Worker {
    key: WorkerKey,
    balancer: String,
    link: RwLock<WorkerLink>,
    redirect: RwLock<Option<String>>,
}

impl Worker {
    fn new(node: &Node, response_field_size: usize) -> Self {
        let worker = Self {
            key: WorkerKey::of(node),
            balancer: node.balancer.clone(),
            link: RwLock::new(WorkerLink::default()),
            redirect: RwLock::new(None),
        };
        worker.link_to(node, response_field_size);
        worker
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn balancer(&self) -> &str {
        &self.balancer
    }

    pub fn url(&self) -> String {
        self.key.to_string()
    }

    pub fn route(&self) -> String {
        self.read_link().route.clone()
    }

    pub fn secret(&self) -> String {
        self.read_link().secret.clone()
    }

    pub fn upgrade(&self) -> String {
        self.read_link().upgrade.clone()
    }

    pub fn response_field_size(&self) -> usize {
        self.read_link().response_field_size
    }

    /// Probe timeout derived from the node's ping setting.
    pub fn ping_timeout(&self) -> Option<Duration> {
        match self.read_link().ping_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    pub fn handle(&self) -> Option<StatsHandle> {
        self.read_link().stats
    }

    /// Slot id of the backing node, `None` once detached.
    pub fn node_id(&self) -> Option<SlotId> {
        self.handle().map(|h| h.id)
    }

    pub fn is_removed(&self) -> bool {
        self.handle().is_none()
    }

    /// Live-status block, `None` when detached or stale.
    pub fn stats<'s>(&self, store: &'s ClusterStore) -> Option<&'s LiveStatus> {
        self.handle().and_then(|h| store.nodes().stats(h))
    }

    pub fn redirect(&self) -> Option<String> {
        self.redirect
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Route to try when this worker is unusable.
    pub fn set_redirect(&self, route: Option<String>) {
        *self.redirect.write().unwrap_or_else(|e| e.into_inner()) = route;
    }

    fn link_to(&self, node: &Node, response_field_size: usize) {
        *self.write_link() = WorkerLink {
            stats: Some(node.stats_handle()),
            route: node.route.clone(),
            secret: node.ajp_secret.clone(),
            upgrade: node.upgrade.clone(),
            response_field_size,
            ping_secs: node.ping_secs,
        };
    }

    /// Drop the node link, leaving a private placeholder.
    fn detach(&self) {
        self.write_link().stats = None;
    }

    fn read_link(&self) -> RwLockReadGuard<'_, WorkerLink> {
        self.link.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_link(&self) -> RwLockWriteGuard<'_, WorkerLink> {
        self.link.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A balancer as seen by one registry: its policy plus its workers in
/// creation order.
#[derive(Debug, Clone)]
pub struct BalancerRuntime {
    pub settings: Balancer,
    pub workers: Vec<Arc<Worker>>,
}

impl BalancerRuntime {
    pub fn name(&self) -> &str {
        &self.settings.name
    }
}

/// Outcome of one [`WorkerRegistry::sync`].
#[derive(Debug, Default)]
pub struct SyncReport {
    pub created: Vec<Arc<Worker>>,
    pub relinked: Vec<Arc<Worker>>,
    /// Balancers whose settings were re-copied from the store.
    pub resynced: usize,
}

/// Workers of one proxy server config (virtual server).
#[derive(Debug)]
pub struct WorkerRegistry {
    name: String,
    response_field_size: usize,
    balancers: RwLock<Vec<BalancerRuntime>>,
    seen_version: AtomicU64,
    synced: AtomicBool,
}

impl WorkerRegistry {
    pub fn new(name: impl Into<String>, response_field_size: usize) -> Self {
        Self {
            name: name.into(),
            response_field_size,
            balancers: RwLock::new(Vec::new()),
            seen_version: AtomicU64::new(0),
            synced: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of every balancer and its workers.
    pub fn balancers(&self) -> Vec<BalancerRuntime> {
        self.read().clone()
    }

    /// Balancer named `name` (case-insensitive).
    pub fn balancer(&self, name: &str) -> Option<BalancerRuntime> {
        self.read()
            .iter()
            .find(|b| b.settings.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.read().iter().map(|b| b.workers.len()).sum()
    }

    /// Linked worker of `balancer` carrying `route`.
    pub fn worker_by_route(&self, balancer: &str, route: &str) -> Option<Arc<Worker>> {
        self.balancer(balancer)?
            .workers
            .into_iter()
            .find(|w| !w.is_removed() && w.route() == route)
    }

    /// Whether any linked worker references node slot `id`.
    pub fn references_node(&self, id: SlotId) -> bool {
        self.read()
            .iter()
            .flat_map(|b| &b.workers)
            .any(|w| w.node_id() == Some(id))
    }

    /// Store version observed by the last sync.
    pub fn seen_version(&self) -> u64 {
        self.seen_version.load(Ordering::Acquire)
    }

    /// Bring workers and balancer settings in line with the node table.
    ///
    /// Every live node gets a worker under its balancer. A worker whose
    /// handle no longer matches its node is relinked, with `lbstatus`
    /// reset and `lbfactor` forced to -1 until the node reports a load.
    pub fn sync(&self, store: &ClusterStore) -> SyncReport {
        let version = store.version();
        let mut report = SyncReport::default();
        let mut balancers = self.write();

        for node in store.nodes().records().iter().filter(|n| !n.remove) {
            let settings = store
                .balancers()
                .read_by_name(&node.balancer)
                .unwrap_or_else(|| Balancer {
                    name: node.balancer.clone(),
                    ..Balancer::default()
                });
            let pos = match balancers
                .iter()
                .position(|b| b.settings.name.eq_ignore_ascii_case(&node.balancer))
            {
                Some(pos) => {
                    if !balancers[pos].settings.same_policy(&settings) {
                        debug!(registry = %self.name, balancer = %settings.name, "balancer settings resynced");
                        balancers[pos].settings = settings;
                        report.resynced += 1;
                    }
                    pos
                }
                None => {
                    debug!(registry = %self.name, balancer = %settings.name, "balancer created");
                    balancers.push(BalancerRuntime {
                        settings,
                        workers: Vec::new(),
                    });
                    balancers.len() - 1
                }
            };

            let runtime = &mut balancers[pos];
            let key = WorkerKey::of(node);
            let handle = node.stats_handle();
            match runtime.workers.iter().find(|w| w.key == key) {
                Some(worker) if worker.handle() == Some(handle) => {
                    worker.link_to(node, self.response_field_size);
                }
                Some(worker) => {
                    worker.link_to(node, self.response_field_size);
                    if let Some(stats) = store.nodes().stats(handle) {
                        stats.lbstatus.store(0, Ordering::Relaxed);
                        stats.set_lbfactor(-1);
                    }
                    info!(registry = %self.name, worker = %key, route = %node.route, "worker relinked");
                    report.relinked.push(Arc::clone(worker));
                }
                None => {
                    let worker = Arc::new(Worker::new(node, self.response_field_size));
                    info!(registry = %self.name, worker = %key, route = %node.route, balancer = %node.balancer, "worker created");
                    runtime.workers.push(Arc::clone(&worker));
                    report.created.push(worker);
                }
            }
        }

        self.seen_version.store(version, Ordering::Release);
        self.synced.store(true, Ordering::Release);
        report
    }

    /// Sync only when the store version moved since the last sync.
    pub fn sync_if_stale(&self, store: &ClusterStore) -> Option<SyncReport> {
        let fresh =
            self.synced.load(Ordering::Acquire) && self.seen_version() == store.version();
        (!fresh).then(|| self.sync(store))
    }

    /// Detach workers whose backing node is gone or no longer matches
    /// the worker's scheme, host, port or balancer.
    pub fn detach_orphans(&self, store: &ClusterStore) -> Vec<Arc<Worker>> {
        let mut detached = Vec::new();
        for worker in self.read().iter().flat_map(|b| &b.workers) {
            let Some(handle) = worker.handle() else {
                continue;
            };
            let backed = store.nodes().stats(handle).is_some()
                && store.nodes().read(handle.id).is_ok_and(|node| {
                    node.generation == handle.generation
                        && WorkerKey::of(&node) == worker.key
                        && node.balancer.eq_ignore_ascii_case(&worker.balancer)
                });
            if !backed {
                worker.detach();
                warn!(registry = %self.name, worker = %worker.key, "orphaned worker detached");
                detached.push(Arc::clone(worker));
            }
        }
        detached
    }

    /// Detach idle workers of nodes marked removed so the nodes can be
    /// deleted.
    pub fn retire_idle_workers(&self, store: &ClusterStore) -> Vec<Arc<Worker>> {
        let mut retired = Vec::new();
        for worker in self.read().iter().flat_map(|b| &b.workers) {
            let Some(handle) = worker.handle() else {
                continue;
            };
            let removed = store.nodes().read(handle.id).is_ok_and(|n| n.remove);
            let idle = store.nodes().stats(handle).is_none_or(|s| s.busy() == 0);
            if removed && idle {
                worker.detach();
                info!(registry = %self.name, worker = %worker.key, "worker of removed node retired");
                retired.push(Arc::clone(worker));
            }
        }
        retired
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<BalancerRuntime>> {
        self.balancers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<BalancerRuntime>> {
        self.balancers.write().unwrap_or_else(|e| e.into_inner())
    }
}
