//! ClusterStore: the shared handle over every entity table.
//!
//! Cheap to clone; all clones see the same tables. Structural changes
//! spanning several tables are serialized by the node lock, taken at the
//! boundary of each control command and reconciliation pass. The
//! context lock guards the narrower context-only read paths that need a
//! consistent view of request counters.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use clusterlb_core::config::TablesConfig;
use tracing::{debug, info};

use crate::entity::*;
use crate::error::StateResult;
use crate::persist::{Image, Persistence};
use crate::slots::SlotId;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
struct Inner {
    nodes: NodeTable,
    hosts: HostTable,
    contexts: ContextTable,
    balancers: BalancerTable,
    domains: DomainTable,
    sessions: SessionTable,
    version: AtomicU64,
    /// Process start, in seconds since the epoch.
    epoch: u64,
    node_lock: Mutex<()>,
    context_lock: Mutex<()>,
    persistence: Option<Persistence>,
}

/// Thread-safe topology store shared by the manager, the router and the
/// watchdog.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    inner: Arc<Inner>,
}

impl ClusterStore {
    /// In-memory store sized by `caps`.
    pub fn new(caps: &TablesConfig) -> Self {
        Self::build(caps, None)
    }

    /// Store backed by a redb image at `path`. An existing image is
    /// loaded so slot ids and the version counter carry over.
    pub fn open(path: &Path, caps: &TablesConfig) -> StateResult<Self> {
        let persistence = Persistence::open(path)?;
        let image = persistence.load()?;
        let store = Self::build(caps, Some(persistence));
        store.restore(image)?;
        info!(
            ?path,
            nodes = store.nodes().len(),
            version = store.version(),
            "store restored"
        );
        Ok(store)
    }

    fn build(caps: &TablesConfig, persistence: Option<Persistence>) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            inner: Arc::new(Inner {
                nodes: NodeTable::new(caps.nodes),
                hosts: HostTable::new(caps.hosts),
                contexts: ContextTable::new(caps.contexts),
                balancers: BalancerTable::new(caps.balancers),
                domains: DomainTable::new(caps.domains),
                sessions: SessionTable::new(caps.sessions),
                version: AtomicU64::new(0),
                epoch,
                node_lock: Mutex::new(()),
                context_lock: Mutex::new(()),
                persistence,
            }),
        }
    }

    // ── Tables ─────────────────────────────────────────────────────

    pub fn nodes(&self) -> &NodeTable {
        &self.inner.nodes
    }

    pub fn hosts(&self) -> &HostTable {
        &self.inner.hosts
    }

    pub fn contexts(&self) -> &ContextTable {
        &self.inner.contexts
    }

    pub fn balancers(&self) -> &BalancerTable {
        &self.inner.balancers
    }

    pub fn domains(&self) -> &DomainTable {
        &self.inner.domains
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    // ── Version and locks ──────────────────────────────────────────

    /// Node-table version, bumped on every node insert or update.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Increment the version, returning the new value.
    pub fn bump_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Process start time, reported to nodes so they can detect restarts.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn lock_nodes(&self) -> MutexGuard<'_, ()> {
        self.inner
            .node_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_contexts(&self) -> MutexGuard<'_, ()> {
        self.inner
            .context_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ── Multi-table helpers ────────────────────────────────────────

    /// Drop every host and context bound to `node`.
    pub fn remove_host_context(&self, node: SlotId) -> (usize, usize) {
        let contexts = self.contexts().remove_of_node(node, None);
        let hosts = self.hosts().remove_of_node(node, None);
        debug!(node, hosts, contexts, "hosts and contexts purged");
        (hosts, contexts)
    }

    // ── Persistence ────────────────────────────────────────────────

    pub fn is_persistent(&self) -> bool {
        self.inner.persistence.is_some()
    }

    /// Write the current image, if persistence is enabled.
    pub fn flush(&self) -> StateResult<()> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(());
        };
        let image = Image {
            nodes: self.nodes().slots().entries(),
            hosts: self.hosts().slots().entries(),
            contexts: self.contexts().slots().entries(),
            balancers: self.balancers().slots().entries(),
            domains: self.domains().slots().entries(),
            sessions: self.sessions().slots().entries(),
            version: self.version(),
        };
        persistence.save(&image)
    }

    fn restore(&self, image: Image) -> StateResult<()> {
        for (id, generation, mut node) in image.nodes {
            node.id = id;
            node.generation = generation;
            self.nodes().restore(node)?;
        }
        for (id, generation, host) in image.hosts {
            self.hosts().slots().restore(id, generation, host)?;
        }
        for (id, generation, context) in image.contexts {
            self.contexts().slots().restore(id, generation, context)?;
        }
        for (id, generation, balancer) in image.balancers {
            self.balancers().slots().restore(id, generation, balancer)?;
        }
        for (id, generation, domain) in image.domains {
            self.domains().slots().restore(id, generation, domain)?;
        }
        for (id, generation, session) in image.sessions {
            self.sessions().slots().restore(id, generation, session)?;
        }
        self.inner.version.store(image.version, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Context, ContextStatus, Host, Node};

    fn caps() -> TablesConfig {
        TablesConfig {
            sessions: 4,
            ..TablesConfig::default()
        }
    }

    fn populate(store: &ClusterStore) -> SlotId {
        let node = store
            .nodes()
            .insert_or_update(
                Node {
                    route: "node1".to_string(),
                    host: "10.0.0.1".to_string(),
                    ..Node::default()
                },
                1,
            )
            .unwrap();
        store
            .hosts()
            .insert_or_update(
                Host {
                    alias: "www.example.com".to_string(),
                    vhost: 1,
                    node,
                    ..Host::default()
                },
                1,
            )
            .unwrap();
        store
            .contexts()
            .insert_or_update(
                Context {
                    path: "/app".to_string(),
                    vhost: 1,
                    node,
                    status: ContextStatus::Enabled,
                    ..Context::default()
                },
                1,
            )
            .unwrap();
        store.bump_version();
        node
    }

    #[test]
    fn version_is_monotonic() {
        let store = ClusterStore::new(&caps());
        assert_eq!(store.version(), 0);
        assert_eq!(store.bump_version(), 1);
        assert_eq!(store.bump_version(), 2);
    }

    #[test]
    fn clones_share_tables() {
        let store = ClusterStore::new(&caps());
        let other = store.clone();
        populate(&store);
        assert_eq!(other.nodes().len(), 1);
        assert_eq!(other.version(), 1);
    }

    #[test]
    fn remove_host_context_purges_node_rows() {
        let store = ClusterStore::new(&caps());
        let node = populate(&store);
        assert_eq!(store.remove_host_context(node), (1, 1));
        assert!(store.hosts().is_empty());
        assert!(store.contexts().is_empty());
        assert_eq!(store.nodes().len(), 1);
    }

    #[test]
    fn flush_without_persistence_is_noop() {
        let store = ClusterStore::new(&caps());
        assert!(!store.is_persistent());
        store.flush().unwrap();
    }

    #[test]
    fn image_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusterlb.redb");
        let (node, handle) = {
            let store = ClusterStore::open(&path, &caps()).unwrap();
            let node = populate(&store);
            let handle = store.nodes().handle(node).unwrap();
            store.flush().unwrap();
            (node, handle)
        };

        let store = ClusterStore::open(&path, &caps()).unwrap();
        assert_eq!(store.version(), 1);
        let restored = store.nodes().read(node).unwrap();
        assert_eq!(restored.route, "node1");
        assert_eq!(store.nodes().handle(node).unwrap(), handle);
        assert!(store.nodes().stats(handle).is_some());
        assert_eq!(store.hosts().len(), 1);
        assert_eq!(store.contexts().records()[0].path, "/app");
    }
}
