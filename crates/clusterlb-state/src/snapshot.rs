//! Read views of the topology.
//!
//! A routing decision scans hosts, contexts, balancers and nodes several
//! times. [`Topology`] copies those four tables once so the scans run
//! over plain vectors instead of locked slot tables. [`TopologyCache`]
//! reuses one snapshot across requests until its interval elapses or
//! the node-table version moves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::entity::EntityTable;
use crate::live::StatsHandle;
use crate::slots::SlotId;
use crate::store::ClusterStore;
use crate::types::{Balancer, Context, Host, Node};

/// Parallel `{ids, records}` arrays of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableView<T> {
    pub ids: Vec<SlotId>,
    pub records: Vec<T>,
}

impl<T> Default for TableView<T> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            records: Vec::new(),
        }
    }
}

impl<T> TableView<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }
}

impl<T: Clone> TableView<T> {
    /// Arrays sized exactly to the ids in use.
    pub fn fresh<E: EntityTable<Record = T>>(table: &E) -> Self {
        let mut view = Self::default();
        view.refresh(table);
        view
    }

    /// Arrays sized to the table capacity so later refreshes do not
    /// reallocate.
    pub fn for_cache<E: EntityTable<Record = T>>(table: &E) -> Self {
        let mut view = Self {
            ids: Vec::with_capacity(table.capacity()),
            records: Vec::with_capacity(table.capacity()),
        };
        view.refresh(table);
        view
    }

    /// Re-scan `table` into the existing arrays. Ids released between
    /// the id scan and the read are dropped.
    pub fn refresh<E: EntityTable<Record = T>>(&mut self, table: &E) {
        let mut ids = std::mem::take(&mut self.ids);
        table.list_used_ids(&mut ids);
        self.records.clear();
        self.ids.clear();
        for id in ids {
            if let Ok(record) = table.read(id) {
                self.ids.push(id);
                self.records.push(record);
            }
        }
    }
}

/// Node view: records plus the live-status handle of each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeView {
    pub ids: Vec<SlotId>,
    pub records: Vec<Node>,
    /// `None` when the node could not be read mid-scan; its record is
    /// then a default placeholder.
    pub handles: Vec<Option<StatsHandle>>,
}

impl NodeView {
    pub fn fresh(store: &ClusterStore) -> Self {
        let mut view = Self::default();
        view.refresh(store);
        view
    }

    pub fn refresh(&mut self, store: &ClusterStore) {
        let table = store.nodes();
        table.list_used_ids(&mut self.ids);
        self.records.clear();
        self.handles.clear();
        for &id in &self.ids {
            match table.read(id) {
                Ok(node) => {
                    self.handles.push(Some(node.stats_handle()));
                    self.records.push(node);
                }
                Err(_) => {
                    self.handles.push(None);
                    self.records.push(Node {
                        id,
                        remove: true,
                        ..Node::default()
                    });
                }
            }
        }
    }

    /// Readable node with slot id `id`.
    pub fn get(&self, id: SlotId) -> Option<&Node> {
        self.ids
            .iter()
            .position(|&i| i == id)
            .filter(|&pos| self.handles[pos].is_some())
            .map(|pos| &self.records[pos])
    }

    /// Readable nodes with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (&Node, StatsHandle)> {
        self.records
            .iter()
            .zip(&self.handles)
            .filter_map(|(node, handle)| handle.map(|h| (node, h)))
    }
}

/// Snapshot of the four tables a routing decision reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub hosts: TableView<Host>,
    pub contexts: TableView<Context>,
    pub balancers: TableView<Balancer>,
    pub nodes: NodeView,
    /// Store version observed when the snapshot was taken.
    pub version: u64,
}

impl Topology {
    pub fn build(store: &ClusterStore) -> Self {
        let version = store.version();
        Self {
            hosts: TableView::fresh(store.hosts()),
            contexts: TableView::fresh(store.contexts()),
            balancers: TableView::fresh(store.balancers()),
            nodes: NodeView::fresh(store),
            version,
        }
    }

    fn build_for_cache(store: &ClusterStore) -> Self {
        let version = store.version();
        Self {
            hosts: TableView::for_cache(store.hosts()),
            contexts: TableView::for_cache(store.contexts()),
            balancers: TableView::for_cache(store.balancers()),
            nodes: NodeView::fresh(store),
            version,
        }
    }

    pub fn refresh(&mut self, store: &ClusterStore) {
        self.version = store.version();
        self.hosts.refresh(store.hosts());
        self.contexts.refresh(store.contexts());
        self.balancers.refresh(store.balancers());
        self.nodes.refresh(store);
    }

    pub fn host(&self, id: SlotId) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == id)
    }

    /// Balancer named `name` (case-insensitive).
    pub fn balancer(&self, name: &str) -> Option<&Balancer> {
        self.balancers
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
    }
}

/// Per-process snapshot reused for `interval`.
#[derive(Debug)]
pub struct TopologyCache {
    interval: Duration,
    built_at: Option<Instant>,
    current: Arc<Topology>,
}

impl TopologyCache {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            built_at: None,
            current: Arc::new(Topology::default()),
        }
    }

    /// Current snapshot, rebuilt when the interval is zero, has elapsed,
    /// or the store version has moved since the last build.
    pub fn get(&mut self, store: &ClusterStore) -> Arc<Topology> {
        if self.interval.is_zero() {
            return Arc::new(Topology::build(store));
        }
        let expired = self
            .built_at
            .is_none_or(|at| at.elapsed() >= self.interval);
        if expired || self.current.version != store.version() {
            match self.built_at {
                None => self.current = Arc::new(Topology::build_for_cache(store)),
                Some(_) => Arc::make_mut(&mut self.current).refresh(store),
            }
            self.built_at = Some(Instant::now());
            debug!(version = self.current.version, "topology cache refreshed");
        }
        Arc::clone(&self.current)
    }
}
