use clusterlb_core::limits::{self, REMOVED_ROUTE};
use tracing::debug;

use crate::entity::{EntityTable, NODES};
use crate::error::StateResult;
use crate::live::{LiveStatus, LiveStatusTable, StatsHandle};
use crate::slots::{SlotId, SlotTable};
use crate::types::Node;

/// Backend nodes keyed by JVMRoute, plus their live-status blocks.
#[derive(Debug)]
pub struct NodeTable {
    slots: SlotTable<Node>,
    live: LiveStatusTable,
}

impl EntityTable for NodeTable {
    type Record = Node;

    fn slots(&self) -> &SlotTable<Node> {
        &self.slots
    }

    fn remove(&self, id: SlotId) -> StateResult<Node> {
        let node = self.slots.release(id)?;
        self.live.invalidate(id);
        debug!(id, route = %node.route, "node slot released");
        Ok(node)
    }
}

impl NodeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(NODES, capacity),
            live: LiveStatusTable::new(capacity),
        }
    }

    /// Insert `node` or rewrite the record carrying the same JVMRoute.
    ///
    /// An update keeps the slot, its generation (so the live-status block
    /// and every worker handle stay valid) and the load-recompute
    /// bookkeeping, and clears the removal mark. Nodes renamed to the
    /// removed sentinel never match.
    pub fn insert_or_update(&self, node: Node, now: u64) -> StateResult<SlotId> {
        let node = clamp_fields(node);
        let route = node.route.clone();
        let replacement = node.clone();
        let (id, created) = self.slots.upsert(
            |n| n.route == route && !is_renamed(n),
            |_, existing| {
                *existing = Node {
                    id: existing.id,
                    generation: existing.generation,
                    updated_at: now,
                    updated_lb_at: existing.updated_lb_at,
                    old_elected: existing.old_elected,
                    old_read: existing.old_read,
                    num_failure_idle: 0,
                    last_clean_try: 0,
                    num_remove_check: 0,
                    remove: false,
                    ..replacement
                };
            },
            |id, generation| Node {
                id,
                generation,
                updated_at: now,
                updated_lb_at: now,
                remove: false,
                ..node
            },
        )?;
        if created {
            let generation = self.slots.generation(id)?;
            self.live.reset(StatsHandle { id, generation });
        }
        debug!(id, %route, created, "node stored");
        Ok(id)
    }

    /// First node, removed or not, carrying `route`.
    pub fn find_by_route(&self, route: &str) -> Option<SlotId> {
        self.slots.find(|n| n.route == route)
    }

    /// First non-removed node bound to `host:port`.
    pub fn find_by_host_port(&self, host: &str, port: u16) -> Option<SlotId> {
        self.slots
            .find(|n| !n.remove && n.port == port && n.host.eq_ignore_ascii_case(host))
    }

    /// Node carrying `route`, if any.
    pub fn read_by_route(&self, route: &str) -> Option<Node> {
        self.find_by_route(route).and_then(|id| self.slots.get(id).ok())
    }

    /// Soft-delete a node. With `rename`, the JVMRoute is overwritten with
    /// the removed sentinel so the route is free for a new record.
    pub fn mark_removed(&self, id: SlotId, rename: bool, now: u64) -> StateResult<()> {
        self.slots.update(id, |n| {
            n.remove = true;
            n.updated_at = now;
            n.num_remove_check = 0;
            if rename {
                n.route = REMOVED_ROUTE.to_string();
            }
        })?;
        debug!(id, rename, "node marked removed");
        Ok(())
    }

    /// Mutate the record held in `id`.
    pub fn update<R>(&self, id: SlotId, f: impl FnOnce(&mut Node) -> R) -> StateResult<R> {
        self.slots.update(id, f)
    }

    /// Live-status block for `handle`, `None` when stale.
    pub fn stats(&self, handle: StatsHandle) -> Option<&LiveStatus> {
        self.live.get(handle)
    }

    /// Live-status block of the node currently held in `id`.
    pub fn stats_of(&self, id: SlotId) -> Option<&LiveStatus> {
        let generation = self.slots.generation(id).ok()?;
        self.live.get(StatsHandle { id, generation })
    }

    /// Current handle of slot `id`.
    pub fn handle(&self, id: SlotId) -> StateResult<StatsHandle> {
        Ok(StatsHandle {
            id,
            generation: self.slots.generation(id)?,
        })
    }

    /// Put a persisted record back and bind its live-status block.
    pub(crate) fn restore(&self, node: Node) -> StateResult<()> {
        let handle = node.stats_handle();
        self.slots.restore(node.id, node.generation, node)?;
        self.live.reset(handle);
        Ok(())
    }
}

fn is_renamed(node: &Node) -> bool {
    node.remove && node.route == REMOVED_ROUTE
}

fn clamp_fields(mut node: Node) -> Node {
    node.balancer = limits::truncate(&node.balancer, limits::BALANCER_SIZE);
    node.route = limits::truncate(&node.route, limits::JVMROUTE_SIZE);
    node.domain = limits::truncate(&node.domain, limits::DOMAIN_SIZE);
    node.host = limits::truncate(&node.host, limits::HOST_SIZE);
    node.upgrade = limits::truncate(&node.upgrade, limits::UPGRADE_SIZE);
    node.ajp_secret = limits::truncate(&node.ajp_secret, limits::AJPSECRET_SIZE);
    node
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    fn node(route: &str, host: &str, port: u16) -> Node {
        Node {
            route: route.to_string(),
            host: host.to_string(),
            port,
            balancer: "mycluster".to_string(),
            ..Node::default()
        }
    }

    #[test]
    fn insert_then_update_keeps_slot() {
        let table = NodeTable::new(4);
        let id = table.insert_or_update(node("n1", "10.0.0.1", 8009), 1).unwrap();
        let mut changed = node("n1", "10.0.0.1", 8009);
        changed.domain = "dom".to_string();
        let again = table.insert_or_update(changed, 2).unwrap();
        assert_eq!(id, again);
        assert_eq!(table.len(), 1);
        let stored = table.read(id).unwrap();
        assert_eq!(stored.domain, "dom");
        assert_eq!(stored.updated_at, 2);
        assert_eq!(stored.id, id);
    }

    #[test]
    fn update_keeps_live_block() {
        let table = NodeTable::new(2);
        let id = table.insert_or_update(node("n1", "h", 1), 1).unwrap();
        let handle = table.handle(id).unwrap();
        table.stats(handle).unwrap().elected.fetch_add(3, Ordering::Relaxed);
        table.insert_or_update(node("n1", "h", 1), 2).unwrap();
        assert_eq!(table.stats(handle).unwrap().elected(), 3);
    }

    #[test]
    fn renamed_node_frees_route() {
        let table = NodeTable::new(4);
        let old = table.insert_or_update(node("n1", "h", 1), 1).unwrap();
        table.mark_removed(old, true, 2).unwrap();
        let new = table.insert_or_update(node("n1", "h", 2), 3).unwrap();
        assert_ne!(old, new);
        assert_eq!(table.read(old).unwrap().route, REMOVED_ROUTE);
        assert_eq!(table.find_by_route("n1"), Some(new));
    }

    #[test]
    fn removed_node_revives_on_update() {
        let table = NodeTable::new(2);
        let id = table.insert_or_update(node("n1", "h", 1), 1).unwrap();
        table.mark_removed(id, false, 2).unwrap();
        assert!(table.read(id).unwrap().remove);
        table.insert_or_update(node("n1", "h", 1), 3).unwrap();
        assert!(!table.read(id).unwrap().remove);
    }

    #[test]
    fn host_port_lookup_skips_removed() {
        let table = NodeTable::new(4);
        let id = table.insert_or_update(node("n1", "Host", 80), 1).unwrap();
        assert_eq!(table.find_by_host_port("host", 80), Some(id));
        table.mark_removed(id, false, 2).unwrap();
        assert_eq!(table.find_by_host_port("host", 80), None);
    }

    #[test]
    fn release_invalidates_handle() {
        let table = NodeTable::new(1);
        let id = table.insert_or_update(node("n1", "h", 1), 1).unwrap();
        let handle = table.handle(id).unwrap();
        table.remove(id).unwrap();
        assert!(table.stats(handle).is_none());
        let reused = table.insert_or_update(node("n2", "h", 2), 2).unwrap();
        assert_eq!(reused, id);
        assert!(table.stats(handle).is_none());
        assert!(table.stats_of(reused).is_some());
    }

    #[test]
    fn full_table_is_an_error() {
        let table = NodeTable::new(1);
        table.insert_or_update(node("n1", "h", 1), 1).unwrap();
        assert!(table.insert_or_update(node("n2", "h", 2), 1).is_err());
    }

    #[test]
    fn oversized_route_is_truncated() {
        let table = NodeTable::new(1);
        let id = table
            .insert_or_update(node(&"r".repeat(100), "h", 1), 1)
            .unwrap();
        assert_eq!(table.read(id).unwrap().route.len(), limits::JVMROUTE_SIZE - 1);
    }
}
