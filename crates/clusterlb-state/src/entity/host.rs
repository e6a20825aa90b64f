use std::ops::ControlFlow;

use clusterlb_core::limits;
use tracing::debug;

use crate::entity::{EntityTable, HOSTS};
use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};
use crate::types::Host;

/// Virtual-host aliases keyed by `(alias, node, vhost)`.
#[derive(Debug)]
pub struct HostTable {
    slots: SlotTable<Host>,
}

impl EntityTable for HostTable {
    type Record = Host;

    fn slots(&self) -> &SlotTable<Host> {
        &self.slots
    }
}

impl HostTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(HOSTS, capacity),
        }
    }

    pub fn insert_or_update(&self, host: Host, now: u64) -> StateResult<SlotId> {
        let alias = limits::truncate(&host.alias, limits::ALIAS_SIZE);
        let (node, vhost) = (host.node, host.vhost);
        let (id, created) = self.slots.upsert(
            |h| h.node == node && h.vhost == vhost && h.alias.eq_ignore_ascii_case(&alias),
            |_, existing| existing.updated_at = now,
            |id, _| Host {
                id,
                alias: alias.clone(),
                vhost,
                node,
                updated_at: now,
            },
        )?;
        debug!(id, %alias, node, vhost, created, "host stored");
        Ok(id)
    }

    /// Id of the host matching the full natural key.
    pub fn find(&self, alias: &str, node: SlotId, vhost: u32) -> Option<SlotId> {
        self.slots
            .find(|h| h.node == node && h.vhost == vhost && h.alias.eq_ignore_ascii_case(alias))
    }

    /// First alias of `node` equal to `alias`, in any vhost group.
    pub fn find_alias_of_node(&self, alias: &str, node: SlotId) -> Option<Host> {
        self.slots.doall(|_, h| {
            if h.node == node && h.alias.eq_ignore_ascii_case(alias) {
                ControlFlow::Break(h.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    pub fn hosts_of_node(&self, node: SlotId) -> Vec<Host> {
        let mut out = Vec::new();
        self.slots.doall(|_, h| {
            if h.node == node {
                out.push(h.clone());
            }
            ControlFlow::<()>::Continue(())
        });
        out
    }

    /// Highest vhost group id used by `node`, zero when it has none.
    pub fn max_vhost(&self, node: SlotId) -> u32 {
        let mut max = 0;
        self.slots.doall(|_, h| {
            if h.node == node {
                max = max.max(h.vhost);
            }
            ControlFlow::<()>::Continue(())
        });
        max
    }

    /// Release every host of `node`, optionally only in one vhost group.
    pub fn remove_of_node(&self, node: SlotId, vhost: Option<u32>) -> usize {
        let doomed: Vec<SlotId> = self
            .hosts_of_node(node)
            .into_iter()
            .filter(|h| vhost.is_none_or(|v| v == h.vhost))
            .map(|h| h.id)
            .collect();
        doomed
            .into_iter()
            .filter(|id| self.slots.release(*id).is_ok())
            .count()
    }
}
