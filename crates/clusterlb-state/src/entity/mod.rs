//! Entity tables.
//!
//! Each table wraps a [`SlotTable`] and adds the natural-key semantics of
//! its record type: `insert_or_update` scans for the key and rewrites the
//! mutable fields in place, or grabs a new slot and stamps the slot id as
//! the record id. The shared contract lives in [`EntityTable`].

mod balancer;
mod context;
mod domain;
mod host;
mod node;
mod session;

pub use balancer::BalancerTable;
pub use context::ContextTable;
pub use domain::DomainTable;
pub use host::HostTable;
pub use node::NodeTable;
pub use session::SessionTable;

use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};

/// Operations common to all six tables.
pub trait EntityTable {
    type Record: Clone;

    fn slots(&self) -> &SlotTable<Self::Record>;

    /// Record held in slot `id`.
    fn read(&self, id: SlotId) -> StateResult<Self::Record> {
        self.slots().get(id)
    }

    /// Fill `out` with the ids in use, returning the count.
    fn list_used_ids(&self, out: &mut Vec<SlotId>) -> usize {
        self.slots().used_ids(out)
    }

    fn capacity(&self) -> usize {
        self.slots().num_slots()
    }

    fn len(&self) -> usize {
        self.slots().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release slot `id`, returning the record it held.
    fn remove(&self, id: SlotId) -> StateResult<Self::Record> {
        self.slots().release(id)
    }

    /// Copy of every record in id order.
    fn records(&self) -> Vec<Self::Record> {
        self.slots()
            .entries()
            .into_iter()
            .map(|(_, _, record)| record)
            .collect()
    }
}

// Slot table names.
pub(crate) const NODES: &str = "nodes";
pub(crate) const HOSTS: &str = "hosts";
pub(crate) const CONTEXTS: &str = "contexts";
pub(crate) const BALANCERS: &str = "balancers";
pub(crate) const DOMAINS: &str = "domains";
pub(crate) const SESSIONS: &str = "sessions";
