use std::ops::ControlFlow;

use clusterlb_core::limits;
use tracing::debug;

use crate::entity::{CONTEXTS, EntityTable};
use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};
use crate::types::{Context, ContextStatus};

/// Deployed contexts keyed by `(path, vhost, node)`.
#[derive(Debug)]
pub struct ContextTable {
    slots: SlotTable<Context>,
}

impl EntityTable for ContextTable {
    type Record = Context;

    fn slots(&self) -> &SlotTable<Context> {
        &self.slots
    }
}

impl ContextTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(CONTEXTS, capacity),
        }
    }

    /// Insert a context or set the status of the existing one. The
    /// request counter belongs to the dispatch path and is never touched
    /// here, except being zeroed on insert.
    pub fn insert_or_update(&self, context: Context, now: u64) -> StateResult<SlotId> {
        let path = limits::truncate(&context.path, limits::CONTEXT_SIZE);
        let (node, vhost, status) = (context.node, context.vhost, context.status);
        let (id, created) = self.slots.upsert(
            |c| c.node == node && c.vhost == vhost && c.path == path,
            |_, existing| {
                existing.status = status;
                existing.updated_at = now;
            },
            |id, _| Context {
                id,
                path: path.clone(),
                vhost,
                node,
                status,
                nbrequests: 0,
                updated_at: now,
            },
        )?;
        debug!(id, %path, node, vhost, status = status.as_str(), created, "context stored");
        Ok(id)
    }

    pub fn find(&self, path: &str, vhost: u32, node: SlotId) -> Option<SlotId> {
        self.slots
            .find(|c| c.node == node && c.vhost == vhost && c.path == path)
    }

    /// Contexts of `node`, optionally restricted to one vhost group.
    pub fn contexts_of(&self, node: SlotId, vhost: Option<u32>) -> Vec<Context> {
        let mut out = Vec::new();
        self.slots.doall(|_, c| {
            if c.node == node && vhost.is_none_or(|v| v == c.vhost) {
                out.push(c.clone());
            }
            ControlFlow::<()>::Continue(())
        });
        out
    }

    /// Set the status of one context.
    pub fn set_status(&self, id: SlotId, status: ContextStatus, now: u64) -> StateResult<()> {
        self.slots.update(id, |c| {
            c.status = status;
            c.updated_at = now;
        })
    }

    /// Add `delta` to the in-flight counter, returning the new value.
    pub fn adjust_requests(&self, id: SlotId, delta: i32) -> StateResult<i32> {
        self.slots.update(id, |c| {
            c.nbrequests = c.nbrequests.saturating_add(delta).max(0);
            c.nbrequests
        })
    }

    /// Count one more request in flight on `id`, returning the
    /// generation of the context it was counted against.
    pub fn begin_request(&self, id: SlotId) -> StateResult<u64> {
        let generation = self.slots.generation(id)?;
        self.slots.update_if(id, generation, |c| {
            c.nbrequests = c.nbrequests.saturating_add(1);
        })?;
        Ok(generation)
    }

    /// Undo [`ContextTable::begin_request`]. A context released and
    /// reused since then is left alone.
    pub fn end_request(&self, id: SlotId, generation: u64) -> StateResult<i32> {
        self.slots.update_if(id, generation, |c| {
            c.nbrequests = c.nbrequests.saturating_sub(1).max(0);
            c.nbrequests
        })
    }

    /// Release every context of `node`, optionally only in one vhost
    /// group. Returns the number released.
    pub fn remove_of_node(&self, node: SlotId, vhost: Option<u32>) -> usize {
        self.contexts_of(node, vhost)
            .into_iter()
            .filter(|c| self.slots.release(c.id).is_ok())
            .count()
    }
}
