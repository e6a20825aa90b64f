use std::ops::ControlFlow;

use clusterlb_core::limits;

use crate::entity::{EntityTable, SESSIONS};
use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};
use crate::types::SessionRecord;

/// Session ids keyed by id. A zero-capacity table disables tracking.
#[derive(Debug)]
pub struct SessionTable {
    slots: SlotTable<SessionRecord>,
}

impl EntityTable for SessionTable {
    type Record = SessionRecord;

    fn slots(&self) -> &SlotTable<SessionRecord> {
        &self.slots
    }
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(SESSIONS, capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.slots.num_slots() > 0
    }

    pub fn insert_or_update(&self, session: SessionRecord, now: u64) -> StateResult<SlotId> {
        let session_id = limits::truncate(&session.session_id, limits::SESSIONID_SIZE);
        let route = limits::truncate(&session.route, limits::JVMROUTE_SIZE);
        let (id, _) = self.slots.upsert(
            |s| s.session_id == session_id,
            |_, existing| {
                existing.route = route.clone();
                existing.updated_at = now;
            },
            |id, _| SessionRecord {
                id,
                session_id: session_id.clone(),
                route: route.clone(),
                updated_at: now,
            },
        )?;
        Ok(id)
    }

    /// Route recorded for `session_id`.
    pub fn route_of(&self, session_id: &str) -> Option<String> {
        self.slots.doall(|_, s| {
            if s.session_id == session_id {
                ControlFlow::Break(s.route.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    pub fn count_for_route(&self, route: &str) -> usize {
        let mut count = 0;
        self.slots.doall(|_, s| {
            if s.route == route {
                count += 1;
            }
            ControlFlow::<()>::Continue(())
        });
        count
    }

    /// Release sessions not refreshed within `ttl_ms`.
    pub fn expire(&self, now: u64, ttl_ms: u64) -> usize {
        let mut doomed = Vec::new();
        self.slots.doall(|id, s| {
            if now.saturating_sub(s.updated_at) > ttl_ms {
                doomed.push(id);
            }
            ControlFlow::<()>::Continue(())
        });
        doomed
            .into_iter()
            .filter(|id| self.slots.release(*id).is_ok())
            .count()
    }
}
