use clusterlb_core::limits;
use tracing::debug;

use crate::entity::{BALANCERS, EntityTable};
use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};
use crate::types::Balancer;

/// Balancer policies keyed by name.
#[derive(Debug)]
pub struct BalancerTable {
    slots: SlotTable<Balancer>,
}

impl EntityTable for BalancerTable {
    type Record = Balancer;

    fn slots(&self) -> &SlotTable<Balancer> {
        &self.slots
    }
}

impl BalancerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(BALANCERS, capacity),
        }
    }

    pub fn insert_or_update(&self, balancer: Balancer, now: u64) -> StateResult<SlotId> {
        let mut balancer = balancer;
        balancer.name = limits::truncate(&balancer.name, limits::BALANCER_SIZE);
        balancer.sticky_cookie = limits::truncate(&balancer.sticky_cookie, limits::COOKIE_NAME_SIZE);
        balancer.sticky_path = limits::truncate(&balancer.sticky_path, limits::PATH_NAME_SIZE);
        let name = balancer.name.clone();
        let replacement = balancer.clone();
        let (id, created) = self.slots.upsert(
            |b| b.name == name,
            |id, existing| {
                *existing = Balancer {
                    id,
                    updated_at: now,
                    ..replacement
                }
            },
            |id, _| Balancer {
                id,
                updated_at: now,
                ..balancer
            },
        )?;
        debug!(id, %name, created, "balancer stored");
        Ok(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<SlotId> {
        self.slots.find(|b| b.name == name)
    }

    /// Case-insensitive lookup, as used by the routing side.
    pub fn read_by_name(&self, name: &str) -> Option<Balancer> {
        let id = self.slots.find(|b| b.name.eq_ignore_ascii_case(name))?;
        self.slots.get(id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_by_name_replaces_policy() {
        let table = BalancerTable::new(2);
        let id = table
            .insert_or_update(
                Balancer {
                    name: "mycluster".to_string(),
                    ..Balancer::default()
                },
                1,
            )
            .unwrap();
        let again = table
            .insert_or_update(
                Balancer {
                    name: "mycluster".to_string(),
                    sticky_force: false,
                    ..Balancer::default()
                },
                2,
            )
            .unwrap();
        assert_eq!(id, again);
        let stored = table.read(id).unwrap();
        assert!(!stored.sticky_force);
        assert_eq!(stored.id, id);
        assert_eq!(table.read_by_name("MyCluster").unwrap().id, id);
    }
}
