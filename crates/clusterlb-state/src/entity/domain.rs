use std::ops::ControlFlow;

use clusterlb_core::limits;
use tracing::debug;

use crate::entity::{DOMAINS, EntityTable};
use crate::error::StateResult;
use crate::slots::{SlotId, SlotTable};
use crate::types::Domain;

/// Remembered domains keyed by `(route, balancer)`.
#[derive(Debug)]
pub struct DomainTable {
    slots: SlotTable<Domain>,
}

impl EntityTable for DomainTable {
    type Record = Domain;

    fn slots(&self) -> &SlotTable<Domain> {
        &self.slots
    }
}

impl DomainTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotTable::create(DOMAINS, capacity),
        }
    }

    pub fn insert_or_update(&self, domain: Domain, now: u64) -> StateResult<SlotId> {
        let route = limits::truncate(&domain.route, limits::JVMROUTE_SIZE);
        let balancer = limits::truncate(&domain.balancer, limits::BALANCER_SIZE);
        let name = limits::truncate(&domain.domain, limits::DOMAIN_SIZE);
        let (id, created) = self.slots.upsert(
            |d| d.route == route && d.balancer == balancer,
            |_, existing| {
                existing.domain = name.clone();
                existing.updated_at = now;
            },
            |id, _| Domain {
                id,
                domain: name.clone(),
                route: route.clone(),
                balancer: balancer.clone(),
                updated_at: now,
            },
        )?;
        debug!(id, %route, %balancer, domain = %name, created, "domain stored");
        Ok(id)
    }

    /// Domain remembered for `route` in `balancer` (case-insensitive).
    pub fn lookup(&self, route: &str, balancer: &str) -> Option<String> {
        self.slots.doall(|_, d| {
            if d.route == route && d.balancer.eq_ignore_ascii_case(balancer) {
                ControlFlow::Break(d.domain.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Drop entries of `route`, e.g. once the node is back.
    pub fn forget(&self, route: &str, balancer: &str) -> usize {
        self.release_where(|d| d.route == route && d.balancer == balancer)
    }

    /// Release entries not refreshed within `ttl_ms`.
    pub fn expire(&self, now: u64, ttl_ms: u64) -> usize {
        self.release_where(|d| now.saturating_sub(d.updated_at) > ttl_ms)
    }

    fn release_where(&self, mut pred: impl FnMut(&Domain) -> bool) -> usize {
        let mut doomed = Vec::new();
        self.slots.doall(|id, d| {
            if pred(d) {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(route: &str, name: &str) -> Domain {
        Domain {
            route: route.to_string(),
            balancer: "mycluster".to_string(),
            domain: name.to_string(),
            ..Domain::default()
        }
    }

    #[test]
    fn lookup_after_upsert() {
        let table = DomainTable::new(4);
        let id = table.insert_or_update(domain("n1", "d1"), 1).unwrap();
        let again = table.insert_or_update(domain("n1", "d2"), 2).unwrap();
        assert_eq!(id, again);
        assert_eq!(table.lookup("n1", "MYCLUSTER").as_deref(), Some("d2"));
        assert!(table.lookup("n2", "mycluster").is_none());
    }

    #[test]
    fn expire_drops_old_entries() {
        let table = DomainTable::new(4);
        table.insert_or_update(domain("n1", "d"), 1_000).unwrap();
        table.insert_or_update(domain("n2", "d"), 5_000).unwrap();
        assert_eq!(table.expire(6_000, 2_000), 1);
        assert!(table.lookup("n1", "mycluster").is_none());
        assert!(table.lookup("n2", "mycluster").is_some());
    }
}
