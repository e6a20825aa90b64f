//! Domain (LBGroup) resolution for failover.

use clusterlb_state::{DomainTable, Topology};

/// Domain of `route` within `balancer`.
///
/// Live nodes are consulted first; the Domain table remembers the
/// domain of nodes that have since been deleted.
pub fn find_node_domain(
    topology: &Topology,
    domains: &DomainTable,
    route: &str,
    balancer: &str,
) -> Option<String> {
    topology
        .nodes
        .iter()
        .map(|(node, _)| node)
        .find(|n| !n.remove && n.route == route && n.balancer.eq_ignore_ascii_case(balancer))
        .map(|n| n.domain.clone())
        .filter(|d| !d.is_empty())
        .or_else(|| domains.lookup(route, balancer))
}

#[cfg(test)]
mod tests {
    use clusterlb_core::config::TablesConfig;
    use clusterlb_state::{ClusterStore, Domain, Node};

    use super::*;

    #[test]
    fn live_node_domain_wins() {
        let store = ClusterStore::new(&TablesConfig::default());
        store
            .nodes()
            .insert_or_update(
                Node {
                    route: "node1".to_string(),
                    balancer: "mycluster".to_string(),
                    domain: "dc1".to_string(),
                    ..Node::default()
                },
                1,
            )
            .unwrap();
        let topology = Topology::build(&store);
        assert_eq!(
            find_node_domain(&topology, store.domains(), "node1", "MYCLUSTER").as_deref(),
            Some("dc1")
        );
        assert!(find_node_domain(&topology, store.domains(), "node1", "other").is_none());
    }

    #[test]
    fn falls_back_to_domain_table() {
        let store = ClusterStore::new(&TablesConfig::default());
        store
            .domains()
            .insert_or_update(
                Domain {
                    domain: "dc2".to_string(),
                    route: "gone".to_string(),
                    balancer: "mycluster".to_string(),
                    ..Domain::default()
                },
                1,
            )
            .unwrap();
        let topology = Topology::build(&store);
        assert_eq!(
            find_node_domain(&topology, store.domains(), "gone", "mycluster").as_deref(),
            Some("dc2")
        );
    }
}
