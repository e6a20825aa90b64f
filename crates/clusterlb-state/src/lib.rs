//! clusterlb-state: the cluster topology store.
//!
//! Six fixed-capacity entity tables (nodes, hosts, contexts, balancers,
//! domains, session ids) built on a generic [`SlotTable`], a per-node
//! live-status block for hot counters, a node-table version counter and
//! the two global locks guarding multi-table changes.
//!
//! # Architecture
//!
//! ```text
//! ClusterStore (Clone, Arc-shared by every worker)
//!   ├── NodeTable ──── LiveStatusTable (one block per node slot)
//!   ├── HostTable / ContextTable / BalancerTable
//!   ├── DomainTable / SessionTable
//!   ├── version counter, process epoch
//!   └── optional redb image (persist.rs)
//!
//! Topology (snapshot.rs): per-request or cached read views
//! ```
//!
//! Record identity is the slot id; natural keys are resolved by a full
//! scan, first match wins.

pub mod entity;
pub mod error;
pub mod live;
mod persist;
pub mod slots;
pub mod snapshot;
pub mod store;
mod tables;
pub mod types;

pub use entity::{
    BalancerTable, ContextTable, DomainTable, EntityTable, HostTable, NodeTable, SessionTable,
};
pub use error::{StateError, StateResult};
pub use live::{LiveStatus, LiveStatusTable, StatsHandle};
pub use slots::{SlotId, SlotTable};
pub use snapshot::{NodeView, TableView, Topology, TopologyCache};
pub use store::{ClusterStore, epoch_millis};
pub use types::*;
