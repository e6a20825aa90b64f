//! clusterlb-balancer: the routing engine.
//!
//! Turns the topology store into dispatch decisions and keeps the
//! proxy-side worker objects in line with it.
//!
//! # Architecture
//!
//! ```text
//! request ──► Router::route
//!               ├── context::find_node_context_host  (longest prefix)
//!               ├── sticky::find_session              (cookie / path)
//!               ├── domain::find_node_domain          (failover scope)
//!               └── WorkerRegistry (workers per balancer)
//!
//! Reconciler (watchdog, periodic)
//!   ├── WorkerRegistry::sync / detach_orphans / retire_idle_workers
//!   ├── removed-node deletion, lbstatus recompute
//!   └── ProbePool idle probes, HealthMonitor registration
//! ```

pub mod context;
pub mod domain;
pub mod error;
pub mod reconcile;
pub mod router;
pub mod sticky;
pub mod worker;

pub use context::NodeContext;
pub use error::{RouteError, RouteResult};
pub use reconcile::{PassStats, Reconciler};
pub use router::{InFlight, RouteDecision, RouteRequest, Router, RouterOptions};
pub use sticky::StickySession;
pub use worker::{BalancerRuntime, SyncReport, Worker, WorkerKey, WorkerRegistry};
