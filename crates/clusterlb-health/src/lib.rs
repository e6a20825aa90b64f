//! clusterlb-health: reachability probes for backend nodes.
//!
//! Nodes are probed in the protocol they speak: AJP nodes get a CPING and
//! must answer CPONG, HTTP nodes get an `OPTIONS *` request, the rest
//! are checked with a plain TCP connect.
//!
//! # Architecture
//!
//! ```text
//! NodeProbe (trait)  ──  LiveProbe: cping_probe / http_probe / tcp_probe
//!   │
//!   ├── ProbePool      bounded concurrency for watchdog probes,
//!   │                  runs inline when saturated
//!   └── HealthMonitor  per-worker background task with HealthTracker
//!                      backoff, flips the live-status error flag
//! ```

pub mod checker;
pub mod monitor;
pub mod pool;

pub use checker::{
    BoxFuture, HealthStatus, HealthTracker, LiveProbe, NodeProbe, ProbeError, ProbeResult,
    ProbeTarget,
};
pub use monitor::HealthMonitor;
pub use pool::ProbePool;
