//! clusterlb-manager: the control plane.
//!
//! Applies MCMP commands sent by backend nodes to the cluster store and
//! exposes them over an axum endpoint.
//!
//! # Commands
//!
//! | Method | Effect |
//! |---|---|
//! | `CONFIG` | Register or refresh a node, its balancer and vhosts |
//! | `ENABLE-APP` / `DISABLE-APP` / `STOP-APP` | Change context status |
//! | `REMOVE-APP` | Drop a context, or the whole node with `/*` |
//! | `STATUS` | Probe the node and set its load factor |
//! | `PING` | Probe a node, a raw endpoint, or just the proxy |
//! | `DUMP` / `INFO` | Render the tables, INFO with live counters |
//! | `VERSION` | Release and protocol revision |

mod apps;
pub mod configure;
pub mod engine;
pub mod http;
pub mod render;

pub use configure::{NodeConfig, VhostGroup};
pub use engine::{Format, ManagerEngine, Reply};
pub use http::{ControlState, control_router};
