//! clusterlb-core: shared vocabulary for the cluster load balancer.
//!
//! - **`limits`**: fixed field sizes inherited from the shared-memory
//!   record layout
//! - **`command`**: decoded control commands (`CONFIG`, `ENABLE-APP`, …)
//! - **`error`**: the SYNTAX / MEM / GENERAL error taxonomy
//! - **`config`**: TOML configuration for every subsystem

pub mod command;
pub mod config;
pub mod error;
pub mod limits;

pub use command::{Command, CommandKind};
pub use config::ClusterConfig;
pub use error::{ErrorKind, McmpError, McmpResult};
