//! clusterlb.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub tables: TablesConfig,
    pub persistence: PersistenceConfig,
    pub manager: ManagerConfig,
    pub balancer: BalancerConfig,
    pub watchdog: WatchdogConfig,
    pub listen: ListenConfig,
}

/// Capacity of each entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    pub nodes: usize,
    pub hosts: usize,
    pub contexts: usize,
    pub balancers: usize,
    pub domains: usize,
    /// Zero disables session tracking.
    pub sessions: usize,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            nodes: 20,
            hosts: 20,
            contexts: 100,
            balancers: 5,
            domains: 200,
            sessions: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "clusterlb.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Balancer used when a CONFIG carries no `Balancer` field.
    pub default_balancer: String,
    /// Accept control commands at all.
    pub enable_mcmp_receive: bool,
    /// Match virtual-host aliases against the request host name.
    pub use_alias: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_balancer: "mycluster".to_string(),
            enable_mcmp_receive: true,
            use_alias: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Pick failover targets by hashing the session id instead of load.
    pub deterministic_failover: bool,
    /// How long a per-process topology snapshot is reused. Zero builds a
    /// fresh snapshot for every request.
    pub cache_interval_ms: u64,
    /// Response header buffer size handed to new workers.
    pub response_field_size: usize,
    /// Delay before a worker in error may be retried.
    pub worker_retry_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            deterministic_failover: false,
            cache_interval_ms: 0,
            response_field_size: 8192,
            worker_retry_ms: 1000,
        }
    }
}

impl BalancerConfig {
    pub fn cache_interval(&self) -> Duration {
        Duration::from_millis(self.cache_interval_ms)
    }

    pub fn worker_retry(&self) -> Duration {
        Duration::from_millis(self.worker_retry_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
    pub lbstatus_recalc_secs: u64,
    /// Minimum age of a removal mark before the node may be deleted.
    pub wait_for_remove_secs: u64,
    /// Consecutive clean passes required before deletion.
    pub remove_check_threshold: u32,
    /// Consecutive failed idle probes before a node is marked removed.
    pub failure_idle_threshold: u32,
    pub probe_pool_size: usize,
    /// Probe timeout when the node has no ping value.
    pub probe_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub domain_ttl_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            lbstatus_recalc_secs: 5,
            wait_for_remove_secs: 10,
            remove_check_threshold: 10,
            failure_idle_threshold: 60,
            probe_pool_size: 16,
            probe_timeout_secs: 10,
            session_ttl_secs: 300,
            domain_ttl_secs: 300,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub control: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            control: "127.0.0.1:6666".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(?path, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ClusterConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert_eq!(config.tables.sessions, 0);
        assert_eq!(config.manager.default_balancer, "mycluster");
        assert_eq!(config.watchdog.remove_check_threshold, 10);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ClusterConfig::from_toml_str(
            r#"
[tables]
nodes = 64
sessions = 1000

[balancer]
deterministic_failover = true
"#,
        )
        .unwrap();
        assert_eq!(config.tables.nodes, 64);
        assert_eq!(config.tables.sessions, 1000);
        assert_eq!(config.tables.contexts, 100);
        assert!(config.balancer.deterministic_failover);
        assert_eq!(config.balancer.worker_retry(), Duration::from_secs(1));
    }

    #[test]
    fn renders_and_reparses() {
        let mut config = ClusterConfig::default();
        config.persistence.enabled = true;
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[persistence]"));
        assert_eq!(ClusterConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn rejects_bad_types() {
        assert!(ClusterConfig::from_toml_str("[tables]\nnodes = \"many\"").is_err());
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = ClusterConfig::from_file(Path::new("/nonexistent/clusterlb.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
