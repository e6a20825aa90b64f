//! Control-plane engine.
//!
//! ```text
//! Command ──► ManagerEngine::handle
//!               ├── CONFIG              configure.rs   node + context locks
//!               ├── *-APP               apps.rs        node + context locks
//!               ├── STATUS / PING       probe unlocked, then apply the load
//!               └── DUMP / INFO / VERSION   render.rs  (snapshot)
//! ```
//!
//! Table changes run in synchronous helpers that hold the locks for
//! their whole run. No lock is held across a probe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use clusterlb_core::config::{ClusterConfig, ManagerConfig};
use clusterlb_core::limits::{self, HOST_SIZE, JVMROUTE_SIZE, PORT_SIZE, TYPE_SIZE};
use clusterlb_core::{Command, CommandKind, McmpError, McmpResult};
use clusterlb_health::{NodeProbe, ProbeTarget};
use clusterlb_state::{ClusterStore, Node, NodeType, Topology, epoch_millis};
use tracing::{debug, error, info, warn};

use crate::render;

/// STATUS load meaning "probe only, leave the load factor alone".
pub const PROBE_ONLY: i32 = -2;

/// Load value reported by a node that knows it is broken.
pub const LOAD_BROKEN: i32 = -1;

/// Highest accepted load factor.
pub const MAX_LOAD: i32 = 100;

/// Body flavour, chosen from the caller's `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Xml,
}

impl Format {
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(value) if value.to_ascii_lowercase().contains("text/xml") => Format::Xml,
            _ => Format::Text,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Text => "text/plain",
            Format::Xml => "text/xml",
        }
    }
}

/// Successful answer to a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub format: Format,
    pub body: String,
}

impl Reply {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            format: Format::Text,
            body: body.into(),
        }
    }

    pub fn new(format: Format, body: String) -> Self {
        Self { format, body }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Applies control commands to the cluster store.
pub struct ManagerEngine {
    store: ClusterStore,
    config: ManagerConfig,
    probe: Arc<dyn NodeProbe>,
    probe_timeout: Duration,
}

impl fmt::Debug for ManagerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerEngine")
            .field("config", &self.config)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl ManagerEngine {
    pub fn new(store: ClusterStore, config: &ClusterConfig, probe: Arc<dyn NodeProbe>) -> Self {
        Self {
            store,
            config: config.manager.clone(),
            probe,
            probe_timeout: config.watchdog.probe_timeout(),
        }
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Whether the control endpoint should act on commands at all.
    pub fn accepts_commands(&self) -> bool {
        self.config.enable_mcmp_receive
    }

    /// Process one command. Mutating commands are followed by a flush of
    /// the persistent image when persistence is enabled.
    pub async fn handle(&self, cmd: &Command, format: Format) -> McmpResult<Reply> {
        let result = match cmd.kind {
            CommandKind::Config => self.process_config(cmd).map(|_| Reply::empty()),
            CommandKind::EnableApp
            | CommandKind::DisableApp
            | CommandKind::StopApp
            | CommandKind::RemoveApp => self.process_app(cmd),
            CommandKind::Status => self.process_status(cmd).await,
            CommandKind::Ping => self.process_ping(cmd).await,
            CommandKind::Dump => Ok(render::dump(&Topology::build(&self.store), format)),
            CommandKind::Info => Ok(render::info(&self.store, format)),
            CommandKind::Version => Ok(render::version(format)),
        };

        match &result {
            Ok(_) => debug!(command = %cmd.kind, "command processed"),
            Err(e) => warn!(command = %cmd.kind, error = %e, "command rejected"),
        }

        if cmd.kind.is_mutating()
            && let Err(e) = self.store.flush()
        {
            error!(command = %cmd.kind, error = %e, "failed to persist tables");
        }
        result
    }

    // ── STATUS / PING ──────────────────────────────────────────────

    async fn process_status(&self, cmd: &Command) -> McmpResult<Reply> {
        let route = required_route(cmd)?;
        let load = match cmd.get("Load") {
            None => PROBE_ONLY,
            Some(value) => value
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|load| *load >= PROBE_ONLY)
                .ok_or_else(|| McmpError::syntax(format!("Invalid Load value \"{value}\"")))?,
        };
        let node = self.live_node(route)?;
        let ok = self.apply_load(&node, load).await;
        Ok(Reply::text(format!(
            "Type=STATUS-RSP&JVMRoute={route}&State={}&id={}",
            state(ok),
            self.store.epoch()
        )))
    }

    async fn process_ping(&self, cmd: &Command) -> McmpResult<Reply> {
        let epoch = self.store.epoch();
        if let Some(route) = cmd.get("JVMRoute") {
            check_size("JVMRoute", route, JVMROUTE_SIZE)?;
            let node = self.live_node(route)?;
            let ok = self.apply_load(&node, PROBE_ONLY).await;
            return Ok(Reply::text(format!(
                "Type=PING-RSP&JVMRoute={route}&State={}&id={epoch}",
                state(ok)
            )));
        }

        match (cmd.get("Scheme"), cmd.get("Host"), cmd.get("Port")) {
            (None, None, None) => Ok(Reply::text(format!("Type=PING-RSP&State=OK&id={epoch}"))),
            (Some(scheme), Some(host), Some(port)) => {
                check_size("Scheme", scheme, TYPE_SIZE)?;
                check_size("Host", host, HOST_SIZE)?;
                check_size("Port", port, PORT_SIZE)?;
                let node_type: NodeType = scheme.parse().map_err(McmpError::syntax)?;
                let port_number: u16 = number("Port", port)?;
                let target = ProbeTarget::new(node_type, strip_zone(host), port_number);
                let ok = self.probe.probe(&target, self.probe_timeout).await.is_healthy();
                debug!(address = %target.address(), ok, "endpoint ping");
                Ok(Reply::text(format!(
                    "Type=PING-RSP&Scheme={scheme}&Host={host}&Port={port}&State={}&id={epoch}",
                    state(ok)
                )))
            }
            _ => Err(McmpError::syntax(
                "Scheme, Host and Port must be given together",
            )),
        }
    }

    /// Probe `node` and apply `load` to its live status.
    async fn apply_load(&self, node: &Node, load: i32) -> bool {
        let handle = node.stats_handle();
        if load == LOAD_BROKEN {
            if let Some(stats) = self.store.nodes().stats(handle) {
                stats.set_lbfactor(LOAD_BROKEN);
                stats.mark_error(epoch_millis());
            }
            info!(route = %node.route, "node reported itself broken");
            return false;
        }

        let timeout = if node.ping_secs > 0 {
            Duration::from_secs(u64::from(node.ping_secs))
        } else {
            self.probe_timeout
        };
        let reachable = self
            .probe
            .probe(&ProbeTarget::from_node(node), timeout)
            .await
            .is_healthy();

        let Some(stats) = self.store.nodes().stats(handle) else {
            debug!(route = %node.route, "node slot reused during probe");
            return false;
        };
        if load == PROBE_ONLY {
            return reachable;
        }
        if reachable {
            stats.set_lbfactor(load.min(MAX_LOAD));
            stats.clear_error();
            debug!(route = %node.route, load = load.min(MAX_LOAD), "load factor updated");
        } else {
            warn!(route = %node.route, url = %node.worker_url(), "node unreachable");
            stats.mark_error(epoch_millis());
        }
        reachable
    }

    /// The non-removed node carrying `route`.
    pub(crate) fn live_node(&self, route: &str) -> McmpResult<Node> {
        self.store
            .nodes()
            .read_by_route(route)
            .filter(|n| !n.remove)
            .ok_or_else(|| McmpError::mem(format!("Can't read node with \"{route}\" JVMRoute")))
    }
}

// ── Field helpers ─────────────────────────────────────────────────

fn state(ok: bool) -> &'static str {
    if ok { "OK" } else { "NOTOK" }
}

/// Reject values that would not fit their record buffer.
pub(crate) fn check_size(field: &str, value: &str, size: usize) -> McmpResult<()> {
    if limits::fits(value, size) {
        Ok(())
    } else {
        Err(McmpError::syntax(format!("{field} field too big")))
    }
}

/// Mandatory, size-checked JVMRoute.
pub(crate) fn required_route(cmd: &Command) -> McmpResult<&str> {
    match cmd.get("JVMRoute") {
        Some(route) if !route.is_empty() => {
            check_size("JVMRoute", route, JVMROUTE_SIZE)?;
            Ok(route)
        }
        _ => Err(McmpError::syntax("JVMRoute can't be empty")),
    }
}

pub(crate) fn number<T: std::str::FromStr>(field: &str, value: &str) -> McmpResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| McmpError::syntax(format!("Invalid {field} value \"{value}\"")))
}

/// Drop an IPv6 `%zone` suffix, keeping brackets balanced.
pub(crate) fn strip_zone(host: &str) -> String {
    match host.split_once('%') {
        Some((addr, _)) if host.starts_with('[') => format!("{addr}]"),
        Some((addr, _)) => addr.to_string(),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use clusterlb_core::ErrorKind;
    use clusterlb_health::{BoxFuture, ProbeResult};

    use super::*;

    struct Fixed(ProbeResult);

    impl NodeProbe for Fixed {
        fn probe<'a>(&'a self, _: &'a ProbeTarget, _: Duration) -> BoxFuture<'a, ProbeResult> {
            let result = self.0;
            Box::pin(async move { result })
        }
    }

    fn engine(result: ProbeResult) -> ManagerEngine {
        let config = ClusterConfig::default();
        ManagerEngine::new(
            ClusterStore::new(&config.tables),
            &config,
            Arc::new(Fixed(result)),
        )
    }

    async fn register(engine: &ManagerEngine) {
        let cmd = Command::new(CommandKind::Config)
            .with("JVMRoute", "node1")
            .with("Host", "10.0.0.1")
            .with("Port", "8009");
        engine.handle(&cmd, Format::Text).await.unwrap();
    }

    #[tokio::test]
    async fn status_sets_and_clamps_load() {
        let engine = engine(ProbeResult::Healthy);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "250");
        let reply = engine.handle(&cmd, Format::Text).await.unwrap();
        assert!(reply.body.starts_with("Type=STATUS-RSP&JVMRoute=node1&State=OK&id="));
        let stats = engine.store().nodes().stats_of(0).unwrap();
        assert_eq!(stats.lbfactor(), 100);
    }

    #[tokio::test]
    async fn status_zero_load_makes_standby() {
        let engine = engine(ProbeResult::Healthy);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "0");
        engine.handle(&cmd, Format::Text).await.unwrap();
        assert_eq!(engine.store().nodes().stats_of(0).unwrap().lbfactor(), 0);
    }

    #[tokio::test]
    async fn status_broken_load_marks_error() {
        let engine = engine(ProbeResult::Healthy);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "-1");
        let reply = engine.handle(&cmd, Format::Text).await.unwrap();
        assert!(reply.body.contains("State=NOTOK"));
        let stats = engine.store().nodes().stats_of(0).unwrap();
        assert_eq!(stats.lbfactor(), -1);
        assert!(stats.in_error());
    }

    #[tokio::test]
    async fn status_unreachable_answers_notok() {
        let engine = engine(ProbeResult::Failed);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "50");
        let reply = engine.handle(&cmd, Format::Text).await.unwrap();
        assert!(reply.body.contains("State=NOTOK"));
        assert!(engine.store().nodes().stats_of(0).unwrap().in_error());
    }

    #[tokio::test]
    async fn status_for_unknown_node_is_mem_error() {
        let engine = engine(ProbeResult::Healthy);
        let cmd = Command::new(CommandKind::Status).with("JVMRoute", "ghost");
        let err = engine.handle(&cmd, Format::Text).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Mem);
    }

    #[tokio::test]
    async fn status_rejects_bad_load() {
        let engine = engine(ProbeResult::Healthy);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "-5");
        let err = engine.handle(&cmd, Format::Text).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[tokio::test]
    async fn ping_probe_only_leaves_load() {
        let engine = engine(ProbeResult::Healthy);
        register(&engine).await;
        let cmd = Command::new(CommandKind::Ping).with("JVMRoute", "node1");
        let reply = engine.handle(&cmd, Format::Text).await.unwrap();
        assert!(reply.body.starts_with("Type=PING-RSP&JVMRoute=node1&State=OK"));
        assert_eq!(engine.store().nodes().stats_of(0).unwrap().lbfactor(), 1);
    }

    #[tokio::test]
    async fn ping_raw_endpoint() {
        let engine = engine(ProbeResult::Failed);
        let cmd = Command::new(CommandKind::Ping)
            .with("Scheme", "http")
            .with("Host", "10.0.0.9")
            .with("Port", "8080");
        let reply = engine.handle(&cmd, Format::Text).await.unwrap();
        assert!(reply
            .body
            .starts_with("Type=PING-RSP&Scheme=http&Host=10.0.0.9&Port=8080&State=NOTOK&id="));
    }

    #[tokio::test]
    async fn ping_partial_endpoint_is_syntax_error() {
        let engine = engine(ProbeResult::Healthy);
        let cmd = Command::new(CommandKind::Ping).with("Host", "10.0.0.9");
        let err = engine.handle(&cmd, Format::Text).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[tokio::test]
    async fn bare_ping_reports_epoch() {
        let engine = engine(ProbeResult::Failed);
        let reply = engine
            .handle(&Command::new(CommandKind::Ping), Format::Text)
            .await
            .unwrap();
        assert_eq!(
            reply.body,
            format!("Type=PING-RSP&State=OK&id={}", engine.store().epoch())
        );
    }

    #[test]
    fn accept_header_selects_format() {
        assert_eq!(Format::from_accept(Some("text/xml")), Format::Xml);
        assert_eq!(Format::from_accept(Some("TEXT/XML; q=1")), Format::Xml);
        assert_eq!(Format::from_accept(Some("text/html")), Format::Text);
        assert_eq!(Format::from_accept(None), Format::Text);
    }

    #[test]
    fn zone_suffix_is_stripped() {
        assert_eq!(strip_zone("fe80::1%eth0"), "fe80::1");
        assert_eq!(strip_zone("[fe80::1%eth0]"), "[fe80::1]");
        assert_eq!(strip_zone("10.0.0.1"), "10.0.0.1");
    }
}
