//! End-to-end control-plane scenarios: commands in, tables and routing
//! decisions out.

use std::sync::Arc;
use std::time::Duration;

use clusterlb_balancer::{RouteError, RouteRequest, Router, RouterOptions, WorkerRegistry};
use clusterlb_core::limits::REMOVED_ROUTE;
use clusterlb_core::{ClusterConfig, Command, CommandKind};
use clusterlb_health::{BoxFuture, NodeProbe, ProbeResult, ProbeTarget};
use clusterlb_manager::{Format, ManagerEngine};
use clusterlb_state::{ClusterStore, ContextStatus, EntityTable, Topology};

struct AlwaysUp;

impl NodeProbe for AlwaysUp {
    fn probe<'a>(&'a self, _: &'a ProbeTarget, _: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async { ProbeResult::Healthy })
    }
}

struct Harness {
    config: ClusterConfig,
    engine: ManagerEngine,
}

impl Harness {
    fn new() -> Self {
        let config = ClusterConfig::default();
        let store = ClusterStore::new(&config.tables);
        let engine = ManagerEngine::new(store, &config, Arc::new(AlwaysUp));
        Self { config, engine }
    }

    fn store(&self) -> &ClusterStore {
        self.engine.store()
    }

    async fn send(&self, cmd: Command) -> String {
        self.engine
            .handle(&cmd, Format::Text)
            .await
            .expect("command accepted")
            .body
    }

    fn router(&self) -> Router {
        Router::new(
            self.store().clone(),
            Arc::new(WorkerRegistry::new(
                "default",
                self.config.balancer.response_field_size,
            )),
            RouterOptions::from_config(&self.config),
        )
    }
}

fn config_node1() -> Command {
    Command::new(CommandKind::Config)
        .with("JVMRoute", "node1")
        .with("Host", "10.0.0.1")
        .with("Port", "8009")
        .with("Type", "ajp")
        .with("Balancer", "clusterA")
        .with("Alias", "www.example.com")
        .with("Context", "/app")
}

#[tokio::test]
async fn config_registers_node_host_and_stopped_context() {
    let h = Harness::new();
    h.send(config_node1()).await;

    let topology = Topology::build(h.store());
    let nodes: Vec<_> = topology.nodes.iter().collect();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].0.route, "node1");

    let hosts: Vec<_> = topology.hosts.iter().collect();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].alias, "www.example.com");
    assert_eq!(hosts[0].node, nodes[0].0.id);

    let contexts: Vec<_> = topology.contexts.iter().collect();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].path, "/app");
    assert_eq!(contexts[0].status, ContextStatus::Stopped);

    let dump = h.send(Command::new(CommandKind::Dump)).await;
    assert!(dump.contains("JVMRoute: node1"));
    assert!(dump.contains("[www.example.com] vhost: 1"));
    assert!(dump.contains("[/app] vhost: 1 node: 0 status: 3"));
}

#[tokio::test]
async fn enable_app_makes_node_routable() {
    let h = Harness::new();
    h.send(config_node1()).await;
    let router = h.router();
    let request = RouteRequest {
        host: Some("www.example.com"),
        uri: "/app/index.html",
        cookies: None,
    };
    assert!(matches!(router.route(&request), Err(RouteError::NoContext)));

    h.send(
        Command::new(CommandKind::EnableApp)
            .with("JVMRoute", "node1")
            .with("Alias", "www.example.com")
            .with("Context", "/app"),
    )
    .await;
    let id = h.store().contexts().find("/app", 1, 0).unwrap();
    assert_eq!(
        h.store().contexts().read(id).unwrap().status,
        ContextStatus::Enabled
    );

    let decision = router.route(&request).unwrap();
    assert_eq!(decision.route, "node1");
    assert_eq!(decision.balancer, "clustera");
}

#[tokio::test]
async fn reconfig_with_new_port_retires_old_record() {
    let h = Harness::new();
    h.send(config_node1()).await;
    let before = h.store().version();

    h.send(config_node1().with("Port", "8010")).await;

    let store = h.store();
    let old = store.nodes().read(0).unwrap();
    assert!(old.remove);
    assert_eq!(old.route, REMOVED_ROUTE);
    assert!(store.hosts().hosts_of_node(0).is_empty());
    assert!(store.contexts().contexts_of(0, None).is_empty());

    let fresh = store.nodes().read_by_route("node1").unwrap();
    assert!(!fresh.remove);
    assert_eq!(fresh.port, 8010);
    assert_eq!(store.hosts().hosts_of_node(fresh.id).len(), 1);
    assert!(store.version() > before);
}

#[tokio::test]
async fn wildcard_remove_purges_node_and_is_idempotent() {
    let h = Harness::new();
    h.send(
        Command::new(CommandKind::Config)
            .with("JVMRoute", "node1")
            .with("Host", "10.0.0.1")
            .with("Alias", "www.example.com")
            .with("Context", "/app,/shop,/admin"),
    )
    .await;
    assert_eq!(h.store().contexts().len(), 3);

    let remove = Command::new(CommandKind::RemoveApp)
        .with("JVMRoute", "node1")
        .with("Context", "/*");
    h.send(remove.clone()).await;

    let store = h.store();
    assert!(store.contexts().is_empty());
    assert!(store.hosts().is_empty());
    assert!(store.nodes().read(0).unwrap().remove);

    assert_eq!(h.send(remove).await, "");
}

#[tokio::test]
async fn bare_ping_is_always_ok() {
    let h = Harness::new();
    let body = h.send(Command::new(CommandKind::Ping)).await;
    assert_eq!(
        body,
        format!("Type=PING-RSP&State=OK&id={}", h.store().epoch())
    );

    h.send(config_node1()).await;
    let body = h.send(Command::new(CommandKind::Ping)).await;
    assert!(body.contains("State=OK"));
}

#[tokio::test]
async fn info_reports_live_counters() {
    let h = Harness::new();
    h.send(config_node1()).await;
    h.send(
        Command::new(CommandKind::Status)
            .with("JVMRoute", "node1")
            .with("Load", "80"),
    )
    .await;
    let info = h.send(Command::new(CommandKind::Info)).await;
    assert!(info.contains("Name: node1"));
    assert!(info.contains("Load: 80"));
}
