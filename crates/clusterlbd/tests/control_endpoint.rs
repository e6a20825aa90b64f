//! Daemon regression tests.
//!
//! Drives the control endpoint the way backend nodes do and checks the
//! watchdog's view of the result.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use clusterlb_balancer::{
    Reconciler, RouteRequest, Router as RequestRouter, RouterOptions, WorkerRegistry,
};
use clusterlb_core::ClusterConfig;
use clusterlb_health::{BoxFuture, NodeProbe, ProbePool, ProbeResult, ProbeTarget};
use clusterlb_manager::{ManagerEngine, control_router};
use clusterlb_state::{ClusterStore, EntityTable};
use http_body_util::BodyExt;
use tokio::sync::watch;
use tower::ServiceExt;

struct AlwaysUp;

impl NodeProbe for AlwaysUp {
    fn probe<'a>(&'a self, _: &'a ProbeTarget, _: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async { ProbeResult::Healthy })
    }
}

struct Daemon {
    store: ClusterStore,
    control: Router,
    registry: Arc<WorkerRegistry>,
    watchdog: Reconciler,
    config: ClusterConfig,
    _stop: watch::Sender<bool>,
}

fn daemon() -> Daemon {
    let mut config = ClusterConfig::default();
    config.watchdog.wait_for_remove_secs = 0;
    config.watchdog.remove_check_threshold = 1;
    let store = ClusterStore::new(&config.tables);
    let probe: Arc<dyn NodeProbe> = Arc::new(AlwaysUp);
    let registry = Arc::new(WorkerRegistry::new("default", config.balancer.response_field_size));
    let (stop, stopping) = watch::channel(false);
    let watchdog = Reconciler::new(
        store.clone(),
        vec![Arc::clone(&registry)],
        config.watchdog.clone(),
        ProbePool::new(0, Arc::clone(&probe)),
        stopping,
    );
    let engine = Arc::new(ManagerEngine::new(store.clone(), &config, probe));
    Daemon {
        store,
        control: control_router(engine),
        registry,
        watchdog,
        config,
        _stop: stop,
    }
}

async fn send(control: &Router, method: &str, path: &str, body: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method(Method::from_bytes(method.as_bytes()).unwrap())
        .uri(path)
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = control.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

const CONFIG_NODE1: &str =
    "JVMRoute=node1&Host=10.0.0.1&Port=8009&Type=ajp&Balancer=mycluster&Alias=www.example.com&Context=%2Fapp";

#[tokio::test]
async fn config_then_pass_creates_worker() {
    let d = daemon();
    let (status, _) = send(&d.control, "CONFIG", "/", CONFIG_NODE1).await;
    assert_eq!(status, StatusCode::OK);

    let stats = d.watchdog.run_pass().await;
    assert_eq!(stats.created, 1);
    assert!(d.registry.worker_by_route("mycluster", "node1").is_some());
}

#[tokio::test]
async fn enabled_context_routes_through_registry() {
    let d = daemon();
    send(&d.control, "CONFIG", "/", CONFIG_NODE1).await;
    let (status, _) = send(
        &d.control,
        "ENABLE-APP",
        "/",
        "JVMRoute=node1&Alias=www.example.com&Context=%2Fapp",
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let router = RequestRouter::new(
        d.store.clone(),
        Arc::clone(&d.registry),
        RouterOptions::from_config(&d.config),
    );
    let decision = router
        .route(&RouteRequest {
            host: Some("www.example.com"),
            uri: "/app/index.html",
            cookies: Some("JSESSIONID=abc.node1"),
        })
        .unwrap();
    assert_eq!(decision.route, "node1");
    assert!(decision.sticky_hit);
}

#[tokio::test]
async fn removed_node_is_deleted_after_grace_passes() {
    let d = daemon();
    send(&d.control, "CONFIG", "/", CONFIG_NODE1).await;
    d.watchdog.run_pass().await;

    let (status, _) = send(&d.control, "REMOVE-APP", "/*", "JVMRoute=node1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(d.store.nodes().read(0).unwrap().remove);

    // First pass retires the idle worker, the following ones count down.
    let mut deleted = 0;
    for _ in 0..4 {
        deleted += d.watchdog.run_pass().await.deleted_nodes;
    }
    assert_eq!(deleted, 1);
    assert!(d.store.nodes().is_empty());

    let (status, body) = send(&d.control, "REMOVE-APP", "/*", "JVMRoute=node1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn status_and_info_over_http() {
    let d = daemon();
    send(&d.control, "CONFIG", "/", CONFIG_NODE1).await;
    let (status, body) = send(&d.control, "STATUS", "/", "JVMRoute=node1&Load=60").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("Type=STATUS-RSP&JVMRoute=node1&State=OK&id="));

    let (_, info) = send(&d.control, "INFO", "/", "").await;
    assert!(info.contains("Load: 60"));
    assert!(info.contains("Alias: www.example.com"));
}

#[tokio::test]
async fn injected_markup_is_rejected() {
    let d = daemon();
    let (status, _) = send(&d.control, "CONFIG", "/", "JVMRoute=%3Cscript%3E").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(d.store.nodes().is_empty());
}
