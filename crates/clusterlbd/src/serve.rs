//! Serve mode.
//!
//! In this mode, the daemon:
//! 1. Opens the cluster store, restoring the persisted image if enabled
//! 2. Starts the reconciliation watchdog with its health monitor
//! 3. Serves the MCMP control endpoint until Ctrl-C
//! 4. Raises the stopping flag, waits for the watchdog and flushes

use std::path::Path;
use std::sync::Arc;

use clusterlb_balancer::{Reconciler, WorkerRegistry};
use clusterlb_core::ClusterConfig;
use clusterlb_health::{HealthMonitor, LiveProbe, NodeProbe, ProbePool};
use clusterlb_manager::{ManagerEngine, control_router};
use clusterlb_state::ClusterStore;
use tokio::sync::watch;
use tracing::{error, info};

/// Registry name of the daemon's own dispatch workers.
const REGISTRY_NAME: &str = "default";

pub fn open_store(config: &ClusterConfig) -> anyhow::Result<ClusterStore> {
    if !config.persistence.enabled {
        return Ok(ClusterStore::new(&config.tables));
    }
    let path = Path::new(&config.persistence.path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let store = ClusterStore::open(path, &config.tables)
        .map_err(|e| anyhow::anyhow!("open store {}: {e}", path.display()))?;
    info!(path = ?path, "cluster store opened");
    Ok(store)
}

pub async fn run(config: ClusterConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "clusterlb daemon starting");

    // ── Store and probes ─────────────────────────────────────────
    let store = open_store(&config)?;
    let probe: Arc<dyn NodeProbe> = Arc::new(LiveProbe);

    // ── Watchdog ─────────────────────────────────────────────────
    let registry = Arc::new(WorkerRegistry::new(
        REGISTRY_NAME,
        config.balancer.response_field_size,
    ));
    let monitor = Arc::new(HealthMonitor::new(
        store.clone(),
        Arc::clone(&probe),
        config.watchdog.interval(),
    ));
    let pool = ProbePool::new(config.watchdog.probe_pool_size, Arc::clone(&probe));
    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        store.clone(),
        vec![registry],
        config.watchdog.clone(),
        pool,
        stop_rx,
    )
    .with_monitor(monitor);
    let watchdog = tokio::spawn(async move {
        reconciler.run().await;
    });

    // ── Control endpoint ─────────────────────────────────────────
    let engine = Arc::new(ManagerEngine::new(store.clone(), &config, probe));
    let router = control_router(engine);
    let listener = tokio::net::TcpListener::bind(&config.listen.control).await?;
    info!(addr = %listener.local_addr()?, "control endpoint listening");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });
    server.await?;

    // Wait for the watchdog, then write the final image.
    let _ = watchdog.await;
    if let Err(e) = store.flush() {
        error!(error = %e, "failed to persist tables on shutdown");
    }

    info!("clusterlb daemon stopped");
    Ok(())
}
