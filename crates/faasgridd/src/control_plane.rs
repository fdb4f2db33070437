//! Control plane mode: the invocation path and everything it depends on.
//!
//! In this mode, the daemon:
//! 1. Opens the redb state store
//! 2. Wires the cold-start scheduler to worker agents over HTTP
//! 3. Wires the dispatcher to instance executors over HTTP
//! 4. Runs the heartbeat monitor, which stops executors of reaped instances
//! 5. Serves the HTTP surface until SIGINT/SIGTERM

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};

use faasgrid_api::{ApiState, build_router};
use faasgrid_core::ControlPlaneConfig;
use faasgrid_dispatch::{Dispatcher, HttpProxy};
use faasgrid_health::{HeartbeatMonitor, MonitorConfig, ReapCallback};
use faasgrid_scheduler::{ColdStartScheduler, HttpLauncher, InstanceLauncher, ProvisionConfig};
use faasgrid_state::{Instance, StateStore};

/// Run the control plane.
pub async fn run_control_plane(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("faasgrid control plane starting");
    std::fs::create_dir_all(&config.data_dir)?;

    // ── State store ──────────────────────────────────────────────
    let db_path = config.data_dir.join("faasgrid.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Scheduler + dispatcher ───────────────────────────────────
    let launcher: Arc<dyn InstanceLauncher> = Arc::new(HttpLauncher::new(config.launch_timeout()));
    let scheduler = Arc::new(ColdStartScheduler::new(
        state.clone(),
        launcher.clone(),
        ProvisionConfig::from_control_plane(&config),
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(state.clone(), scheduler.clone(), Arc::new(HttpProxy))
            .with_proxy_buffer(config.proxy_buffer()),
    );
    info!(
        advertise_url = %config.advertise_url,
        proxy_buffer = ?config.proxy_buffer(),
        "scheduler and dispatcher initialized"
    );

    // ── Heartbeat monitor ────────────────────────────────────────
    let monitor = HeartbeatMonitor::new(state.clone(), MonitorConfig::from_control_plane(&config))
        .with_reap_callback(stop_reaped(state.clone(), launcher));
    let monitor_handle = monitor.start();

    // ── HTTP surface ─────────────────────────────────────────────
    let router = build_router(ApiState::new(state, scheduler, dispatcher));
    let addr = config.listen.parse::<std::net::SocketAddr>()?;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;

    monitor_handle.stop().await;
    info!("control plane stopped");
    Ok(())
}

/// Ask the worker to kill the executor of an instance the monitor deleted.
fn stop_reaped(state: StateStore, launcher: Arc<dyn InstanceLauncher>) -> ReapCallback {
    Arc::new(move |instance: Instance| -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let state = state.clone();
        let launcher = launcher.clone();
        Box::pin(async move {
            let worker = match state.get_worker(&instance.worker_id) {
                Ok(Some(worker)) => worker,
                Ok(None) => return,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "worker lookup failed");
                    return;
                }
            };
            if let Err(e) = launcher.stop(&worker, &instance.id).await {
                warn!(instance_id = %instance.id, worker_id = %worker.id, error = %e, "stop failed");
            }
        })
    })
}
