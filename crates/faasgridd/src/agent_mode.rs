//! Agent mode: runs on worker hosts.
//!
//! In this mode, the daemon:
//! 1. Serves the management surface the control plane launches through
//! 2. Supervises one executor process per instance
//! 3. Heartbeats its capacity to the control plane
//! 4. On shutdown, drains the worker and kills its executors

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use faasgrid_agent::{HeartbeatClient, HostIdentity, Supervisor, SupervisorConfig, build_router};
use faasgrid_core::AgentConfig;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Run the worker agent.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(hostname = %config.hostname, "faasgrid agent starting");
    std::fs::create_dir_all(&config.work_dir)?;

    let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
        executor_bin: config.executor_bin.clone(),
        work_dir: config.work_dir.clone(),
        max_memory_mb: config.max_memory_mb,
    }));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ─────────────────────────────────────────
    let reaper_handle = tokio::spawn(
        supervisor
            .clone()
            .run_reaper(REAP_INTERVAL, shutdown_rx.clone()),
    );

    let heartbeat = HeartbeatClient::new(
        &config.control_plane_url,
        HostIdentity {
            hostname: config.hostname.clone(),
            ip_address: config.ip_address.clone(),
            agent_port: config.agent_port(),
        },
        supervisor.clone(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat.run(config.heartbeat_interval(), shutdown_rx));

    // ── Management surface ───────────────────────────────────────
    let addr = config.listen_addr()?;
    info!(%addr, "management surface starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, build_router(supervisor.clone()))
        .with_graceful_shutdown(async move {
            crate::shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // The heartbeat loop drains the worker before exiting.
    let _ = heartbeat_handle.await;
    let _ = reaper_handle.await;
    let stopped = supervisor.stop_all().await;

    info!(stopped, "agent stopped");
    Ok(())
}
