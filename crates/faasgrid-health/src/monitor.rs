//! Heartbeat monitor: background task that sweeps worker and instance state.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use faasgrid_core::{ControlPlaneConfig, epoch_millis};
use faasgrid_scheduler::{SchedulerError, WorkerRegistry};
use faasgrid_state::{Instance, StateError, StateStore};

/// Callback invoked for each ERROR instance the sweep deletes.
///
/// The control plane uses it to ask the worker to stop the executor.
pub type ReapCallback = Arc<dyn Fn(Instance) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Registry(#[from] SchedulerError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sweep_interval: Duration,
    pub staleness: Duration,
    pub idle_after: Duration,
    pub error_retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            staleness: Duration::from_secs(15),
            idle_after: Duration::from_secs(300),
            error_retention: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn from_control_plane(config: &ControlPlaneConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            staleness: config.staleness_threshold(),
            idle_after: config.idle_after(),
            error_retention: config.error_retention(),
        }
    }
}

/// What a single sweep changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub offline_workers: Vec<String>,
    pub idled_instances: Vec<String>,
    pub reaped_instances: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.offline_workers.is_empty()
            && self.idled_instances.is_empty()
            && self.reaped_instances.is_empty()
    }
}

/// Periodically evaluates worker liveness and recycles instances.
pub struct HeartbeatMonitor {
    state: StateStore,
    workers: WorkerRegistry,
    config: MonitorConfig,
    on_reap: Option<ReapCallback>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorHandle {
    /// Signal the loop to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "heartbeat monitor task failed");
        }
    }
}

impl HeartbeatMonitor {
    pub fn new(state: StateStore, config: MonitorConfig) -> Self {
        Self {
            workers: WorkerRegistry::new(state.clone()),
            state,
            config,
            on_reap: None,
        }
    }

    /// Set a callback for reaped ERROR instances.
    pub fn with_reap_callback(mut self, callback: ReapCallback) -> Self {
        self.on_reap = Some(callback);
        self
    }

    /// Run one sweep.
    pub async fn sweep(&self) -> Result<SweepReport, MonitorError> {
        let now = epoch_millis();
        let offline = self.workers.mark_stale_offline(self.config.staleness)?;

        let idled = self
            .state
            .demote_idle_instances(now, self.config.idle_after.as_millis() as u64)?;
        for instance in &idled {
            debug!(instance_id = %instance.id, "instance idle");
        }

        let reaped = self
            .state
            .reap_error_instances(now, self.config.error_retention.as_millis() as u64)?;
        for instance in &reaped {
            info!(
                instance_id = %instance.id,
                worker_id = %instance.worker_id,
                "reaped failed instance"
            );
        }

        let report = SweepReport {
            offline_workers: offline.into_iter().map(|w| w.id).collect(),
            idled_instances: idled.into_iter().map(|i| i.id).collect(),
            reaped_instances: reaped.iter().map(|i| i.id.clone()).collect(),
        };

        if let Some(cb) = &self.on_reap {
            for instance in reaped {
                cb(instance).await;
            }
        }
        Ok(report)
    }

    /// Run sweeps until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(interval = ?self.config.sweep_interval, "heartbeat monitor starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    match self.sweep().await {
                        Ok(report) if !report.is_empty() => debug!(?report, "sweep"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "heartbeat sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Spawn the sweep loop on the runtime.
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        info!("heartbeat monitor started");
        MonitorHandle {
            handle,
            shutdown_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use faasgrid_scheduler::InstanceRegistry;
    use faasgrid_state::{InstanceStatus, WorkerStatus};

    fn pending(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            deployment_id: "dep-1".to_string(),
            function_name: "echo".to_string(),
            worker_id: String::new(),
            port: None,
            status: InstanceStatus::Pending,
            memory_mb: 128,
            started_at: 0,
            last_accessed: 0,
            updated_at: 0,
        }
    }

    /// One worker whose last heartbeat was `age_ms` ago, with a RUNNING instance.
    fn seeded(age_ms: u64) -> (StateStore, String) {
        let state = StateStore::open_in_memory().unwrap();
        let worker = state
            .record_heartbeat(
                "host-a",
                "127.0.0.1",
                7070,
                1024,
                1024,
                epoch_millis().saturating_sub(age_ms),
            )
            .unwrap();
        state
            .place_instance(pending("i-1"), |ws, _| ws.first().map(|w| w.id.clone()))
            .unwrap()
            .unwrap();
        state.mark_instance_ready("i-1", 9001, epoch_millis()).unwrap();
        (state, worker.id)
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            sweep_interval: Duration::from_millis(20),
            staleness: Duration::from_secs(15),
            idle_after: Duration::from_secs(300),
            error_retention: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn stale_worker_goes_offline_and_stops_leasing() {
        let (state, worker_id) = seeded(20_000);
        let registry = InstanceRegistry::new(state.clone());
        let monitor = HeartbeatMonitor::new(state.clone(), config());

        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.offline_workers, vec![worker_id.clone()]);
        assert_eq!(
            state.get_worker(&worker_id).unwrap().unwrap().status,
            WorkerStatus::Offline
        );
        // Instance survives but is no longer leaseable.
        assert_eq!(
            state.get_instance("i-1").unwrap().unwrap().status,
            InstanceStatus::Running
        );
        assert!(registry.lease("dep-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_worker_stays_online() {
        let (state, worker_id) = seeded(1_000);
        let monitor = HeartbeatMonitor::new(state.clone(), config());

        let report = monitor.sweep().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(
            state.get_worker(&worker_id).unwrap().unwrap().status,
            WorkerStatus::Online
        );
    }

    #[tokio::test]
    async fn untouched_instances_become_idle_but_stay_leaseable() {
        let (state, _) = seeded(0);
        let mut cfg = config();
        cfg.idle_after = Duration::ZERO;
        let monitor = HeartbeatMonitor::new(state.clone(), cfg);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.idled_instances, vec!["i-1".to_string()]);
        let leased = InstanceRegistry::new(state).lease("dep-1").unwrap();
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn failed_instances_are_reaped_with_callback() {
        let (state, _) = seeded(0);
        state.mark_instance_error("i-1", 0).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let monitor = HeartbeatMonitor::new(state.clone(), config()).with_reap_callback(Arc::new(
            move |_instance: Instance| -> BoxFuture {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            },
        ));

        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.reaped_instances, vec!["i-1".to_string()]);
        assert!(state.get_instance("i-1").unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_loop_sweeps_and_stops() {
        let (state, worker_id) = seeded(20_000);
        let handle = HeartbeatMonitor::new(state.clone(), config()).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert_eq!(
            state.get_worker(&worker_id).unwrap().unwrap().status,
            WorkerStatus::Offline
        );
    }
}
