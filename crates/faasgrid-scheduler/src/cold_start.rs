//! Cold-start scheduler: provisions a new instance when no warm one exists.
//!
//! ```text
//! provision(deployment)
//!   ├── live in-flight entry for deployment? ── yes ──► wait on its outcome
//!   ├── warm instance appeared since the caller's miss? ── yes ──► use it
//!   └── no: spawn provisioning task, register entry
//!         ├── place_instance (reserve memory + PENDING row, one txn)
//!         ├── readiness.register(instance_id)
//!         ├── launcher.launch(worker, request)   ┐ both bounded by one
//!         ├── wait for readiness                 ┘ provisioning deadline
//!         │     ├── ready  → RUNNING instance
//!         │     └── expired → abandon (ERROR + release) → ColdStartTimeout
//!         └── remove entry, publish outcome to every waiter
//! ```
//!
//! The provisioning task is detached from the request that started it, so a
//! caller that goes away cannot leave a reservation or an in-flight entry
//! behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use faasgrid_core::{ControlPlaneConfig, epoch_millis};
use faasgrid_state::{
    AbandonOutcome, ActiveDeployment, DeploymentId, Instance, InstanceEndpoint, InstanceStatus,
    PlacedInstance, ReadyOutcome, StateStore, WorkerHost,
};

use crate::error::{ProvisionError, SchedulerResult};
use crate::instances::InstanceRegistry;
use crate::launcher::{InstanceLauncher, LaunchRequest};
use crate::placement;
use crate::readiness::ReadinessBoard;

type ProvisionOutcome = Result<InstanceEndpoint, ProvisionError>;

/// Cold-start tuning.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Provisioning deadline = factor × function timeout.
    pub timeout_factor: u32,
    /// Handed to executors for their readiness callback.
    pub control_plane_url: Option<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            timeout_factor: 2,
            control_plane_url: None,
        }
    }
}

impl ProvisionConfig {
    pub fn from_control_plane(config: &ControlPlaneConfig) -> Self {
        Self {
            timeout_factor: config.provisioning_timeout_factor,
            control_plane_url: Some(config.advertise_url.clone()),
        }
    }

    /// How long a cold start may take, launch included.
    pub fn provisioning_timeout(&self, timeout_seconds: u32) -> Duration {
        Duration::from_secs(u64::from(timeout_seconds.max(1)) * u64::from(self.timeout_factor.max(1)))
    }
}

/// Provisions instances on a miss, coalescing concurrent requests per deployment.
pub struct ColdStartScheduler {
    state: StateStore,
    registry: InstanceRegistry,
    launcher: Arc<dyn InstanceLauncher>,
    readiness: ReadinessBoard,
    config: ProvisionConfig,
    in_flight: Mutex<HashMap<DeploymentId, watch::Receiver<Option<ProvisionOutcome>>>>,
}

impl ColdStartScheduler {
    pub fn new(
        state: StateStore,
        launcher: Arc<dyn InstanceLauncher>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            registry: InstanceRegistry::new(state.clone()),
            state,
            launcher,
            readiness: ReadinessBoard::new(),
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Provision an instance for the deployment, or join the one already
    /// being provisioned. Every concurrent caller gets the same outcome.
    pub async fn provision(
        self: &Arc<Self>,
        target: &ActiveDeployment,
    ) -> Result<InstanceEndpoint, ProvisionError> {
        let deployment_id = target.deployment.id.clone();
        let mut rx = {
            let mut in_flight = self.in_flight.lock().await;
            // A closed sender means the provisioning task died without
            // publishing; its entry is replaced rather than joined.
            match in_flight.get(&deployment_id) {
                Some(rx) if rx.has_changed().is_ok() => {
                    debug!(%deployment_id, "joining in-flight cold start");
                    rx.clone()
                }
                _ => {
                    // The caller's lease miss may predate a cold start that
                    // finished since. Re-check under the lock.
                    if let Some(endpoint) = self
                        .registry
                        .lease(&deployment_id)
                        .map_err(|e| ProvisionError::Internal(e.to_string()))?
                    {
                        in_flight.remove(&deployment_id);
                        debug!(%deployment_id, "warm instance appeared before cold start");
                        return Ok(endpoint);
                    }
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(deployment_id.clone(), rx.clone());
                    let this = Arc::clone(self);
                    let target = target.clone();
                    tokio::spawn(async move {
                        let outcome = this.provision_once(&target).await;
                        // Drop the entry first so a caller arriving after this
                        // point starts a fresh cold start instead of reusing
                        // a failure.
                        this.in_flight.lock().await.remove(&target.deployment.id);
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| ProvisionError::Internal("provisioning task ended".to_string()))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(ProvisionError::Internal("empty provisioning outcome".to_string())),
        }
    }

    /// Deliver an executor's readiness signal.
    ///
    /// Moves the instance to RUNNING and wakes its cold start. Signals for
    /// instances that already left PENDING are ignored.
    pub async fn signal_ready(&self, instance_id: &str, port: u16) -> SchedulerResult<ReadyOutcome> {
        let outcome = self.registry.mark_ready(instance_id, port)?;
        if let ReadyOutcome::Registered(_) = &outcome {
            if !self.readiness.notify(instance_id, port).await {
                debug!(%instance_id, "ready instance had no waiting cold start");
            }
        }
        Ok(outcome)
    }

    /// Number of deployments with a cold start in flight.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn provision_once(&self, target: &ActiveDeployment) -> ProvisionOutcome {
        let started = Instant::now();
        let wait = self.config.provisioning_timeout(target.function.timeout_seconds);
        let deadline = started + wait;
        let function = &target.function;
        let deployment_id = &target.deployment.id;
        let now = epoch_millis();

        let template = Instance {
            id: uuid::Uuid::new_v4().to_string(),
            deployment_id: deployment_id.clone(),
            function_name: function.name.clone(),
            worker_id: String::new(),
            port: None,
            status: InstanceStatus::Pending,
            memory_mb: function.memory_mb,
            started_at: now,
            last_accessed: now,
            updated_at: now,
        };
        let Some(PlacedInstance { instance, worker }) =
            self.state.place_instance(template, placement::best_fit)?
        else {
            warn!(
                %deployment_id,
                memory_mb = function.memory_mb,
                "no worker has capacity for cold start"
            );
            return Err(ProvisionError::NoCapacity {
                memory_mb: function.memory_mb,
            });
        };
        info!(
            %deployment_id,
            instance_id = %instance.id,
            worker_id = %worker.id,
            memory_mb = instance.memory_mb,
            "cold start: instance placed"
        );

        let ready_rx = self.readiness.register(&instance.id).await;
        let request =
            LaunchRequest::for_instance(&instance.id, target, self.config.control_plane_url.clone());
        match tokio::time::timeout_at(deadline, self.launcher.launch(&worker, request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(instance_id = %instance.id, worker_id = %worker.id, error = %e, "launch failed");
                self.readiness.forget(&instance.id).await;
                self.give_up(&instance, &worker).await;
                return Err(ProvisionError::LaunchFailed {
                    worker_id: worker.id.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(instance_id = %instance.id, worker_id = %worker.id, "launch still unanswered at deadline");
                return self.expire(&instance, &worker, wait).await;
            }
        }

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(port)) => {
                info!(
                    instance_id = %instance.id,
                    port,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cold start complete"
                );
                self.endpoint_for(&instance.id, &worker)
            }
            _ => self.expire(&instance, &worker, wait).await,
        }
    }

    /// The provisioning deadline passed: abandon the instance unless its
    /// readiness landed in the meantime.
    async fn expire(
        &self,
        instance: &Instance,
        worker: &WorkerHost,
        wait: Duration,
    ) -> ProvisionOutcome {
        self.readiness.forget(&instance.id).await;
        match self.state.abandon_pending_instance(&instance.id, epoch_millis())? {
            AbandonOutcome::AlreadyReady(ready) => {
                debug!(instance_id = %ready.id, "readiness won the race with the timeout");
                self.endpoint_for(&ready.id, worker)
            }
            outcome => {
                if matches!(outcome, AbandonOutcome::Abandoned(_)) {
                    self.stop_detached(worker, &instance.id);
                }
                warn!(
                    instance_id = %instance.id,
                    waited_ms = wait.as_millis() as u64,
                    "cold start timed out, reservation released"
                );
                Err(ProvisionError::ColdStartTimeout {
                    instance_id: instance.id.clone(),
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    fn endpoint_for(&self, instance_id: &str, worker: &WorkerHost) -> ProvisionOutcome {
        let instance = self
            .state
            .get_instance(instance_id)?
            .ok_or_else(|| ProvisionError::Internal(format!("instance {instance_id} vanished")))?;
        let address = instance
            .address_on(worker)
            .ok_or_else(|| ProvisionError::Internal(format!("instance {instance_id} has no port")))?;
        Ok(InstanceEndpoint { instance, address })
    }

    /// Fail a placed instance and release its memory.
    async fn give_up(&self, instance: &Instance, worker: &WorkerHost) {
        match self.state.abandon_pending_instance(&instance.id, epoch_millis()) {
            Ok(AbandonOutcome::Abandoned(_)) => self.stop_detached(worker, &instance.id),
            Ok(_) => {}
            Err(e) => error!(
                instance_id = %instance.id,
                error = %e,
                "failed to release reservation for abandoned instance"
            ),
        }
    }

    /// Ask the worker to stop an executor we gave up on, without waiting.
    fn stop_detached(&self, worker: &WorkerHost, instance_id: &str) {
        let launcher = Arc::clone(&self.launcher);
        let worker = worker.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = launcher.stop(&worker, &instance_id).await {
                debug!(%instance_id, error = %e, "stop of abandoned instance failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::launcher::{BoxFuture, LaunchError};
    use faasgrid_state::{Deployment, Function};

    /// What the fake worker does after accepting a launch.
    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Report readiness on the given port after a short delay.
        ReadyAfter(Duration, u16),
        /// Accept and never report.
        Silent,
        /// Refuse the launch.
        Refuse,
        /// Take this long to answer the launch, then accept without reporting.
        SlowAccept(Duration),
        /// Panic on the first launch, then behave like `ReadyAfter`.
        PanicThenReady(Duration, u16),
    }

    struct FakeLauncher {
        behaviour: Behaviour,
        scheduler: std::sync::OnceLock<std::sync::Weak<ColdStartScheduler>>,
        launches: AtomicUsize,
        stops: AtomicUsize,
    }

    impl FakeLauncher {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                scheduler: std::sync::OnceLock::new(),
                launches: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl InstanceLauncher for FakeLauncher {
        fn launch<'a>(
            &'a self,
            _worker: &'a WorkerHost,
            request: LaunchRequest,
        ) -> BoxFuture<'a, Result<(), LaunchError>> {
            Box::pin(async move {
                let attempt = self.launches.fetch_add(1, Ordering::SeqCst);
                let behaviour = match self.behaviour {
                    Behaviour::PanicThenReady(_, _) if attempt == 0 => {
                        panic!("worker agent blew up")
                    }
                    Behaviour::PanicThenReady(delay, port) => Behaviour::ReadyAfter(delay, port),
                    other => other,
                };
                match behaviour {
                    Behaviour::Refuse => Err(LaunchError::Rejected {
                        status: 503,
                        body: "full".to_string(),
                    }),
                    Behaviour::Silent => Ok(()),
                    Behaviour::SlowAccept(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    }
                    Behaviour::PanicThenReady(_, _) => unreachable!(),
                    Behaviour::ReadyAfter(delay, port) => {
                        let scheduler = self.scheduler.get().and_then(|w| w.upgrade());
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Some(s) = scheduler {
                                s.signal_ready(&request.instance_id, port).await.unwrap();
                            }
                        });
                        Ok(())
                    }
                }
            })
        }

        fn stop<'a>(
            &'a self,
            _worker: &'a WorkerHost,
            _instance_id: &'a str,
        ) -> BoxFuture<'a, Result<(), LaunchError>> {
            Box::pin(async move {
                self.stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn target(timeout_seconds: u32) -> ActiveDeployment {
        ActiveDeployment {
            function: Function {
                id: "fn-1".to_string(),
                name: "echo".to_string(),
                description: String::new(),
                entry_point: "handle".to_string(),
                memory_mb: 256,
                timeout_seconds,
                is_active: true,
                created_at: 0,
                updated_at: 0,
            },
            deployment: Deployment {
                id: "dep-1".to_string(),
                function_name: "echo".to_string(),
                version: 1,
                comment: String::new(),
                code_snapshot: Vec::new(),
                requirements_snapshot: String::new(),
                entry_point_snapshot: "handle".to_string(),
                is_active: true,
                created_at: 0,
            },
        }
    }

    fn setup(behaviour: Behaviour, factor: u32) -> (Arc<ColdStartScheduler>, Arc<FakeLauncher>, StateStore, String) {
        let state = StateStore::open_in_memory().unwrap();
        let worker = state
            .record_heartbeat("host-a", "127.0.0.1", 7070, 1024, 1024, epoch_millis())
            .unwrap();
        let launcher = FakeLauncher::new(behaviour);
        let config = ProvisionConfig {
            timeout_factor: factor,
            control_plane_url: None,
        };
        let scheduler = Arc::new(ColdStartScheduler::new(
            state.clone(),
            launcher.clone(),
            config,
        ));
        let _ = launcher.scheduler.set(Arc::downgrade(&scheduler));
        (scheduler, launcher, state, worker.id)
    }

    fn available(state: &StateStore, worker_id: &str) -> u32 {
        state.get_worker(worker_id).unwrap().unwrap().available_memory_mb
    }

    #[test]
    fn provisioning_timeout_scales_with_function_timeout() {
        let config = ProvisionConfig::default();
        assert_eq!(config.provisioning_timeout(30), Duration::from_secs(60));
        assert_eq!(config.provisioning_timeout(0), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn provision_returns_running_instance() {
        let (scheduler, launcher, state, worker_id) =
            setup(Behaviour::ReadyAfter(Duration::from_millis(20), 9001), 2);

        let endpoint = scheduler.provision(&target(5)).await.unwrap();

        assert_eq!(endpoint.address, "127.0.0.1:9001");
        assert_eq!(endpoint.instance.status, InstanceStatus::Running);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(available(&state, &worker_id), 768);
        assert_eq!(scheduler.in_flight().await, 0);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_provision() {
        let (scheduler, launcher, _state, _) =
            setup(Behaviour::ReadyAfter(Duration::from_millis(100), 9001), 2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move { scheduler.provision(&target(5)).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().instance.id);
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn timeout_releases_memory_and_fails_instance() {
        let (scheduler, launcher, state, worker_id) = setup(Behaviour::Silent, 1);

        let err = scheduler.provision(&target(1)).await.unwrap_err();

        assert!(matches!(err, ProvisionError::ColdStartTimeout { .. }));
        assert_eq!(available(&state, &worker_id), 1024);
        let instances = state.list_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Error);
        assert_eq!(scheduler.in_flight().await, 0);

        // The stop request is detached; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_readiness_after_timeout_is_a_noop() {
        let (scheduler, _launcher, state, worker_id) = setup(Behaviour::Silent, 1);
        scheduler.provision(&target(1)).await.unwrap_err();
        let instance_id = state.list_instances().unwrap()[0].id.clone();

        let outcome = scheduler.signal_ready(&instance_id, 9001).await.unwrap();

        assert!(matches!(outcome, ReadyOutcome::Ignored(_)));
        let instance = state.get_instance(&instance_id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        assert_eq!(instance.port, None);
        assert_eq!(available(&state, &worker_id), 1024);
    }

    #[tokio::test]
    async fn refused_launch_releases_memory() {
        let (scheduler, _launcher, state, worker_id) = setup(Behaviour::Refuse, 2);

        let err = scheduler.provision(&target(5)).await.unwrap_err();

        assert!(matches!(err, ProvisionError::LaunchFailed { .. }));
        assert_eq!(available(&state, &worker_id), 1024);
    }

    #[tokio::test]
    async fn no_capacity_when_function_does_not_fit() {
        let (scheduler, launcher, _state, _) = setup(Behaviour::Silent, 1);
        let mut big = target(5);
        big.function.memory_mb = 4096;

        let err = scheduler.provision(&big).await.unwrap_err();

        assert_eq!(err, ProvisionError::NoCapacity { memory_mb: 4096 });
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_is_not_cached_for_later_callers() {
        let (scheduler, launcher, _state, _) = setup(Behaviour::Refuse, 1);

        scheduler.provision(&target(5)).await.unwrap_err();
        scheduler.provision(&target(5)).await.unwrap_err();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn miss_that_races_a_finished_cold_start_reuses_its_instance() {
        let (scheduler, launcher, state, worker_id) =
            setup(Behaviour::ReadyAfter(Duration::from_millis(20), 9001), 2);
        let registry = InstanceRegistry::new(state.clone());

        // Both dispatches miss while nothing is warm yet.
        assert!(registry.lease("dep-1").unwrap().is_none());
        assert!(registry.lease("dep-1").unwrap().is_none());

        // The first one provisions to completion before the second arrives.
        let first = scheduler.provision(&target(5)).await.unwrap();
        let second = scheduler.provision(&target(5)).await.unwrap();

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(first.instance.id, second.instance.id);
        assert_eq!(state.list_instances().unwrap().len(), 1);
        assert_eq!(available(&state, &worker_id), 768);
    }

    #[tokio::test]
    async fn slow_launch_counts_against_the_provisioning_deadline() {
        let (scheduler, launcher, state, worker_id) =
            setup(Behaviour::SlowAccept(Duration::from_secs(5)), 1);

        let started = Instant::now();
        let err = scheduler.provision(&target(1)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ProvisionError::ColdStartTimeout { .. }));
        assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "wait not bounded: {elapsed:?}");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(available(&state, &worker_id), 1024);
        assert_eq!(
            state.list_instances().unwrap()[0].status,
            InstanceStatus::Error
        );
    }

    #[tokio::test]
    async fn dead_provisioning_task_does_not_wedge_the_deployment() {
        let (scheduler, launcher, _state, _) =
            setup(Behaviour::PanicThenReady(Duration::from_millis(20), 9001), 2);

        let err = scheduler.provision(&target(5)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Internal(_)));
        assert_eq!(scheduler.in_flight().await, 1);

        let endpoint = scheduler.provision(&target(5)).await.unwrap();
        assert_eq!(endpoint.address, "127.0.0.1:9001");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.in_flight().await, 0);
    }
}
