//! Instance Registry: the single writer of instance status.
//!
//! `lease` is a read of one store snapshot; every transition is a single
//! write transaction in the store, so concurrent dispatches and the
//! heartbeat monitor never race a stale status.

use tracing::{debug, info, warn};

use faasgrid_core::epoch_millis;
use faasgrid_state::{
    Instance, InstanceEndpoint, InstanceStatus, PlacedInstance, ReadyOutcome, StateError,
    StateStore, WorkerStatus,
};

use crate::error::{SchedulerError, SchedulerResult};

/// Warm-instance affinity: among leaseable candidates, the most recently
/// accessed one wins.
///
/// A candidate is leaseable when it is RUNNING or IDLE, bound to a port,
/// and its worker is ONLINE.
pub fn select_warm(candidates: Vec<PlacedInstance>) -> Option<InstanceEndpoint> {
    candidates
        .into_iter()
        .filter(|p| p.instance.status.is_warm())
        .filter(|p| p.worker.status == WorkerStatus::Online)
        .filter_map(|p| {
            let address = p.instance.address_on(&p.worker)?;
            Some(InstanceEndpoint {
                instance: p.instance,
                address,
            })
        })
        .max_by_key(|e| e.instance.last_accessed)
}

/// Tracks execution instances per deployment.
#[derive(Clone)]
pub struct InstanceRegistry {
    state: StateStore,
}

impl InstanceRegistry {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// A usable instance for the deployment, or `None` to trigger a cold start.
    pub fn lease(&self, deployment_id: &str) -> SchedulerResult<Option<InstanceEndpoint>> {
        let leased = select_warm(self.state.placed_instances(deployment_id)?);
        if let Some(endpoint) = &leased {
            debug!(
                %deployment_id,
                instance_id = %endpoint.instance.id,
                address = %endpoint.address,
                "leased warm instance"
            );
        }
        Ok(leased)
    }

    /// PENDING → RUNNING on `port`. A signal for an instance that already
    /// left PENDING is reported as [`ReadyOutcome::Ignored`].
    pub fn mark_ready(&self, instance_id: &str, port: u16) -> SchedulerResult<ReadyOutcome> {
        if port == 0 {
            return Err(SchedulerError::InvalidRegistration(
                "port must be non-zero".to_string(),
            ));
        }
        let outcome = match self.state.mark_instance_ready(instance_id, port, epoch_millis()) {
            Ok(outcome) => outcome,
            Err(StateError::NotFound(_)) => {
                return Err(SchedulerError::UnknownInstance(instance_id.to_string()));
            }
            Err(StateError::Conflict(msg)) => {
                return Err(SchedulerError::InvalidRegistration(msg));
            }
            Err(e) => return Err(e.into()),
        };
        match &outcome {
            ReadyOutcome::Registered(instance) => info!(
                %instance_id,
                port,
                worker_id = %instance.worker_id,
                "instance running"
            ),
            ReadyOutcome::Ignored(instance) => warn!(
                %instance_id,
                port,
                status = ?instance.status,
                "late readiness signal ignored"
            ),
        }
        Ok(outcome)
    }

    /// Take an instance out of rotation and release its memory.
    pub fn mark_error(&self, instance_id: &str) -> SchedulerResult<Option<Instance>> {
        let instance = self.state.mark_instance_error(instance_id, epoch_millis())?;
        if let Some(i) = &instance {
            warn!(%instance_id, worker_id = %i.worker_id, "instance marked error");
        }
        Ok(instance)
    }

    /// Record a dispatch to the instance.
    pub fn touch(&self, instance_id: &str) -> SchedulerResult<()> {
        if !self.state.touch_instance(instance_id, epoch_millis())? {
            debug!(%instance_id, "touch for unknown instance");
        }
        Ok(())
    }

    pub fn get(&self, instance_id: &str) -> SchedulerResult<Option<Instance>> {
        Ok(self.state.get_instance(instance_id)?)
    }

    pub fn list_for_function(&self, function_name: &str) -> SchedulerResult<Vec<Instance>> {
        Ok(self.state.list_instances_for_function(function_name)?)
    }

    /// Count of instances per status, for logging.
    pub fn count_by_status(&self, status: InstanceStatus) -> SchedulerResult<usize> {
        Ok(self
            .state
            .list_instances()?
            .iter()
            .filter(|i| i.status == status)
            .count())
    }
}
