//! Worker Registry: the single writer of worker status and capacity.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use faasgrid_core::epoch_millis;
use faasgrid_state::{StateStore, WorkerHost, WorkerStatus};

use crate::error::{SchedulerError, SchedulerResult};

fn default_agent_port() -> u16 {
    7070
}

/// Liveness and capacity report sent by a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatReport {
    pub hostname: String,
    pub ip_address: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    pub max_memory_mb: u32,
    pub available_memory_mb: u32,
}

impl HeartbeatReport {
    fn validate(&self) -> SchedulerResult<()> {
        if self.hostname.trim().is_empty() {
            return Err(SchedulerError::InvalidRegistration(
                "hostname must not be empty".to_string(),
            ));
        }
        if self.ip_address.parse::<IpAddr>().is_err() {
            return Err(SchedulerError::InvalidRegistration(format!(
                "invalid ip_address {:?}",
                self.ip_address
            )));
        }
        if self.max_memory_mb == 0 {
            return Err(SchedulerError::InvalidRegistration(
                "max_memory_mb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks worker hosts, their capacity, and liveness.
#[derive(Clone)]
pub struct WorkerRegistry {
    state: StateStore,
}

impl WorkerRegistry {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Create-or-update a worker. Always leaves it ONLINE.
    pub fn report_heartbeat(&self, report: &HeartbeatReport) -> SchedulerResult<WorkerHost> {
        report.validate()?;
        let previous = self
            .state
            .list_workers()?
            .into_iter()
            .find(|w| w.hostname == report.hostname);
        let worker = self.state.record_heartbeat(
            &report.hostname,
            &report.ip_address,
            report.agent_port,
            report.max_memory_mb,
            report.available_memory_mb,
            epoch_millis(),
        )?;
        match previous.map(|w| w.status) {
            None => info!(
                worker_id = %worker.id,
                hostname = %worker.hostname,
                max_memory_mb = worker.max_memory_mb,
                "worker registered"
            ),
            Some(WorkerStatus::Online) => debug!(
                worker_id = %worker.id,
                available_memory_mb = worker.available_memory_mb,
                "heartbeat"
            ),
            Some(status) => info!(
                worker_id = %worker.id,
                from = ?status,
                "worker back online"
            ),
        }
        Ok(worker)
    }

    /// Stop placing new instances on a worker and stop leasing its instances.
    pub fn drain(&self, worker_id: &str) -> SchedulerResult<WorkerHost> {
        let worker = self
            .state
            .set_worker_status(worker_id, WorkerStatus::Draining)?
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.to_string()))?;
        info!(%worker_id, "worker draining");
        Ok(worker)
    }

    /// Mark workers silent for longer than `staleness` OFFLINE.
    pub fn mark_stale_offline(&self, staleness: Duration) -> SchedulerResult<Vec<WorkerHost>> {
        let changed = self
            .state
            .mark_stale_workers_offline(epoch_millis(), staleness.as_millis() as u64)?;
        for worker in &changed {
            warn!(
                worker_id = %worker.id,
                hostname = %worker.hostname,
                last_heartbeat = worker.last_heartbeat,
                "worker missed heartbeats, marked offline"
            );
        }
        Ok(changed)
    }

    pub fn get(&self, worker_id: &str) -> SchedulerResult<Option<WorkerHost>> {
        Ok(self.state.get_worker(worker_id)?)
    }

    pub fn list(&self) -> SchedulerResult<Vec<WorkerHost>> {
        Ok(self.state.list_workers()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(hostname: &str) -> HeartbeatReport {
        HeartbeatReport {
            hostname: hostname.to_string(),
            ip_address: "127.0.0.1".to_string(),
            agent_port: 7070,
            max_memory_mb: 1024,
            available_memory_mb: 1024,
        }
    }

    #[test]
    fn heartbeat_registers_and_reuses_id() {
        let registry = WorkerRegistry::new(StateStore::open_in_memory().unwrap());

        let first = registry.report_heartbeat(&report("host-a")).unwrap();
        let second = registry.report_heartbeat(&report("host-a")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn invalid_reports_are_rejected() {
        let registry = WorkerRegistry::new(StateStore::open_in_memory().unwrap());

        let mut bad = report(" ");
        assert!(matches!(
            registry.report_heartbeat(&bad),
            Err(SchedulerError::InvalidRegistration(_))
        ));

        bad = report("host-a");
        bad.ip_address = "not-an-ip".to_string();
        assert!(matches!(
            registry.report_heartbeat(&bad),
            Err(SchedulerError::InvalidRegistration(_))
        ));

        bad = report("host-a");
        bad.max_memory_mb = 0;
        assert!(registry.report_heartbeat(&bad).is_err());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn agent_port_defaults_when_missing() {
        let parsed: HeartbeatReport = serde_json::from_str(
            r#"{"hostname":"h","ip_address":"127.0.0.1","max_memory_mb":64,"available_memory_mb":64}"#,
        )
        .unwrap();
        assert_eq!(parsed.agent_port, 7070);
    }

    #[test]
    fn drain_then_heartbeat_restores_online() {
        let registry = WorkerRegistry::new(StateStore::open_in_memory().unwrap());
        let worker = registry.report_heartbeat(&report("host-a")).unwrap();

        let drained = registry.drain(&worker.id).unwrap();
        assert_eq!(drained.status, WorkerStatus::Draining);

        let back = registry.report_heartbeat(&report("host-a")).unwrap();
        assert_eq!(back.status, WorkerStatus::Online);
        assert!(matches!(
            registry.drain("ghost"),
            Err(SchedulerError::UnknownWorker(_))
        ));
    }

    #[test]
    fn fresh_workers_are_not_stale() {
        let registry = WorkerRegistry::new(StateStore::open_in_memory().unwrap());
        registry.report_heartbeat(&report("host-a")).unwrap();
        assert!(registry
            .mark_stale_offline(Duration::from_secs(15))
            .unwrap()
            .is_empty());
    }
}
