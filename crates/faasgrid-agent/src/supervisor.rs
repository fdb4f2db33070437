//! Executor supervisor: owns the executor child processes on this host.
//!
//! Memory is accounted per instance from the launch request and returned
//! when the child is stopped or observed to have exited.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use faasgrid_core::config::ExecutorConfig;
use faasgrid_scheduler::LaunchRequest;

use crate::error::{AgentError, AgentResult};

/// File name of the unpacked code snapshot inside an instance directory.
pub const MODULE_FILE: &str = "module.wasm";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executor_bin: PathBuf,
    pub work_dir: PathBuf,
    pub max_memory_mb: u32,
}

struct ManagedInstance {
    child: Child,
    function_name: String,
    memory_mb: u32,
    dir: PathBuf,
}

/// Summary of a supervised instance.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub function_name: String,
    pub memory_mb: u32,
    pub pid: Option<u32>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    instances: Mutex<HashMap<String, ManagedInstance>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_memory_mb(&self) -> u32 {
        self.config.max_memory_mb
    }

    /// Memory not reserved by a running executor.
    pub async fn available_memory_mb(&self) -> u32 {
        let instances = self.instances.lock().await;
        available(self.config.max_memory_mb, &instances)
    }

    /// Unpack the code snapshot and start an executor for it.
    pub async fn launch(&self, request: &LaunchRequest) -> AgentResult<()> {
        let mut instances = self.instances.lock().await;
        if instances.contains_key(&request.instance_id) {
            return Err(AgentError::AlreadyRunning(request.instance_id.clone()));
        }
        let available_mb = available(self.config.max_memory_mb, &instances);
        if request.memory_mb > available_mb {
            return Err(AgentError::InsufficientMemory {
                requested_mb: request.memory_mb,
                available_mb,
            });
        }

        let code = request
            .decode_code()
            .map_err(|e| AgentError::InvalidCode(e.to_string()))?;
        let dir = self.config.work_dir.join(&request.instance_id);
        tokio::fs::create_dir_all(&dir).await?;
        let code_path = dir.join(MODULE_FILE);
        tokio::fs::write(&code_path, &code).await?;

        let executor = ExecutorConfig {
            code_path,
            entry_point: request.entry_point.clone(),
            port: 0,
            instance_id: request.instance_id.clone(),
            control_plane_url: request.control_plane_url.clone(),
            memory_mb: request.memory_mb,
            timeout_seconds: request.timeout_seconds,
        };

        let child = Command::new(&self.config.executor_bin)
            .args(executor.to_args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Spawn(format!("{}: {e}", self.config.executor_bin.display()))
            })?;

        info!(
            instance_id = %request.instance_id,
            function = %request.function_name,
            deployment_id = %request.deployment_id,
            memory_mb = request.memory_mb,
            pid = ?child.id(),
            "executor launched"
        );

        instances.insert(
            request.instance_id.clone(),
            ManagedInstance {
                child,
                function_name: request.function_name.clone(),
                memory_mb: request.memory_mb,
                dir,
            },
        );
        Ok(())
    }

    /// Kill an executor and free its memory.
    pub async fn stop(&self, instance_id: &str) -> AgentResult<()> {
        let managed = self
            .instances
            .lock()
            .await
            .remove(instance_id)
            .ok_or_else(|| AgentError::UnknownInstance(instance_id.to_string()))?;
        terminate(instance_id, managed).await;
        Ok(())
    }

    /// Stop every executor.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.instances.lock().await.drain().collect();
        let count = drained.len();
        for (instance_id, managed) in drained {
            terminate(&instance_id, managed).await;
        }
        count
    }

    /// Forget executors that exited on their own.
    pub async fn reap(&self) -> Vec<String> {
        let mut instances = self.instances.lock().await;
        let mut exited = Vec::new();
        for (instance_id, managed) in instances.iter_mut() {
            match managed.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(%instance_id, %status, "executor exited");
                    exited.push(instance_id.clone());
                }
                Ok(None) => {}
                Err(e) => warn!(%instance_id, error = %e, "failed to poll executor"),
            }
        }
        for instance_id in &exited {
            if let Some(managed) = instances.remove(instance_id) {
                remove_dir(instance_id, &managed.dir).await;
            }
        }
        exited
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.lock().await;
        let mut list: Vec<_> = instances
            .iter()
            .map(|(id, managed)| InstanceSummary {
                instance_id: id.clone(),
                function_name: managed.function_name.clone(),
                memory_mb: managed.memory_mb,
                pid: managed.child.id(),
            })
            .collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    /// Reap exited executors every `interval` until shutdown.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let exited = self.reap().await;
                    if !exited.is_empty() {
                        debug!(count = exited.len(), "reaped executors");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }
}

fn available(max_memory_mb: u32, instances: &HashMap<String, ManagedInstance>) -> u32 {
    let used: u32 = instances.values().map(|m| m.memory_mb).sum();
    max_memory_mb.saturating_sub(used)
}

async fn terminate(instance_id: &str, mut managed: ManagedInstance) {
    if let Err(e) = managed.child.kill().await {
        warn!(%instance_id, error = %e, "failed to kill executor");
    }
    info!(%instance_id, memory_mb = managed.memory_mb, "executor stopped");
    remove_dir(instance_id, &managed.dir).await;
}

async fn remove_dir(instance_id: &str, dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!(%instance_id, error = %e, "failed to remove instance directory");
    }
}
