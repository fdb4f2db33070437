//! Instance launcher: the call from the scheduler to a worker's
//! management surface.
//!
//! The scheduler only needs the worker to accept the launch; readiness
//! arrives separately through the readiness callback.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use faasgrid_core::http;
use faasgrid_state::{ActiveDeployment, WorkerHost};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("worker rejected launch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("launch timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything a worker needs to start an instance executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchRequest {
    pub instance_id: String,
    pub deployment_id: String,
    pub function_name: String,
    pub entry_point: String,
    /// Hex-encoded code snapshot.
    pub code_snapshot: String,
    #[serde(default)]
    pub requirements_snapshot: String,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    /// Where the executor sends its readiness signal.
    pub control_plane_url: Option<String>,
}

impl LaunchRequest {
    pub fn for_instance(
        instance_id: &str,
        target: &ActiveDeployment,
        control_plane_url: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            deployment_id: target.deployment.id.clone(),
            function_name: target.function.name.clone(),
            entry_point: target.deployment.entry_point_snapshot.clone(),
            code_snapshot: hex::encode(&target.deployment.code_snapshot),
            requirements_snapshot: target.deployment.requirements_snapshot.clone(),
            memory_mb: target.function.memory_mb,
            timeout_seconds: target.function.timeout_seconds,
            control_plane_url,
        }
    }

    pub fn decode_code(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.code_snapshot)
    }
}

/// Starts and stops instance executors on worker hosts.
pub trait InstanceLauncher: Send + Sync {
    /// Ask `worker` to start an executor. Resolves once the worker accepted.
    fn launch<'a>(
        &'a self,
        worker: &'a WorkerHost,
        request: LaunchRequest,
    ) -> BoxFuture<'a, Result<(), LaunchError>>;

    /// Ask `worker` to stop an executor. Best effort.
    fn stop<'a>(
        &'a self,
        worker: &'a WorkerHost,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<(), LaunchError>>;
}

/// Launches executors through the worker agent's HTTP surface.
pub struct HttpLauncher {
    timeout: Duration,
}

impl HttpLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn transport_err(e: http::HttpError) -> LaunchError {
    LaunchError::Unreachable(e.to_string())
}

impl InstanceLauncher for HttpLauncher {
    fn launch<'a>(
        &'a self,
        worker: &'a WorkerHost,
        request: LaunchRequest,
    ) -> BoxFuture<'a, Result<(), LaunchError>> {
        Box::pin(async move {
            let url = format!("{}/instances", worker.agent_url());
            debug!(%url, instance_id = %request.instance_id, "launching instance");
            let resp = tokio::time::timeout(self.timeout, http::post_json(&url, &request))
                .await
                .map_err(|_| LaunchError::Timeout(self.timeout))?
                .map_err(transport_err)?;
            if !resp.is_success() {
                return Err(LaunchError::Rejected {
                    status: resp.status,
                    body: String::from_utf8_lossy(&resp.body).into_owned(),
                });
            }
            Ok(())
        })
    }

    fn stop<'a>(
        &'a self,
        worker: &'a WorkerHost,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<(), LaunchError>> {
        Box::pin(async move {
            let url = format!("{}/instances/{instance_id}", worker.agent_url());
            let resp = tokio::time::timeout(self.timeout, http::delete(&url))
                .await
                .map_err(|_| LaunchError::Timeout(self.timeout))?
                .map_err(transport_err)?;
            // Already gone is fine.
            if !resp.is_success() && resp.status != 404 {
                return Err(LaunchError::Rejected {
                    status: resp.status,
                    body: String::from_utf8_lossy(&resp.body).into_owned(),
                });
            }
            Ok(())
        })
    }
}
