//! Heartbeat client: registers this host with the control plane and
//! keeps it ONLINE.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use faasgrid_core::http;
use faasgrid_scheduler::HeartbeatReport;

use crate::error::{AgentError, AgentResult};
use crate::supervisor::Supervisor;

#[derive(Debug, Deserialize)]
struct HeartbeatAck {
    worker_id: String,
}

/// Identity reported in every heartbeat.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub hostname: String,
    pub ip_address: String,
    pub agent_port: u16,
}

pub struct HeartbeatClient {
    control_plane_url: String,
    identity: HostIdentity,
    supervisor: Arc<Supervisor>,
    worker_id: Option<String>,
}

impl HeartbeatClient {
    pub fn new(control_plane_url: &str, identity: HostIdentity, supervisor: Arc<Supervisor>) -> Self {
        Self {
            control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
            identity,
            supervisor,
            worker_id: None,
        }
    }

    /// ID assigned by the control plane, once a heartbeat was acknowledged.
    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// Send one heartbeat with the current free memory.
    pub async fn send(&mut self) -> AgentResult<String> {
        let report = HeartbeatReport {
            hostname: self.identity.hostname.clone(),
            ip_address: self.identity.ip_address.clone(),
            agent_port: self.identity.agent_port,
            max_memory_mb: self.supervisor.max_memory_mb(),
            available_memory_mb: self.supervisor.available_memory_mb().await,
        };
        let url = format!("{}/runtime/heartbeat", self.control_plane_url);
        let resp = http::post_json(&url, &report)
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        if !resp.is_success() {
            return Err(AgentError::ControlPlane(format!(
                "heartbeat rejected with {}: {}",
                resp.status,
                String::from_utf8_lossy(&resp.body)
            )));
        }
        let ack: HeartbeatAck = resp
            .json()
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;

        if self.worker_id.as_deref() != Some(ack.worker_id.as_str()) {
            info!(worker_id = %ack.worker_id, hostname = %self.identity.hostname, "registered with control plane");
            self.worker_id = Some(ack.worker_id.clone());
        }
        debug!(worker_id = %ack.worker_id, available_mb = report.available_memory_mb, "heartbeat sent");
        Ok(ack.worker_id)
    }

    /// Ask the control plane to stop placing instances here.
    pub async fn drain(&self) -> AgentResult<()> {
        let Some(worker_id) = &self.worker_id else {
            return Ok(());
        };
        let url = format!("{}/runtime/drain", self.control_plane_url);
        let resp = http::post_json(&url, &serde_json::json!({ "worker_id": worker_id }))
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        if !resp.is_success() {
            return Err(AgentError::ControlPlane(format!("drain rejected with {}", resp.status)));
        }
        info!(%worker_id, "worker draining");
        Ok(())
    }

    /// Heartbeat immediately, then every `interval` until shutdown.
    /// Drains the worker on the way out.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?interval, "heartbeat loop started");
        if let Err(e) = self.send().await {
            warn!(error = %e, "heartbeat failed");
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.send().await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    break;
                }
            }
        }
        if let Err(e) = self.drain().await {
            warn!(error = %e, "drain failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;
    use crate::supervisor::SupervisorConfig;

    type Seen = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn control_plane() -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/runtime/heartbeat",
                post(|State(seen): State<Seen>, Json(body): Json<serde_json::Value>| async move {
                    seen.lock().unwrap().push(("heartbeat".to_string(), body));
                    Json(serde_json::json!({ "worker_id": "w-1" }))
                }),
            )
            .route(
                "/runtime/drain",
                post(|State(seen): State<Seen>, Json(body): Json<serde_json::Value>| async move {
                    seen.lock().unwrap().push(("drain".to_string(), body));
                    Json(serde_json::json!({ "status": "draining" }))
                }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    fn client(url: &str) -> HeartbeatClient {
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            executor_bin: "faasgrid-executor".into(),
            work_dir: std::env::temp_dir(),
            max_memory_mb: 512,
        }));
        HeartbeatClient::new(
            url,
            HostIdentity {
                hostname: "host-a".to_string(),
                ip_address: "127.0.0.1".to_string(),
                agent_port: 7070,
            },
            supervisor,
        )
    }

    #[tokio::test]
    async fn heartbeat_reports_capacity_and_learns_worker_id() {
        let (url, seen) = control_plane().await;
        let mut client = client(&url);
        assert_eq!(client.send().await.unwrap(), "w-1");
        assert_eq!(client.worker_id(), Some("w-1"));

        let seen = seen.lock().unwrap();
        let (_, body) = &seen[0];
        assert_eq!(body["hostname"], "host-a");
        assert_eq!(body["max_memory_mb"], 512);
        assert_eq!(body["available_memory_mb"], 512);
    }

    #[tokio::test]
    async fn loop_drains_on_shutdown() {
        let (url, seen) = control_plane().await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(client(&url).run(Duration::from_millis(20), rx));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().filter(|(kind, _)| kind == "heartbeat").count() >= 2);
        let (kind, body) = seen.last().unwrap();
        assert_eq!(kind, "drain");
        assert_eq!(body["worker_id"], "w-1");
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_an_error() {
        let mut client = client("http://127.0.0.1:1");
        assert!(matches!(
            client.send().await.unwrap_err(),
            AgentError::ControlPlane(_)
        ));
        assert!(client.worker_id().is_none());
    }
}
