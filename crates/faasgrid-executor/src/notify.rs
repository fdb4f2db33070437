//! Readiness callback to the control plane.

use std::time::Duration;

use tracing::{info, warn};

use faasgrid_core::http;

use crate::error::{ExecutorError, ExecutorResult};

const ATTEMPTS: u32 = 5;
const FIRST_BACKOFF: Duration = Duration::from_millis(200);

/// Report `{instance_id, port}` to `/runtime/instance_ready`.
///
/// Connection failures and 5xx answers are retried with doubling backoff.
/// A 4xx answer is final: the control plane does not know this instance.
pub async fn notify_ready(
    control_plane_url: &str,
    instance_id: &str,
    port: u16,
) -> ExecutorResult<()> {
    let url = format!(
        "{}/runtime/instance_ready",
        control_plane_url.trim_end_matches('/')
    );
    let payload = serde_json::json!({ "instance_id": instance_id, "port": port });

    let mut backoff = FIRST_BACKOFF;
    let mut last_error = String::new();
    for attempt in 1..=ATTEMPTS {
        match http::post_json(&url, &payload).await {
            Ok(resp) if resp.is_success() => {
                info!(%instance_id, port, "readiness acknowledged");
                return Ok(());
            }
            Ok(resp) if resp.status < 500 => {
                return Err(ExecutorError::Readiness(format!(
                    "control plane rejected readiness with {}: {}",
                    resp.status,
                    String::from_utf8_lossy(&resp.body)
                )));
            }
            Ok(resp) => last_error = format!("status {}", resp.status),
            Err(e) => last_error = e.to_string(),
        }
        warn!(%instance_id, attempt, error = %last_error, "readiness signal not delivered");
        if attempt < ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    Err(ExecutorError::Readiness(last_error))
}
