//! faasgrid-core: shared building blocks for the faasgrid control plane,
//! worker agent, and instance executor.
//!
//! - [`config`]: `faasgrid.toml` parsing and the per-process config records
//! - [`duration`]: `"5s"` / `"500ms"` / `"2m"` duration strings
//! - [`http`]: a minimal hyper HTTP/1 client used for every outbound call
//!   (launch requests, proxied invocations, heartbeats, readiness callbacks)

pub mod config;
pub mod duration;
pub mod http;

pub use config::{AgentConfig, ControlPlaneConfig, ExecutorConfig, FaasgridConfig};
pub use duration::parse_duration;
pub use crate::http::{HttpError, HttpResponse};

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
