//! faasgrid.toml configuration parser.
//!
//! One file carries a `[control_plane]` and an `[agent]` section; every
//! field has a default so an empty file is a valid single-host setup.
//! Durations are strings ("5s", "500ms", "2m") validated at load time.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaasgridConfig {
    pub control_plane: ControlPlaneConfig,
    pub agent: AgentConfig,
}

impl FaasgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: FaasgridConfig = toml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.control_plane.validate()?;
        config.agent.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Control plane ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Address the HTTP surface binds to.
    pub listen: String,
    /// Base URL executors use for readiness callbacks.
    pub advertise_url: String,
    /// Directory holding the redb state file.
    pub data_dir: PathBuf,
    /// Added to a function's timeout to form the proxy deadline.
    pub proxy_buffer: String,
    /// Provisioning wait = factor × function timeout.
    pub provisioning_timeout_factor: u32,
    /// Deadline for the launch call to a worker agent.
    pub launch_timeout: String,
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: String,
    /// A worker is stale after factor × heartbeat interval.
    pub staleness_factor: u32,
    /// How often the heartbeat monitor sweeps.
    pub sweep_interval: String,
    /// RUNNING instances not accessed for this long become IDLE.
    pub idle_after: String,
    /// ERROR instances are deleted after this long.
    pub error_retention: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            advertise_url: "http://127.0.0.1:8000".to_string(),
            data_dir: PathBuf::from("/var/lib/faasgrid"),
            proxy_buffer: "5s".to_string(),
            provisioning_timeout_factor: 2,
            launch_timeout: "10s".to_string(),
            heartbeat_interval: "5s".to_string(),
            staleness_factor: 3,
            sweep_interval: "5s".to_string(),
            idle_after: "300s".to_string(),
            error_retention: "60s".to_string(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .with_context(|| format!("control_plane.listen: invalid address {:?}", self.listen))?;
        for (field, value) in [
            ("proxy_buffer", &self.proxy_buffer),
            ("launch_timeout", &self.launch_timeout),
            ("heartbeat_interval", &self.heartbeat_interval),
            ("sweep_interval", &self.sweep_interval),
            ("idle_after", &self.idle_after),
            ("error_retention", &self.error_retention),
        ] {
            if parse_duration(value).is_none() {
                bail!("control_plane.{field}: invalid duration {value:?}");
            }
        }
        if self.provisioning_timeout_factor == 0 {
            bail!("control_plane.provisioning_timeout_factor must be at least 1");
        }
        if self.staleness_factor == 0 {
            bail!("control_plane.staleness_factor must be at least 1");
        }
        Ok(())
    }

    pub fn proxy_buffer(&self) -> Duration {
        parse_duration(&self.proxy_buffer).unwrap_or(Duration::from_secs(5))
    }

    pub fn launch_timeout(&self) -> Duration {
        parse_duration(&self.launch_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(Duration::from_secs(5))
    }

    /// Heartbeat age after which a worker is considered OFFLINE.
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.staleness_factor
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn idle_after(&self) -> Duration {
        parse_duration(&self.idle_after).unwrap_or(Duration::from_secs(300))
    }

    pub fn error_retention(&self) -> Duration {
        parse_duration(&self.error_retention).unwrap_or(Duration::from_secs(60))
    }
}

// ── Worker agent ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub control_plane_url: String,
    pub hostname: String,
    /// Address the control plane and dispatcher use to reach this host.
    pub ip_address: String,
    /// Address the management surface binds to.
    pub listen: String,
    pub max_memory_mb: u32,
    pub heartbeat_interval: String,
    /// Path of the `faasgrid-executor` binary.
    pub executor_bin: PathBuf,
    /// Code snapshots are unpacked under `<work_dir>/<instance_id>/`.
    pub work_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane_url: "http://127.0.0.1:8000".to_string(),
            hostname: "localhost".to_string(),
            ip_address: "127.0.0.1".to_string(),
            listen: "0.0.0.0:7070".to_string(),
            max_memory_mb: 1024,
            heartbeat_interval: "5s".to_string(),
            executor_bin: PathBuf::from("faasgrid-executor"),
            work_dir: PathBuf::from("/var/lib/faasgrid/instances"),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.ip_address
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("agent.ip_address: invalid address {:?}", self.ip_address))?;
        if parse_duration(&self.heartbeat_interval).is_none() {
            bail!("agent.heartbeat_interval: invalid duration {:?}", self.heartbeat_interval);
        }
        if self.hostname.trim().is_empty() {
            bail!("agent.hostname must not be empty");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse::<SocketAddr>()
            .with_context(|| format!("agent.listen: invalid address {:?}", self.listen))
    }

    /// Port the management surface is reachable on.
    pub fn agent_port(&self) -> u16 {
        self.listen_addr().map(|a| a.port()).unwrap_or(7070)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(Duration::from_secs(5))
    }
}

// ── Instance executor ─────────────────────────────────────────────

/// Launch-time configuration of a single instance executor.
///
/// Built by the worker agent from a launch request and handed to the
/// executor process as command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub code_path: PathBuf,
    pub entry_point: String,
    /// 0 binds an ephemeral port; the bound port is what gets reported.
    pub port: u16,
    pub instance_id: String,
    pub control_plane_url: Option<String>,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
}

impl ExecutorConfig {
    /// Render as `faasgrid-executor` command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--code-path".to_string(),
            self.code_path.display().to_string(),
            "--entry-point".to_string(),
            self.entry_point.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--instance-id".to_string(),
            self.instance_id.clone(),
            "--memory-mb".to_string(),
            self.memory_mb.to_string(),
            "--timeout-seconds".to_string(),
            self.timeout_seconds.to_string(),
        ];
        if let Some(url) = &self.control_plane_url {
            args.push("--control-plane-url".to_string());
            args.push(url.clone());
        }
        args
    }
}
