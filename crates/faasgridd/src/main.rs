//! faasgridd: the faasgrid daemon.
//!
//! One binary for every role:
//! - `control-plane`: state store, cold-start scheduler, dispatcher,
//!   heartbeat monitor and the HTTP surface
//! - `agent`: worker-side management surface, executor supervision and
//!   heartbeats
//! - `publish`: register a function and publish a new deployment into a
//!   control plane's data directory (run while the control plane is stopped)
//!
//! # Usage
//!
//! ```text
//! faasgridd --config faasgrid.toml control-plane
//! faasgridd agent --control-plane-url http://10.0.0.1:8000 --hostname worker-a
//! faasgridd publish --name echo --code echo.wasm --memory-mb 64
//! ```

mod agent_mode;
mod control_plane;
mod publish;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use faasgrid_core::FaasgridConfig;

#[derive(Parser)]
#[command(name = "faasgridd", about = "faasgrid daemon")]
struct Cli {
    /// Path to a faasgrid.toml; built-in defaults are used without it.
    #[arg(long, global = true, env = "FAASGRID_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    ControlPlane {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<String>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// URL executors use to reach this control plane.
        #[arg(long)]
        advertise_url: Option<String>,
    },

    /// Run a worker agent.
    Agent {
        #[arg(long)]
        control_plane_url: Option<String>,

        #[arg(long)]
        hostname: Option<String>,

        /// Address the control plane uses to reach this host.
        #[arg(long)]
        ip_address: Option<String>,

        /// Address the management surface listens on.
        #[arg(long)]
        listen: Option<String>,

        #[arg(long)]
        max_memory_mb: Option<u32>,

        /// Path of the faasgrid-executor binary.
        #[arg(long)]
        executor_bin: Option<PathBuf>,

        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Publish a deployment of a function.
    Publish {
        /// Control-plane data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Function name; created on first publish.
        #[arg(long)]
        name: String,

        /// WebAssembly module (binary or text).
        #[arg(long)]
        code: PathBuf,

        #[arg(long, default_value = "handle")]
        entry_point: String,

        #[arg(long, default_value_t = 128)]
        memory_mb: u32,

        #[arg(long, default_value_t = 30)]
        timeout_seconds: u32,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "")]
        comment: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,faasgridd=debug,faasgrid=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => FaasgridConfig::from_file(path)?,
        None => FaasgridConfig::default(),
    };

    match cli.command {
        Command::ControlPlane {
            listen,
            data_dir,
            advertise_url,
        } => {
            let cp = &mut config.control_plane;
            if let Some(listen) = listen {
                cp.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                cp.data_dir = data_dir;
            }
            if let Some(url) = advertise_url {
                cp.advertise_url = url;
            }
            cp.validate()?;
            control_plane::run_control_plane(config.control_plane).await
        }
        Command::Agent {
            control_plane_url,
            hostname,
            ip_address,
            listen,
            max_memory_mb,
            executor_bin,
            work_dir,
        } => {
            let agent = &mut config.agent;
            if let Some(v) = control_plane_url {
                agent.control_plane_url = v;
            }
            if let Some(v) = hostname {
                agent.hostname = v;
            }
            if let Some(v) = ip_address {
                agent.ip_address = v;
            }
            if let Some(v) = listen {
                agent.listen = v;
            }
            if let Some(v) = max_memory_mb {
                agent.max_memory_mb = v;
            }
            if let Some(v) = executor_bin {
                agent.executor_bin = v;
            }
            if let Some(v) = work_dir {
                agent.work_dir = v;
            }
            agent.validate()?;
            agent_mode::run_agent(config.agent).await
        }
        Command::Publish {
            data_dir,
            name,
            code,
            entry_point,
            memory_mb,
            timeout_seconds,
            description,
            comment,
        } => {
            let data_dir = data_dir.unwrap_or(config.control_plane.data_dir);
            publish::run_publish(publish::PublishArgs {
                data_dir,
                name,
                code,
                entry_point,
                memory_mb,
                timeout_seconds,
                description,
                comment,
            })
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
