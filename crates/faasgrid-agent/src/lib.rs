//! faasgrid-agent: the worker side of the control plane.
//!
//! The agent accepts launch and stop requests from the control plane,
//! runs one `faasgrid-executor` process per instance, reaps executors that
//! exit, and reports this host's capacity through periodic heartbeats.
//! Readiness is reported by the executor itself, not by the agent.

pub mod error;
pub mod heartbeat;
pub mod server;
pub mod supervisor;

pub use error::{AgentError, AgentResult};
pub use heartbeat::{HeartbeatClient, HostIdentity};
pub use server::build_router;
pub use supervisor::{InstanceSummary, Supervisor, SupervisorConfig};
