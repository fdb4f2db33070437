//! faasgrid-health: heartbeat monitor for the faasgrid control plane.
//!
//! Workers report in through [`faasgrid_scheduler::WorkerRegistry`]; this
//! crate runs the periodic sweep that notices the ones that stopped.
//!
//! # Sweep
//!
//! ```text
//! every sweep_interval:
//!   ONLINE/DRAINING workers silent > staleness  → OFFLINE
//!   RUNNING instances untouched > idle_after    → IDLE
//!   ERROR instances older than error_retention  → deleted (unless worker OFFLINE)
//! ```
//!
//! Instances on an OFFLINE worker are kept as-is; `Lease` skips them until
//! the worker reports again.

pub mod monitor;

pub use monitor::{
    HeartbeatMonitor, MonitorConfig, MonitorError, MonitorHandle, ReapCallback, SweepReport,
};
