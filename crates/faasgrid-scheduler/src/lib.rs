//! faasgrid-scheduler: worker/instance registries and cold starts.
//!
//! # Architecture
//!
//! ```text
//! WorkerRegistry     heartbeats → ONLINE, drain, stale → OFFLINE
//! InstanceRegistry   lease (warm affinity), mark_ready, mark_error, touch
//! ColdStartScheduler
//!   ├── placement::best_fit (most available memory among ONLINE workers)
//!   ├── StateStore (reserve memory + PENDING instance in one txn)
//!   ├── InstanceLauncher (worker agent: POST /instances)
//!   ├── ReadinessBoard (readiness callback → waiting cold start)
//!   └── in-flight map: deployment_id → shared outcome
//! ```
//!
//! The registries are the only writers of worker and instance status;
//! they delegate atomicity to single-transaction helpers in
//! `faasgrid-state`.

pub mod cold_start;
pub mod error;
pub mod instances;
pub mod launcher;
pub mod placement;
pub mod readiness;
pub mod workers;

pub use cold_start::{ColdStartScheduler, ProvisionConfig};
pub use error::{ProvisionError, SchedulerError, SchedulerResult};
pub use instances::InstanceRegistry;
pub use launcher::{BoxFuture, HttpLauncher, InstanceLauncher, LaunchError, LaunchRequest};
pub use readiness::ReadinessBoard;
pub use workers::{HeartbeatReport, WorkerRegistry};
