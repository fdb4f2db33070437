//! redb table definitions for the faasgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Functions keyed by `{name}`.
pub const FUNCTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("functions");

/// Deployments keyed by `{function_name}/{version:010}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Worker hosts keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Invocation records keyed by `{record_id}`.
pub const INVOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("invocations");
