//! faasgrid-state: embedded state store for faasgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for the function catalog, worker hosts, execution instances, and
//! invocation records.
//!
//! # Consistency
//!
//! redb serializes write transactions, so every read-modify-write helper in
//! [`StateStore`] (capacity reservation, status transitions, record
//! finalization) runs inside a single write transaction and is atomic with
//! respect to concurrent dispatches and the heartbeat monitor.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{AbandonOutcome, ReadyOutcome, StateStore};
pub use types::*;
