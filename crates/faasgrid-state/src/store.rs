//! StateStore: redb-backed state persistence for faasgrid.
//!
//! Provides typed operations over the function catalog, worker hosts,
//! execution instances, and invocation records. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Status transitions and capacity counters are only changed inside a
//! single write transaction that re-reads the current row, so callers
//! never race a stale copy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    (codec) => {
        |e| StateError::Codec(e.to_string())
    };
    ($op:ident) => {
        |e| StateError::Storage {
            op: stringify!($op),
            reason: e.to_string(),
        }
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(codec))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(codec))
}

fn scan<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(read))? {
        let (_, value) = entry.map_err(map_err!(read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn lookup<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Result of a readiness signal applied to an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadyOutcome {
    /// The instance moved PENDING → RUNNING on the reported port.
    Registered(Instance),
    /// The instance had already left PENDING (late or duplicate signal).
    Ignored(Instance),
}

/// Result of giving up on a pending instance.
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonOutcome {
    /// The instance was still PENDING; it is now ERROR and its memory is released.
    Abandoned(Instance),
    /// Readiness won the race; the instance is usable.
    AlreadyReady(Instance),
    /// The instance is gone or already ERROR.
    Gone,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(txn))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FUNCTIONS).map_err(map_err!(table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(table))?;
        txn.open_table(WORKERS).map_err(map_err!(table))?;
        txn.open_table(INSTANCES).map_err(map_err!(table))?;
        txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
        txn.commit().map_err(map_err!(txn))?;
        Ok(())
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(txn))?;
        let out = f(&txn)?;
        txn.commit().map_err(map_err!(txn))?;
        Ok(out)
    }

    // ── Functions ──────────────────────────────────────────────────

    /// Insert or update a function definition.
    pub fn put_function(&self, function: &Function) -> StateResult<()> {
        let value = encode(function)?;
        self.write(|txn| {
            let mut table = txn.open_table(FUNCTIONS).map_err(map_err!(table))?;
            table
                .insert(function.name.as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(())
        })?;
        debug!(name = %function.name, "function stored");
        Ok(())
    }

    /// Get a function by name.
    pub fn get_function(&self, name: &str) -> StateResult<Option<Function>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(FUNCTIONS).map_err(map_err!(table))?;
        lookup(&table, name)
    }

    /// List all functions.
    pub fn list_functions(&self) -> StateResult<Vec<Function>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(FUNCTIONS).map_err(map_err!(table))?;
        scan(&table)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Snapshot a function's code as a new active deployment.
    ///
    /// Assigns the next version, activates the new deployment, and
    /// deactivates the previously active one, all in one transaction.
    pub fn publish_deployment(
        &self,
        function_name: &str,
        code: Vec<u8>,
        requirements: &str,
        comment: &str,
        now: u64,
    ) -> StateResult<Deployment> {
        let deployment = self.write(|txn| {
            let functions = txn.open_table(FUNCTIONS).map_err(map_err!(table))?;
            let function: Function = lookup(&functions, function_name)?
                .ok_or_else(|| StateError::NotFound(format!("function {function_name}")))?;

            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(table))?;
            let existing: Vec<Deployment> = scan::<Deployment, _>(&table)?
                .into_iter()
                .filter(|d| d.function_name == function_name)
                .collect();
            let version = existing.iter().map(|d| d.version).max().unwrap_or(0) + 1;

            for mut previous in existing.into_iter().filter(|d| d.is_active) {
                previous.is_active = false;
                let value = encode(&previous)?;
                table
                    .insert(previous.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(write))?;
            }

            let deployment = Deployment {
                id: uuid::Uuid::new_v4().to_string(),
                function_name: function_name.to_string(),
                version,
                comment: comment.to_string(),
                code_snapshot: code,
                requirements_snapshot: requirements.to_string(),
                entry_point_snapshot: function.entry_point.clone(),
                is_active: true,
                created_at: now,
            };
            let value = encode(&deployment)?;
            table
                .insert(deployment.table_key().as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(deployment)
        })?;
        debug!(
            function = %function_name,
            version = deployment.version,
            deployment_id = %deployment.id,
            "deployment published"
        );
        Ok(deployment)
    }

    /// All deployments of a function, oldest version first.
    pub fn list_deployments(&self, function_name: &str) -> StateResult<Vec<Deployment>> {
        let prefix = format!("{function_name}/");
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(read))? {
            let (key, value) = entry.map_err(map_err!(read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    /// The currently active deployment of a function, if any.
    pub fn active_deployment(&self, function_name: &str) -> StateResult<Option<Deployment>> {
        Ok(self
            .list_deployments(function_name)?
            .into_iter()
            .rev()
            .find(|d| d.is_active))
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Create-or-update a worker from a heartbeat, keyed by hostname.
    ///
    /// Always sets ONLINE and refreshes `last_heartbeat`. The reported
    /// available memory replaces the stored counter, minus the memory of
    /// this worker's PENDING instances: the agent may not have launched
    /// them yet, and their reservation must survive the report.
    pub fn record_heartbeat(
        &self,
        hostname: &str,
        ip_address: &str,
        agent_port: u16,
        max_memory_mb: u32,
        available_memory_mb: u32,
        now: u64,
    ) -> StateResult<WorkerHost> {
        self.write(|txn| {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(table))?;
            let existing = scan::<WorkerHost, _>(&table)?
                .into_iter()
                .find(|w| w.hostname == hostname);
            let pending_mb: u32 = match &existing {
                Some(w) => {
                    let instances = txn.open_table(INSTANCES).map_err(map_err!(table))?;
                    scan::<Instance, _>(&instances)?
                        .iter()
                        .filter(|i| i.worker_id == w.id && i.status == InstanceStatus::Pending)
                        .map(|i| i.memory_mb)
                        .sum()
                }
                None => 0,
            };
            let worker = WorkerHost {
                id: existing
                    .map(|w| w.id)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                hostname: hostname.to_string(),
                ip_address: ip_address.to_string(),
                agent_port,
                status: WorkerStatus::Online,
                max_memory_mb,
                available_memory_mb: available_memory_mb
                    .min(max_memory_mb)
                    .saturating_sub(pending_mb),
                last_heartbeat: now,
            };
            let value = encode(&worker)?;
            table
                .insert(worker.id.as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(worker)
        })
    }

    /// Get a worker by ID.
    pub fn get_worker(&self, worker_id: &str) -> StateResult<Option<WorkerHost>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(table))?;
        lookup(&table, worker_id)
    }

    /// List all workers.
    pub fn list_workers(&self) -> StateResult<Vec<WorkerHost>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(table))?;
        scan(&table)
    }

    /// Set a worker's status. Returns the updated worker, or `None` if unknown.
    pub fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> StateResult<Option<WorkerHost>> {
        self.write(|txn| {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(table))?;
            let Some(mut worker) = lookup::<WorkerHost, _>(&table, worker_id)? else {
                return Ok(None);
            };
            worker.status = status;
            let value = encode(&worker)?;
            table
                .insert(worker_id, value.as_slice())
                .map_err(map_err!(write))?;
            Ok(Some(worker))
        })
    }

    /// Mark ONLINE/DRAINING workers whose last heartbeat is older than
    /// `staleness_ms` as OFFLINE. Returns the affected workers.
    pub fn mark_stale_workers_offline(
        &self,
        now: u64,
        staleness_ms: u64,
    ) -> StateResult<Vec<WorkerHost>> {
        self.write(|txn| {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(table))?;
            let stale: Vec<WorkerHost> = scan::<WorkerHost, _>(&table)?
                .into_iter()
                .filter(|w| w.status != WorkerStatus::Offline)
                .filter(|w| now.saturating_sub(w.last_heartbeat) > staleness_ms)
                .collect();
            let mut changed = Vec::with_capacity(stale.len());
            for mut worker in stale {
                worker.status = WorkerStatus::Offline;
                let value = encode(&worker)?;
                table
                    .insert(worker.id.as_str(), value.as_slice())
                    .map_err(map_err!(write))?;
                changed.push(worker);
            }
            Ok(changed)
        })
    }

    /// Return reserved memory to a worker, capped at its maximum.
    pub fn release_memory(&self, worker_id: &str, memory_mb: u32) -> StateResult<()> {
        self.write(|txn| {
            let mut workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
            release_in(&mut workers, worker_id, memory_mb)
        })
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Reserve capacity and create a PENDING instance in one transaction.
    ///
    /// `select` sees every worker and the requested memory and names the
    /// worker to place on. Returns `None` if it picks nothing or the pick
    /// cannot fit the request.
    pub fn place_instance<F>(
        &self,
        mut instance: Instance,
        select: F,
    ) -> StateResult<Option<PlacedInstance>>
    where
        F: FnOnce(&[WorkerHost], u32) -> Option<WorkerId>,
    {
        let placed = self.write(|txn| {
            let mut workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
            let all: Vec<WorkerHost> = scan(&workers)?;
            let Some(worker_id) = select(&all, instance.memory_mb) else {
                return Ok(None);
            };
            let Some(mut worker) = all.into_iter().find(|w| w.id == worker_id) else {
                return Ok(None);
            };
            if worker.status != WorkerStatus::Online
                || worker.available_memory_mb < instance.memory_mb
            {
                return Ok(None);
            }
            worker.available_memory_mb -= instance.memory_mb;
            let value = encode(&worker)?;
            workers
                .insert(worker.id.as_str(), value.as_slice())
                .map_err(map_err!(write))?;

            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            if instances
                .get(instance.id.as_str())
                .map_err(map_err!(read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!("instance {} exists", instance.id)));
            }
            instance.worker_id = worker.id.clone();
            instance.status = InstanceStatus::Pending;
            instance.port = None;
            let value = encode(&instance)?;
            instances
                .insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(Some(PlacedInstance { instance, worker }))
        })?;
        if let Some(p) = &placed {
            debug!(
                instance_id = %p.instance.id,
                worker_id = %p.worker.id,
                memory_mb = p.instance.memory_mb,
                available_mb = p.worker.available_memory_mb,
                "instance placed"
            );
        }
        Ok(placed)
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
        lookup(&table, instance_id)
    }

    /// List all instances.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
        scan(&table)
    }

    /// List all instances of a function, across its deployments.
    pub fn list_instances_for_function(&self, function_name: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.function_name == function_name)
            .collect())
    }

    /// Instances of a deployment paired with their workers, read from one snapshot.
    pub fn placed_instances(&self, deployment_id: &str) -> StateResult<Vec<PlacedInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let instances = txn.open_table(INSTANCES).map_err(map_err!(table))?;
        let workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
        let workers: HashMap<WorkerId, WorkerHost> = scan::<WorkerHost, _>(&workers)?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();
        Ok(scan::<Instance, _>(&instances)?
            .into_iter()
            .filter(|i| i.deployment_id == deployment_id)
            .filter_map(|instance| {
                let worker = workers.get(&instance.worker_id)?.clone();
                Some(PlacedInstance { instance, worker })
            })
            .collect())
    }

    /// Apply a readiness signal: PENDING → RUNNING bound to `port`.
    ///
    /// `(worker, port)` must be unique: an ERROR instance holding the pair
    /// is deleted, a live one makes this a `Conflict`.
    pub fn mark_instance_ready(
        &self,
        instance_id: &str,
        port: u16,
        now: u64,
    ) -> StateResult<ReadyOutcome> {
        self.write(|txn| {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let mut instance: Instance = lookup(&table, instance_id)?
                .ok_or_else(|| StateError::NotFound(format!("instance {instance_id}")))?;
            if instance.status != InstanceStatus::Pending {
                return Ok(ReadyOutcome::Ignored(instance));
            }

            let holders: Vec<Instance> = scan::<Instance, _>(&table)?
                .into_iter()
                .filter(|i| i.id != instance.id)
                .filter(|i| i.worker_id == instance.worker_id && i.port == Some(port))
                .collect();
            for holder in holders {
                if holder.status != InstanceStatus::Error {
                    return Err(StateError::Conflict(format!(
                        "port {port} on worker {} is held by instance {}",
                        holder.worker_id, holder.id
                    )));
                }
                table
                    .remove(holder.id.as_str())
                    .map_err(map_err!(write))?;
                debug!(instance_id = %holder.id, port, "reclaimed port from failed instance");
            }

            instance.status = InstanceStatus::Running;
            instance.port = Some(port);
            instance.last_accessed = now;
            instance.updated_at = now;
            let value = encode(&instance)?;
            table
                .insert(instance_id, value.as_slice())
                .map_err(map_err!(write))?;
            Ok(ReadyOutcome::Registered(instance))
        })
    }

    /// Move an instance to ERROR and release its memory reservation.
    ///
    /// Returns the updated instance, or `None` if it does not exist.
    /// Already-ERROR instances are returned unchanged.
    pub fn mark_instance_error(
        &self,
        instance_id: &str,
        now: u64,
    ) -> StateResult<Option<Instance>> {
        self.write(|txn| {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let Some(instance) = lookup::<Instance, _>(&instances, instance_id)? else {
                return Ok(None);
            };
            if instance.status == InstanceStatus::Error {
                return Ok(Some(instance));
            }
            let mut workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
            fail_in(&mut instances, &mut workers, instance, now).map(Some)
        })
    }

    /// Give up on a PENDING instance after its readiness wait expired.
    ///
    /// Only a still-PENDING instance is failed (and its memory released);
    /// a readiness signal that already landed wins.
    pub fn abandon_pending_instance(
        &self,
        instance_id: &str,
        now: u64,
    ) -> StateResult<AbandonOutcome> {
        self.write(|txn| {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let Some(instance) = lookup::<Instance, _>(&instances, instance_id)? else {
                return Ok(AbandonOutcome::Gone);
            };
            match instance.status {
                InstanceStatus::Pending => {
                    let mut workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
                    fail_in(&mut instances, &mut workers, instance, now)
                        .map(AbandonOutcome::Abandoned)
                }
                InstanceStatus::Running | InstanceStatus::Idle => {
                    Ok(AbandonOutcome::AlreadyReady(instance))
                }
                InstanceStatus::Error => Ok(AbandonOutcome::Gone),
            }
        })
    }

    /// Record an access: refresh `last_accessed`, promote IDLE → RUNNING.
    ///
    /// PENDING and ERROR instances are left alone. Returns false if the
    /// instance does not exist.
    pub fn touch_instance(&self, instance_id: &str, now: u64) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let Some(mut instance) = lookup::<Instance, _>(&table, instance_id)? else {
                return Ok(false);
            };
            if !instance.status.is_warm() {
                return Ok(true);
            }
            instance.last_accessed = now.max(instance.last_accessed);
            if instance.status == InstanceStatus::Idle {
                instance.status = InstanceStatus::Running;
                instance.updated_at = now;
            }
            let value = encode(&instance)?;
            table
                .insert(instance_id, value.as_slice())
                .map_err(map_err!(write))?;
            Ok(true)
        })
    }

    /// Delete an instance by ID. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            Ok(table
                .remove(instance_id)
                .map_err(map_err!(write))?
                .is_some())
        })
    }

    /// RUNNING instances not accessed for `idle_ms` become IDLE.
    pub fn demote_idle_instances(&self, now: u64, idle_ms: u64) -> StateResult<Vec<Instance>> {
        self.write(|txn| {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let idle: Vec<Instance> = scan::<Instance, _>(&table)?
                .into_iter()
                .filter(|i| i.status == InstanceStatus::Running)
                .filter(|i| now.saturating_sub(i.last_accessed) > idle_ms)
                .collect();
            let mut changed = Vec::with_capacity(idle.len());
            for mut instance in idle {
                instance.status = InstanceStatus::Idle;
                instance.updated_at = now;
                let value = encode(&instance)?;
                table
                    .insert(instance.id.as_str(), value.as_slice())
                    .map_err(map_err!(write))?;
                changed.push(instance);
            }
            Ok(changed)
        })
    }

    /// Delete ERROR instances that failed more than `retention_ms` ago.
    ///
    /// Instances on OFFLINE workers are kept.
    pub fn reap_error_instances(&self, now: u64, retention_ms: u64) -> StateResult<Vec<Instance>> {
        self.write(|txn| {
            let workers = txn.open_table(WORKERS).map_err(map_err!(table))?;
            let offline: Vec<WorkerId> = scan::<WorkerHost, _>(&workers)?
                .into_iter()
                .filter(|w| w.status == WorkerStatus::Offline)
                .map(|w| w.id)
                .collect();
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(table))?;
            let expired: Vec<Instance> = scan::<Instance, _>(&table)?
                .into_iter()
                .filter(|i| i.status == InstanceStatus::Error)
                .filter(|i| now.saturating_sub(i.updated_at) > retention_ms)
                .filter(|i| !offline.contains(&i.worker_id))
                .collect();
            for instance in &expired {
                table
                    .remove(instance.id.as_str())
                    .map_err(map_err!(write))?;
            }
            Ok(expired)
        })
    }

    // ── Invocations ────────────────────────────────────────────────

    /// Write a freshly opened invocation record.
    pub fn open_invocation(&self, record: &InvocationRecord) -> StateResult<()> {
        let value = encode(record)?;
        self.write(|txn| {
            let mut table = txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
            if table
                .get(record.id.as_str())
                .map_err(map_err!(read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!("invocation {} exists", record.id)));
            }
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(())
        })
    }

    /// Write the terminal fields of an open record. A record is finalized
    /// at most once; later attempts are a `Conflict`.
    pub fn finalize_invocation(&self, record: &InvocationRecord) -> StateResult<()> {
        if !record.is_finalized() {
            return Err(StateError::Invalid(format!(
                "invocation {} has no end_time",
                record.id
            )));
        }
        let value = encode(record)?;
        self.write(|txn| {
            let mut table = txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
            let stored: InvocationRecord = lookup(&table, &record.id)?
                .ok_or_else(|| StateError::NotFound(format!("invocation {}", record.id)))?;
            if stored.is_finalized() {
                return Err(StateError::Conflict(format!(
                    "invocation {} already finalized",
                    record.id
                )));
            }
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(write))?;
            Ok(())
        })
    }

    /// Get an invocation record by its record ID.
    pub fn get_invocation(&self, id: &str) -> StateResult<Option<InvocationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
        lookup(&table, id)
    }

    /// Latest invocation record carrying the given request ID.
    pub fn find_invocation_by_request_id(
        &self,
        request_id: &str,
    ) -> StateResult<Option<InvocationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
        Ok(scan::<InvocationRecord, _>(&table)?
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .max_by_key(|r| r.start_time))
    }

    /// Most recent invocations of a function, newest first.
    pub fn list_invocations_for_function(
        &self,
        function_name: &str,
        limit: usize,
    ) -> StateResult<Vec<InvocationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(txn))?;
        let table = txn.open_table(INVOCATIONS).map_err(map_err!(table))?;
        let mut records: Vec<InvocationRecord> = scan::<InvocationRecord, _>(&table)?
            .into_iter()
            .filter(|r| r.function_name == function_name)
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records.truncate(limit);
        Ok(records)
    }
}

/// Add `memory_mb` back to a worker inside an open write transaction.
fn release_in(
    workers: &mut redb::Table<'_, &'static str, &'static [u8]>,
    worker_id: &str,
    memory_mb: u32,
) -> StateResult<()> {
    let Some(mut worker) = lookup::<WorkerHost, _>(&*workers, worker_id)? else {
        return Ok(());
    };
    worker.available_memory_mb = worker
        .available_memory_mb
        .saturating_add(memory_mb)
        .min(worker.max_memory_mb);
    let value = encode(&worker)?;
    workers
        .insert(worker_id, value.as_slice())
        .map_err(map_err!(write))?;
    Ok(())
}

/// Set an instance to ERROR and release its reservation.
fn fail_in(
    instances: &mut redb::Table<'_, &'static str, &'static [u8]>,
    workers: &mut redb::Table<'_, &'static str, &'static [u8]>,
    mut instance: Instance,
    now: u64,
) -> StateResult<Instance> {
    instance.status = InstanceStatus::Error;
    instance.updated_at = now;
    let value = encode(&instance)?;
    instances
        .insert(instance.id.as_str(), value.as_slice())
        .map_err(map_err!(write))?;
    release_in(workers, &instance.worker_id, instance.memory_mb)?;
    Ok(instance)
}
