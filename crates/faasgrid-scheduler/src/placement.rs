//! Best-fit-by-slack worker selection.

use faasgrid_state::{WorkerHost, WorkerId, WorkerStatus};

/// Pick the ONLINE worker with room for `memory_mb` that has the most
/// available memory. Ties go to the lowest worker ID so the choice is stable.
pub fn best_fit(workers: &[WorkerHost], memory_mb: u32) -> Option<WorkerId> {
    workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Online)
        .filter(|w| w.available_memory_mb >= memory_mb)
        .max_by(|a, b| {
            a.available_memory_mb
                .cmp(&b.available_memory_mb)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|w| w.id.clone())
}
