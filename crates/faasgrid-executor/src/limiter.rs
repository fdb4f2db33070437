//! Per-call memory enforcement.

use wasmtime::ResourceLimiter;

/// Caps linear memory growth and remembers whether a growth was denied,
/// so a trap that follows a failed `memory.grow` is reported as a
/// resource limit rather than a plain trap.
pub struct MemoryLimiter {
    memory_limit: usize,
    table_limit: usize,
    denied: bool,
}

impl MemoryLimiter {
    pub fn new(memory_limit: usize) -> Self {
        Self {
            memory_limit,
            table_limit: 10_000,
            denied: false,
        }
    }

    pub fn denied(&self) -> bool {
        self.denied
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.memory_limit {
            tracing::warn!(current, desired, limit = self.memory_limit, "memory growth denied");
            self.denied = true;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.table_limit {
            tracing::warn!(current, desired, limit = self.table_limit, "table growth denied");
            self.denied = true;
            Ok(false)
        } else {
            Ok(true)
        }
    }
}
