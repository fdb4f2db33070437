//! FunctionHandler: one deployment's module, bound to its entry point.
//!
//! The module is compiled once at load. Every call gets a fresh `Store`
//! and instance, so nothing a call does to guest memory or globals is
//! visible to the next one.
//!
//! # Guest ABI
//!
//! - `memory`: exported linear memory
//! - `alloc(len: i32) -> i32`: returns a buffer for the input
//! - `<entry>(ptr: i32, len: i32) -> i64`: returns `(out_ptr << 32) | out_len`
//! - optional import `faasgrid.context(ptr: i32, cap: i32) -> i32`: copies the
//!   call context JSON into the guest when it fits, returns its length

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::IgnoredAny;
use tracing::{debug, info};
use wasmtime::{Caller, Config, Engine, Extern, Linker, Memory, Module, Store, Trap, TypedFunc};

use faasgrid_core::config::ExecutorConfig;

use crate::error::{ExecutorError, ExecutorResult, HandlerError, HandlerResult};
use crate::limiter::MemoryLimiter;

/// Granularity of the wall-clock deadline.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-call metadata made available to the guest.
#[derive(Debug, Clone, Serialize)]
pub struct CallContext {
    pub request_id: Option<String>,
    pub instance_id: String,
}

struct CallState {
    limiter: MemoryLimiter,
    context: Vec<u8>,
}

struct Bound {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    entry: TypedFunc<(i32, i32), i64>,
}

struct Inner {
    engine: Engine,
    module: Module,
    linker: Linker<CallState>,
    entry_point: String,
    memory_mb: u32,
    timeout_seconds: u32,
}

/// A loaded, callable function.
#[derive(Clone)]
pub struct FunctionHandler {
    inner: Arc<Inner>,
}

impl FunctionHandler {
    /// Compile the code file and check it can actually serve calls.
    ///
    /// Runs one trial instantiation so a failing start function, an
    /// unsatisfied import or a missing export surfaces here rather than on
    /// the first invocation.
    pub fn load(config: &ExecutorConfig) -> ExecutorResult<Self> {
        if !config.code_path.is_file() {
            return Err(ExecutorError::MissingCode(config.code_path.clone()));
        }

        let mut engine_config = Config::new();
        engine_config.epoch_interruption(true);
        let engine =
            Engine::new(&engine_config).map_err(|e| ExecutorError::Engine(e.to_string()))?;

        let module = Module::from_file(&engine, &config.code_path)
            .map_err(|e| ExecutorError::Compile(format!("{e:#}")))?;

        let mut linker = Linker::new(&engine);
        linker
            .func_wrap("faasgrid", "context", write_context)
            .map_err(|e| ExecutorError::Engine(e.to_string()))?;

        let handler = Self {
            inner: Arc::new(Inner {
                engine,
                module,
                linker,
                entry_point: config.entry_point.clone(),
                memory_mb: config.memory_mb.max(1),
                timeout_seconds: config.timeout_seconds.max(1),
            }),
        };

        let mut store = handler.new_store(Vec::new());
        let instance = handler
            .inner
            .linker
            .instantiate(&mut store, &handler.inner.module)
            .map_err(|e| ExecutorError::Instantiate(format!("{e:#}")))?;
        handler.bind(&mut store, &instance)?;

        spawn_epoch_ticker(&handler.inner.engine)?;

        info!(
            code_path = %config.code_path.display(),
            entry_point = %handler.inner.entry_point,
            memory_mb = handler.inner.memory_mb,
            timeout_seconds = handler.inner.timeout_seconds,
            "function loaded"
        );
        Ok(handler)
    }

    pub fn entry_point(&self) -> &str {
        &self.inner.entry_point
    }

    /// Run one call on the blocking pool.
    ///
    /// The body is normalised to JSON first: empty becomes `{}`, valid JSON
    /// passes through, anything else is wrapped as a JSON string. Output
    /// that is valid JSON is returned as is, other UTF-8 output is wrapped
    /// as a JSON string.
    pub async fn invoke(&self, body: &[u8], context: &CallContext) -> HandlerResult<Bytes> {
        let input = normalize_input(body)?;
        let context =
            serde_json::to_vec(context).map_err(|e| HandlerError::Internal(e.to_string()))?;

        let handler = self.clone();
        let output = tokio::task::spawn_blocking(move || handler.call(&input, context))
            .await
            .map_err(|e| HandlerError::Internal(format!("execution task failed: {e}")))??;

        render_output(output)
    }

    fn new_store(&self, context: Vec<u8>) -> Store<CallState> {
        let limit = self.inner.memory_mb as usize * 1024 * 1024;
        let mut store = Store::new(
            &self.inner.engine,
            CallState {
                limiter: MemoryLimiter::new(limit),
                context,
            },
        );
        store.limiter(|state| &mut state.limiter);
        let timeout = Duration::from_secs(u64::from(self.inner.timeout_seconds));
        store.set_epoch_deadline((timeout.as_millis() / EPOCH_TICK.as_millis()) as u64 + 1);
        store
    }

    fn bind(
        &self,
        store: &mut Store<CallState>,
        instance: &wasmtime::Instance,
    ) -> ExecutorResult<Bound> {
        let missing = |name: &str, reason: String| ExecutorError::MissingExport {
            name: name.to_string(),
            reason,
        };
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| missing("memory", "no exported memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, "alloc")
            .map_err(|e| missing("alloc", e.to_string()))?;
        let entry = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, &self.inner.entry_point)
            .map_err(|e| missing(&self.inner.entry_point, e.to_string()))?;
        Ok(Bound {
            memory,
            alloc,
            entry,
        })
    }

    fn call(&self, input: &[u8], context: Vec<u8>) -> HandlerResult<Vec<u8>> {
        let mut store = self.new_store(context);
        let instance = self
            .inner
            .linker
            .instantiate(&mut store, &self.inner.module)
            .map_err(|e| self.classify(e, &store))?;
        let bound = self
            .bind(&mut store, &instance)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;

        let len = i32::try_from(input.len())
            .map_err(|_| HandlerError::ResourceLimit(self.inner.memory_mb))?;
        let ptr = bound
            .alloc
            .call(&mut store, len)
            .map_err(|e| self.classify(e, &store))?;
        bound
            .memory
            .write(&mut store, ptr as u32 as usize, input)
            .map_err(|_| HandlerError::Trap("alloc returned an out-of-bounds buffer".to_string()))?;

        let packed = bound
            .entry
            .call(&mut store, (ptr, len))
            .map_err(|e| self.classify(e, &store))?;

        let packed = packed as u64;
        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xffff_ffff) as usize;
        let output = out_ptr
            .checked_add(out_len)
            .and_then(|end| bound.memory.data(&store).get(out_ptr..end))
            .ok_or_else(|| {
                HandlerError::InvalidOutput(format!(
                    "output range {out_ptr}+{out_len} is outside guest memory"
                ))
            })?;
        debug!(input_len = input.len(), output_len = out_len, "call completed");
        Ok(output.to_vec())
    }

    fn classify(&self, err: anyhow::Error, store: &Store<CallState>) -> HandlerError {
        if store.data().limiter.denied() {
            return HandlerError::ResourceLimit(self.inner.memory_mb);
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => HandlerError::Timeout(self.inner.timeout_seconds),
            Some(trap) => HandlerError::Trap(trap.to_string()),
            None => HandlerError::Trap(format!("{err:#}")),
        }
    }
}

/// Host side of `faasgrid.context`.
fn write_context(mut caller: Caller<'_, CallState>, ptr: i32, cap: i32) -> anyhow::Result<i32> {
    let context = caller.data().context.clone();
    let needed = i32::try_from(context.len())?;
    if needed <= cap {
        let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
            anyhow::bail!("guest does not export memory");
        };
        memory.write(&mut caller, ptr as u32 as usize, &context)?;
    }
    Ok(needed)
}

/// Advances the engine epoch until the engine is dropped.
fn spawn_epoch_ticker(engine: &Engine) -> ExecutorResult<()> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("faasgrid-epoch".to_string())
        .spawn(move || {
            while let Some(engine) = weak.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(EPOCH_TICK);
            }
        })
        .map(|_| ())
        .map_err(|e| ExecutorError::Engine(format!("failed to start epoch ticker: {e}")))
}

fn normalize_input(body: &[u8]) -> HandlerResult<Vec<u8>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(b"{}".to_vec());
    }
    if serde_json::from_slice::<IgnoredAny>(body).is_ok() {
        return Ok(body.to_vec());
    }
    serde_json::to_vec(&String::from_utf8_lossy(body))
        .map_err(|e| HandlerError::Internal(e.to_string()))
}

fn render_output(output: Vec<u8>) -> HandlerResult<Bytes> {
    if serde_json::from_slice::<IgnoredAny>(&output).is_ok() {
        return Ok(Bytes::from(output));
    }
    let text = String::from_utf8(output)
        .map_err(|_| HandlerError::InvalidOutput("output is neither JSON nor UTF-8".to_string()))?;
    serde_json::to_vec(&text)
        .map(Bytes::from)
        .map_err(|e| HandlerError::Internal(e.to_string()))
}
