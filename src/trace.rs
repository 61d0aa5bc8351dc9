//! Public tracing facade: run contexts, scoped runs, event emitters, and
//! active-context propagation across threads and tasks.
//!
//! A `Trace` owns the bounded queue and the single background worker. Run
//! contexts are cheap Arc handles; emitting an event stamps the envelope and
//! hands off to the queue without ever blocking the caller. The only
//! bounded wait in the system is the `run_end` submission, and only when
//! `block_on_run_end` is configured.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::TraceConfig;
use crate::error::Result;
use crate::events::{now_ms, Event, EventPayload, RunOutcome};
use crate::exporter::Exporter;
use crate::queue::{EventQueue, QueueSnapshot};
use crate::sampler::{HashSampler, Sampler};
use crate::storage::StorageExporter;
use crate::worker::Worker;

tokio::task_local! {
    static TASK_ACTIVE: RefCell<Vec<RunContext>>;
}

thread_local! {
    static THREAD_ACTIVE: RefCell<Vec<RunContext>> = const { RefCell::new(Vec::new()) };
}

/// Optional attributes attached to a run at start.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RunOptions {
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

struct RunInner {
    run_id: String,
    name: String,
    traced: bool,
    started_at_ms: i64,
    queue: EventQueue,
    seq: AtomicU64,
    ended: AtomicBool,
    parent_events: StdMutex<Vec<u64>>,
    /// Present in only-on-error mode: events collect here instead of the
    /// queue until the run's fate is known.
    buffer: Option<StdMutex<Vec<Event>>>,
    block_on_run_end: bool,
    run_end_block_timeout: Duration,
}

/// Context for one run. Clones share the same underlying run.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunInner>,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this run was selected by the sampler. Untraced contexts
    /// accept every call and record nothing.
    pub fn is_traced(&self) -> bool {
        self.inner.traced
    }

    pub fn is_active(&self) -> bool {
        !self.inner.ended.load(Ordering::Acquire)
    }

    fn stamp(&self, payload: EventPayload) -> Option<Event> {
        if !self.inner.traced {
            return None;
        }
        if self.inner.ended.load(Ordering::Acquire) {
            warn!(run_id = %self.inner.run_id, "event emitted after run_end, dropping");
            return None;
        }
        let event_id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let mut event = Event::new(self.inner.run_id.clone(), event_id, payload);
        event.parent_event_id = self.inner.parent_events.lock().unwrap().last().copied();
        Some(event)
    }

    fn dispatch(&self, event: Event) -> u64 {
        let event_id = event.event_id;
        match &self.inner.buffer {
            Some(buffer) => buffer.lock().unwrap().push(event),
            None => {
                self.inner.queue.try_emit(event);
            }
        }
        event_id
    }

    fn emit(&self, payload: EventPayload) -> Option<u64> {
        self.stamp(payload).map(|event| self.dispatch(event))
    }

    pub fn llm(
        &self,
        model: &str,
        prompt: impl Into<Value>,
        response: impl Into<Value>,
        total_tokens: Option<u64>,
        latency_ms: Option<u64>,
    ) -> Option<u64> {
        self.emit(EventPayload::LlmCall {
            model: model.to_string(),
            prompt: prompt.into(),
            response: response.into(),
            total_tokens,
            latency_ms,
        })
    }

    pub fn tool(&self, tool_name: &str, tool_args: Value, tool_result: Value) -> Option<u64> {
        self.emit(EventPayload::ToolCall {
            tool_name: tool_name.to_string(),
            tool_args,
            tool_result,
        })
    }

    pub fn memory_read(
        &self,
        memory_key: &str,
        memory_value: Value,
        memory_type: &str,
    ) -> Option<u64> {
        self.emit(EventPayload::MemoryRead {
            memory_key: memory_key.to_string(),
            memory_value,
            memory_type: memory_type.to_string(),
        })
    }

    pub fn memory_write(
        &self,
        memory_key: &str,
        memory_value: Value,
        memory_type: &str,
        overwrite: bool,
    ) -> Option<u64> {
        self.emit(EventPayload::MemoryWrite {
            memory_key: memory_key.to_string(),
            memory_value,
            memory_type: memory_type.to_string(),
            overwrite,
        })
    }

    pub fn error(
        &self,
        error_type: &str,
        error_message: &str,
        critical: bool,
        stack: Option<String>,
    ) -> Option<u64> {
        self.emit(EventPayload::Error {
            error_type: error_type.to_string(),
            error_message: error_message.to_string(),
            critical,
            stack,
        })
    }

    pub fn final_answer(&self, answer: &str) -> Option<u64> {
        self.emit(EventPayload::FinalAnswer {
            answer: answer.to_string(),
        })
    }

    /// Escape hatch for user-defined events. Custom events go through the
    /// full pipeline like every built-in type.
    pub fn custom(&self, name: &str, payload: Value) -> Option<u64> {
        self.emit(EventPayload::Custom {
            name: name.to_string(),
            payload,
        })
    }

    /// Nest subsequent events under `parent_event_id` until the returned
    /// guard drops.
    pub fn with_parent(&self, parent_event_id: u64) -> ParentGuard {
        self.inner
            .parent_events
            .lock()
            .unwrap()
            .push(parent_event_id);
        ParentGuard {
            ctx: self.clone(),
        }
    }

    /// End the run as completed. Safe to call once; later emissions and
    /// repeated completions are dropped with a warning.
    pub fn complete(&self) {
        self.end(RunOutcome::Completed);
    }

    /// End the run as failed.
    pub fn fail(&self) {
        self.end(RunOutcome::Failed);
    }

    fn prepare_end(&self, outcome: RunOutcome) -> Option<(Vec<Event>, Event)> {
        if !self.inner.traced {
            self.inner.ended.store(true, Ordering::Release);
            return None;
        }
        if self
            .inner
            .ended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(run_id = %self.inner.run_id, "run already ended, ignoring duplicate run_end");
            return None;
        }

        let buffered = match &self.inner.buffer {
            Some(buffer) => {
                let mut buffer = buffer.lock().unwrap();
                if outcome == RunOutcome::Failed {
                    std::mem::take(&mut *buffer)
                } else {
                    // Completed run in only-on-error mode: the whole run is
                    // discarded, terminator included.
                    buffer.clear();
                    return None;
                }
            }
            None => Vec::new(),
        };

        let event_id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let mut run_end = Event::new(
            self.inner.run_id.clone(),
            event_id,
            EventPayload::RunEnd {
                final_status: outcome,
            },
        );
        run_end.duration_ms = Some(now_ms() - self.inner.started_at_ms);
        Some((buffered, run_end))
    }

    fn end(&self, outcome: RunOutcome) {
        if let Some((buffered, run_end)) = self.prepare_end(outcome) {
            for event in buffered {
                self.inner.queue.try_emit(event);
            }
            if self.inner.block_on_run_end {
                self.inner
                    .queue
                    .emit_critical_blocking(run_end, self.inner.run_end_block_timeout);
            } else {
                self.inner.queue.try_emit(run_end);
            }
        }
    }

    async fn end_async(&self, outcome: RunOutcome) {
        if let Some((buffered, run_end)) = self.prepare_end(outcome) {
            for event in buffered {
                self.inner.queue.try_emit(event);
            }
            if self.inner.block_on_run_end {
                self.inner
                    .queue
                    .emit_critical(run_end, self.inner.run_end_block_timeout)
                    .await;
            } else {
                self.inner.queue.try_emit(run_end);
            }
        }
    }

    /// End variant for drop guards. Must never block the calling thread:
    /// guards run inside `Drop`, which on the abnormal path can fire on a
    /// runtime worker thread mid-cancellation. The bounded wait for the
    /// terminator moves to a detached task when a runtime is present;
    /// without one the synchronous bounded wait is safe.
    fn end_detached(&self, outcome: RunOutcome) {
        if let Some((buffered, run_end)) = self.prepare_end(outcome) {
            for event in buffered {
                self.inner.queue.try_emit(event);
            }
            if !self.inner.block_on_run_end {
                self.inner.queue.try_emit(run_end);
                return;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let queue = self.inner.queue.clone();
                    let timeout = self.inner.run_end_block_timeout;
                    handle.spawn(async move {
                        queue.emit_critical(run_end, timeout).await;
                    });
                }
                Err(_) => {
                    self.inner
                        .queue
                        .emit_critical_blocking(run_end, self.inner.run_end_block_timeout);
                }
            }
        }
    }
}

/// Pops the parent-event stack when dropped.
pub struct ParentGuard {
    ctx: RunContext,
}

impl Drop for ParentGuard {
    fn drop(&mut self) {
        self.ctx.inner.parent_events.lock().unwrap().pop();
    }
}

/// Emits the abnormal-exit pair (`error` + `run_end(failed)`) unless the
/// scope finished normally and disarmed it. Covers panics and dropped
/// (cancelled) futures alike.
struct ScopeGuard {
    ctx: RunContext,
    armed: bool,
}

impl ScopeGuard {
    fn new(ctx: RunContext) -> Self {
        Self { ctx, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (error_type, message) = if std::thread::panicking() {
            ("Panic", "run scope panicked")
        } else {
            ("RunCancelled", "run scope dropped before completion")
        };
        self.ctx.error(error_type, message, true, None);
        self.ctx.end_detached(RunOutcome::Failed);
    }
}

/// Pops the thread-local active stack when dropped.
struct ThreadActiveGuard;

impl Drop for ThreadActiveGuard {
    fn drop(&mut self) {
        THREAD_ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct TraceInner {
    config: TraceConfig,
    queue: EventQueue,
    worker: Worker,
    sampler: Arc<dyn Sampler>,
}

/// Main tracing handle. Cheap to clone and share.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    /// Build a trace instance backed by the SQLite storage exporter.
    pub async fn new(config: TraceConfig) -> Result<Self> {
        config.validate()?;
        let (queue, rx, counters) = EventQueue::bounded(config.queue_size);
        let exporter = Arc::new(StorageExporter::connect(&config, Arc::clone(&counters)).await?);
        exporter.initialize().await?;
        let worker = Worker::spawn(rx, exporter, counters, &config);
        Ok(Self {
            inner: Arc::new(TraceInner {
                queue,
                worker,
                sampler: Arc::new(HashSampler),
                config,
            }),
        })
    }

    /// Build a trace instance with a custom exporter and/or sampler.
    pub async fn with_exporter(
        config: TraceConfig,
        exporter: Arc<dyn Exporter>,
        sampler: Option<Arc<dyn Sampler>>,
    ) -> Result<Self> {
        config.validate()?;
        exporter.initialize().await?;
        let (queue, rx, counters) = EventQueue::bounded(config.queue_size);
        let worker = Worker::spawn(rx, exporter, counters, &config);
        Ok(Self {
            inner: Arc::new(TraceInner {
                queue,
                worker,
                sampler: sampler.unwrap_or_else(|| Arc::new(HashSampler)),
                config,
            }),
        })
    }

    pub fn config(&self) -> &TraceConfig {
        &self.inner.config
    }

    /// Queue and drop-counter snapshot for diagnostics.
    pub fn queue_stats(&self) -> QueueSnapshot {
        self.inner.queue.snapshot()
    }

    /// Start a run explicitly. Prefer [`Trace::scope`] / [`Trace::scope_async`],
    /// which guarantee the terminator on every exit path.
    pub fn start_run(&self, name: &str, opts: RunOptions) -> RunContext {
        self.start_run_with_parent(name, opts, None)
    }

    fn start_run_with_parent(
        &self,
        name: &str,
        opts: RunOptions,
        parent: Option<&RunContext>,
    ) -> RunContext {
        let run_id = uuid::Uuid::new_v4().to_string();
        let config = &self.inner.config;
        // The sampling decision is made once per run; nested runs inherit
        // the parent's decision so run trees stay coherent.
        let traced = match parent {
            Some(parent) => parent.is_traced(),
            None => self
                .inner
                .sampler
                .should_sample(&run_id, name, config),
        };

        let buffer = (config.only_on_error && traced).then(|| StdMutex::new(Vec::new()));

        let ctx = RunContext {
            inner: Arc::new(RunInner {
                run_id,
                name: name.to_string(),
                traced,
                started_at_ms: now_ms(),
                queue: self.inner.queue.clone(),
                seq: AtomicU64::new(0),
                ended: AtomicBool::new(false),
                parent_events: StdMutex::new(Vec::new()),
                buffer,
                block_on_run_end: config.block_on_run_end,
                run_end_block_timeout: Duration::from_millis(config.run_end_block_timeout_ms),
            }),
        };

        if let Some(event) = ctx.stamp(EventPayload::RunStart {
            name: name.to_string(),
            user_id: opts.user_id,
            session_id: opts.session_id,
            parent_run_id: parent.map(|p| p.run_id().to_string()),
        }) {
            let mut event = event;
            event.metadata = opts.metadata;
            ctx.dispatch(event);
        }
        ctx
    }

    /// Run `f` inside a traced scope. `run_end(completed)` is emitted on
    /// normal return; a panic emits `error` + `run_end(failed)` before
    /// unwinding continues.
    pub fn scope<T>(&self, name: &str, opts: RunOptions, f: impl FnOnce(&RunContext) -> T) -> T {
        let parent = get_active_context();
        let ctx = self.start_run_with_parent(name, opts, parent.as_ref());
        THREAD_ACTIVE.with(|stack| stack.borrow_mut().push(ctx.clone()));
        let _active = ThreadActiveGuard;

        let guard = ScopeGuard::new(ctx.clone());
        let out = f(&ctx);
        guard.disarm();
        ctx.end(RunOutcome::Completed);
        out
    }

    /// Async counterpart of [`Trace::scope`]. The context is visible through
    /// [`get_active_context`] for the duration of the future, including
    /// across await points and thread migrations. Dropping the future before
    /// completion takes the abnormal path.
    pub async fn scope_async<T, Fut>(
        &self,
        name: &str,
        opts: RunOptions,
        f: impl FnOnce(RunContext) -> Fut,
    ) -> T
    where
        Fut: std::future::Future<Output = T>,
    {
        let parent = get_active_context();
        let ctx = self.start_run_with_parent(name, opts, parent.as_ref());
        let guard = ScopeGuard::new(ctx.clone());

        let out = with_task_active(ctx.clone(), f(ctx.clone())).await;

        guard.disarm();
        ctx.end_async(RunOutcome::Completed).await;
        out
    }

    /// The innermost active run context of the current task or thread.
    pub fn active_context(&self) -> Option<RunContext> {
        get_active_context()
    }

    // Convenience emitters that resolve the active context.

    pub fn llm(
        &self,
        model: &str,
        prompt: impl Into<Value>,
        response: impl Into<Value>,
    ) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.llm(model, prompt, response, None, None),
            None => {
                warn!("no active run context for llm event");
                None
            }
        }
    }

    pub fn tool(&self, tool_name: &str, tool_args: Value, tool_result: Value) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.tool(tool_name, tool_args, tool_result),
            None => {
                warn!("no active run context for tool event");
                None
            }
        }
    }

    pub fn memory_read(
        &self,
        memory_key: &str,
        memory_value: Value,
        memory_type: &str,
    ) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.memory_read(memory_key, memory_value, memory_type),
            None => {
                warn!("no active run context for memory read event");
                None
            }
        }
    }

    pub fn memory_write(
        &self,
        memory_key: &str,
        memory_value: Value,
        memory_type: &str,
        overwrite: bool,
    ) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.memory_write(memory_key, memory_value, memory_type, overwrite),
            None => {
                warn!("no active run context for memory write event");
                None
            }
        }
    }

    pub fn error(&self, error_type: &str, error_message: &str) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.error(error_type, error_message, false, None),
            None => {
                warn!("no active run context for error event");
                None
            }
        }
    }

    pub fn custom(&self, name: &str, payload: Value) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.custom(name, payload),
            None => {
                warn!("no active run context for custom event");
                None
            }
        }
    }

    pub fn final_answer(&self, answer: &str) -> Option<u64> {
        match get_active_context() {
            Some(ctx) => ctx.final_answer(answer),
            None => {
                warn!("no active run context for final answer");
                None
            }
        }
    }

    /// Drain the queue and stop the worker. Idempotent; events emitted after
    /// shutdown are dropped.
    pub async fn shutdown(&self) {
        self.inner.worker.shutdown().await;
    }
}

/// Push a context for the duration of a future, creating the task-local
/// stack when this is the outermost scope of the task.
async fn with_task_active<T>(
    ctx: RunContext,
    fut: impl std::future::Future<Output = T>,
) -> T {
    let nested = TASK_ACTIVE
        .try_with(|stack| stack.borrow_mut().push(ctx.clone()))
        .is_ok();
    if nested {
        struct PopGuard;
        impl Drop for PopGuard {
            fn drop(&mut self) {
                let _ = TASK_ACTIVE.try_with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }
        let _pop = PopGuard;
        fut.await
    } else {
        TASK_ACTIVE.scope(RefCell::new(vec![ctx]), fut).await
    }
}

/// The innermost active run context: the task-local stack wins, then the
/// thread-local stack for straight-line code.
pub fn get_active_context() -> Option<RunContext> {
    if let Ok(Some(ctx)) = TASK_ACTIVE.try_with(|stack| stack.borrow().last().cloned()) {
        return Some(ctx);
    }
    THREAD_ACTIVE.with(|stack| stack.borrow().last().cloned())
}

static GLOBAL_TRACE: Lazy<RwLock<Option<Trace>>> = Lazy::new(|| RwLock::new(None));

/// Process-wide default instance, created lazily from the environment
/// configuration on first use. Prefer explicit construction at the edges;
/// the default exists for simple callers and tests.
pub async fn get_trace() -> Result<Trace> {
    if let Some(trace) = GLOBAL_TRACE.read().unwrap().clone() {
        return Ok(trace);
    }
    let trace = Trace::new(TraceConfig::load()?).await?;
    let mut slot = GLOBAL_TRACE.write().unwrap();
    if let Some(existing) = slot.clone() {
        return Ok(existing);
    }
    *slot = Some(trace.clone());
    Ok(trace)
}

/// Inject (or clear) the process-wide default instance.
pub fn set_trace(trace: Option<Trace>) {
    *GLOBAL_TRACE.write().unwrap() = trace;
}
