//! tracevault — local-first observability for AI agents.
//!
//! Instrumented code emits semantic events (LLM calls, tool invocations,
//! memory access, errors, final answers) through the [`Trace`] facade. A
//! bounded queue decouples the hot path from a single background worker,
//! which batches events through the processing pipeline (redaction,
//! canonical JSON, optional gzip and AES-256-GCM) into a SQLite store. The
//! HTTP API and CLI read the same store back through the query surface on
//! [`TraceStore`].
//!
//! ```no_run
//! use tracevault::{RunOptions, Trace, TraceConfig};
//!
//! # async fn demo() -> tracevault::Result<()> {
//! let trace = Trace::new(TraceConfig::load()?).await?;
//! trace
//!     .scope_async("book-flight", RunOptions::default(), |ctx| async move {
//!         ctx.llm("gpt-4", "find flights", "found 3", Some(128), None);
//!         ctx.tool("search", serde_json::json!({"q": "SFO"}), serde_json::json!({"hits": 3}));
//!         ctx.final_answer("booked");
//!     })
//!     .await;
//! trace.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod pipeline;
pub mod queue;
pub mod sampler;
pub mod server;
pub mod storage;
pub mod trace;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::{Profile, TraceConfig};
pub use error::{Result, TraceError};
pub use events::{Event, EventPayload, EventStatus, EventType, RunOutcome};
pub use exporter::{CompositeExporter, Exporter};
pub use pipeline::{BlobCodec, Pipeline, REDACTION_MARKER};
pub use sampler::{HashSampler, Sampler};
pub use storage::{ListRunsFilter, StorageExporter, TraceStore};
pub use trace::{get_active_context, get_trace, set_trace, RunContext, RunOptions, Trace};
