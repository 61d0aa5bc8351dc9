//! Default exporter: maps event batches onto runs/steps rows.
//!
//! Each batch becomes one transaction. Transient store errors retry the
//! whole batch with exponential backoff; after three failed attempts the
//! batch is dropped and counted, and the worker moves on to the next one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::config::TraceConfig;
use crate::error::Result;
use crate::events::{Event, EventPayload};
use crate::exporter::Exporter;
use crate::pipeline::Pipeline;
use crate::queue::QueueCounters;
use crate::storage::{BatchOp, StepInsert, TraceStore};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Upper bound on the cached set of run ids known to exist.
const KNOWN_RUNS_CAP: usize = 4096;

pub struct StorageExporter {
    store: TraceStore,
    pipeline: Arc<Pipeline>,
    max_blob_bytes: usize,
    counters: Arc<QueueCounters>,
    known_runs: Mutex<HashSet<String>>,
}

impl StorageExporter {
    /// Open the store at `config.db_path` and build the exporter around it.
    pub async fn connect(config: &TraceConfig, counters: Arc<QueueCounters>) -> Result<Self> {
        let store = TraceStore::open(config).await?;
        Ok(Self::new(store, config, counters))
    }

    pub fn new(store: TraceStore, config: &TraceConfig, counters: Arc<QueueCounters>) -> Self {
        let pipeline = store.pipeline();
        Self {
            store,
            pipeline,
            max_blob_bytes: config.max_blob_bytes,
            counters,
            known_runs: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    /// Translate a batch into write ops, dropping events that cannot be
    /// persisted (orphans, pipeline failures, oversized blobs).
    async fn plan_batch(&self, events: &[Event]) -> Result<(Vec<BatchOp>, Vec<String>)> {
        let mut ops = Vec::with_capacity(events.len() + 2);
        let mut new_runs: Vec<String> = Vec::new();
        let mut batch_runs: HashSet<String> = HashSet::new();
        let known = self.known_runs.lock().await;

        for event in events {
            let event_type = event.event_type();

            if let EventPayload::RunStart {
                name,
                user_id,
                session_id,
                parent_run_id,
            } = &event.payload
            {
                ops.push(BatchOp::InsertRun {
                    id: event.run_id.clone(),
                    name: name.clone(),
                    started_at_ms: event.timestamp_ms,
                    user_id: user_id.clone(),
                    session_id: session_id.clone(),
                    parent_run_id: parent_run_id.clone(),
                    metadata: Value::Object(event.metadata.clone()),
                });
                batch_runs.insert(event.run_id.clone());
                new_runs.push(event.run_id.clone());
            } else if !batch_runs.contains(&event.run_id) && !known.contains(&event.run_id) {
                // A run row must exist before any of its steps commits.
                if self.store.run_exists(&event.run_id).await? {
                    batch_runs.insert(event.run_id.clone());
                } else {
                    warn!(run_id = %event.run_id, %event_type,
                        "dropping event for unknown run (no run_start seen)");
                    self.counters.record_dropped(event_type);
                    continue;
                }
            }

            let (blob, codec) = match self.pipeline.encode(event) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(event_id = event.event_id, run_id = %event.run_id,
                        "dropping event, pipeline failed: {e}");
                    self.counters.record_dropped(event_type);
                    continue;
                }
            };
            if blob.len() > self.max_blob_bytes {
                warn!(event_id = event.event_id, run_id = %event.run_id,
                    size = blob.len(), limit = self.max_blob_bytes,
                    "dropping event, blob exceeds size guard");
                self.counters.record_dropped(event_type);
                continue;
            }

            ops.push(BatchOp::InsertStep(StepInsert {
                run_id: event.run_id.clone(),
                event_id: event.event_id as i64,
                event_type: event_type.as_str().to_string(),
                name: event.payload.display_name(),
                status: event.status.as_str().to_string(),
                timestamp_ms: event.timestamp_ms,
                duration_ms: event.duration_ms,
                parent_event_id: event.parent_event_id.map(|id| id as i64),
                blob,
                blob_codec: codec.as_tag(),
            }));

            if let EventPayload::RunEnd { final_status } = &event.payload {
                ops.push(BatchOp::FinishRun {
                    run_id: event.run_id.clone(),
                    outcome: *final_status,
                    ended_at_ms: event.timestamp_ms,
                });
            }
        }

        Ok((ops, new_runs))
    }
}

#[async_trait]
impl Exporter for StorageExporter {
    async fn initialize(&self) -> Result<()> {
        self.store.ping().await
    }

    async fn export_batch(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let (ops, new_runs) = self.plan_batch(events).await?;
        if ops.is_empty() {
            return Ok(());
        }

        let mut attempt = 0u32;
        loop {
            match self.store.apply_batch(&ops).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    warn!(attempt, "store busy, retrying batch in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.counters.record_dropped_batch();
                    error!(events = events.len(), "dropping batch after {attempt} retries: {e}");
                    return Err(e);
                }
            }
        }

        let mut known = self.known_runs.lock().await;
        if known.len() > KNOWN_RUNS_CAP {
            known.clear();
        }
        known.extend(new_runs);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.store.close().await;
        Ok(())
    }
}
