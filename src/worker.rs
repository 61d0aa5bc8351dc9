//! Background batching worker: drains the queue, hands batches to the
//! exporter, and owns the drain-then-stop shutdown sequence.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TraceConfig;
use crate::events::Event;
use crate::exporter::Exporter;
use crate::queue::{QueueCounters, QueueState};

/// Hard ceiling on the shutdown drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// Handle to the single background worker of a `Trace` instance.
pub struct Worker {
    state: Arc<AtomicU8>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn the worker task. Exactly one worker runs per trace instance.
    pub fn spawn(
        mut rx: mpsc::Receiver<Event>,
        exporter: Arc<dyn Exporter>,
        counters: Arc<QueueCounters>,
        config: &TraceConfig,
    ) -> Self {
        let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let batch_size = config.batch_size;
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        let loop_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            loop_state.store(WorkerState::Running as u8, Ordering::Release);
            debug!("trace worker started");

            loop {
                let first = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = tokio::time::timeout(batch_timeout, rx.recv()) => {
                        match received {
                            Ok(Some(event)) => event,
                            // All senders gone: drain whatever is buffered.
                            Ok(None) => break,
                            Err(_elapsed) => continue,
                        }
                    }
                };

                let mut batch = Vec::with_capacity(batch_size);
                batch.push(first);
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(event) => batch.push(event),
                        Err(_) => break,
                    }
                }
                export_batch(&*exporter, &counters, batch).await;
            }

            // Drain phase: refuse new submissions, flush the backlog under a
            // hard deadline, then release the exporter.
            loop_state.store(WorkerState::Draining as u8, Ordering::Release);
            counters.set_state(QueueState::Draining);
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

            let mut remaining = Vec::new();
            loop {
                if tokio::time::Instant::now() >= deadline {
                    let left = rx.len();
                    if left > 0 {
                        warn!(dropped = left, "drain deadline reached, dropping buffered events");
                    }
                    break;
                }
                match rx.try_recv() {
                    Ok(event) => {
                        remaining.push(event);
                        if remaining.len() == batch_size {
                            export_batch(&*exporter, &counters, std::mem::take(&mut remaining))
                                .await;
                        }
                    }
                    Err(_) => break,
                }
            }
            if !remaining.is_empty() {
                export_batch(&*exporter, &counters, remaining).await;
            }

            if let Err(e) = exporter.shutdown().await {
                error!("exporter shutdown failed: {e}");
            }
            counters.set_state(QueueState::Stopped);
            loop_state.store(WorkerState::Stopped as u8, Ordering::Release);
            info!("trace worker stopped");
        });

        Self {
            state,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Signal the worker to drain and wait for it to stop. Idempotent: the
    /// second and later calls return once the first has finished.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            // Drain is bounded by DRAIN_TIMEOUT inside the task; the extra
            // second covers the final exporter flush.
            match tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("trace worker task panicked: {e}"),
                Err(_) => warn!("trace worker did not stop within the drain deadline"),
            }
        }
    }
}

async fn export_batch(exporter: &dyn Exporter, counters: &QueueCounters, batch: Vec<Event>) {
    let len = batch.len() as u64;
    match exporter.export_batch(&batch).await {
        Ok(()) => {
            counters.record_processed(len);
            debug!(events = len, "flushed batch");
        }
        // The worker never dies on a batch failure.
        Err(e) => error!(events = len, "failed to export batch: {e}"),
    }
}
