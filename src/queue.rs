//! Bounded, non-blocking ingestion channel between producers and the worker.
//!
//! The hot path is `try_emit`: it either hands the event to the channel or
//! drops it and bumps a per-type counter. Only `run_end` may use the
//! bounded-wait variants, and only when `block_on_run_end` is configured.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{Event, EventType};

/// Lifecycle of the submission side. Producers may enqueue only while
/// `Accepting`; `Draining` and `Stopped` refuse new events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Accepting = 0,
    Draining = 1,
    Stopped = 2,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueState::Accepting,
            1 => QueueState::Draining,
            _ => QueueState::Stopped,
        }
    }
}

/// Shared counters, updated lock-free from both sides of the channel.
#[derive(Debug, Default)]
pub struct QueueCounters {
    queued: AtomicU64,
    processed: AtomicU64,
    dropped: [AtomicU64; EventType::ALL.len()],
    dropped_batches: AtomicU64,
    state: AtomicU8,
}

impl QueueCounters {
    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn record_dropped(&self, event_type: EventType) {
        self.dropped[event_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped_batch(&self) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_count(&self, event_type: EventType) -> u64 {
        self.dropped[event_type.index()].load(Ordering::Relaxed)
    }
}

/// Point-in-time view of queue activity, served through `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub capacity: usize,
    pub queued_total: u64,
    pub processed_total: u64,
    pub dropped_total: u64,
    pub dropped_by_type: Vec<(String, u64)>,
    pub dropped_batches: u64,
}

/// Producer half of the bounded channel.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<Event>,
    capacity: usize,
    counters: Arc<QueueCounters>,
}

impl EventQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Event>, Arc<QueueCounters>) {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(QueueCounters::default());
        (
            Self {
                tx,
                capacity,
                counters: Arc::clone(&counters),
            },
            rx,
            counters,
        )
    }

    /// Non-blocking submission. Returns whether the event was enqueued;
    /// a full or closed channel drops the event and bumps its counter.
    pub fn try_emit(&self, event: Event) -> bool {
        let event_type = event.event_type();
        if self.counters.state() != QueueState::Accepting {
            self.counters.record_dropped(event_type);
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.record_dropped(event_type);
                warn!(%event_type, capacity = self.capacity, "event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.record_dropped(event_type);
                false
            }
        }
    }

    /// Bounded-wait submission for the run terminator. Waits up to `timeout`
    /// for capacity, then drops.
    pub async fn emit_critical(&self, event: Event, timeout: Duration) -> bool {
        let event_type = event.event_type();
        if self.counters.state() != QueueState::Accepting {
            self.counters.record_dropped(event_type);
            return false;
        }
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.record_dropped(event_type);
                warn!(%event_type, "queue full past bounded wait, run terminator dropped");
                false
            }
        }
    }

    /// Synchronous counterpart of [`emit_critical`] for straight-line
    /// producers that hold no runtime. Polls `try_send` until the deadline.
    pub fn emit_critical_blocking(&self, event: Event, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut event = event;
        loop {
            let event_type = event.event_type();
            if self.counters.state() != QueueState::Accepting {
                self.counters.record_dropped(event_type);
                return false;
            }
            match self.tx.try_send(event) {
                Ok(()) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    if std::time::Instant::now() >= deadline {
                        self.counters.record_dropped(ev.event_type());
                        warn!("queue full past bounded wait, run terminator dropped");
                        return false;
                    }
                    event = ev;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(mpsc::error::TrySendError::Closed(ev)) => {
                    self.counters.record_dropped(ev.event_type());
                    return false;
                }
            }
        }
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let counters = &self.counters;
        let dropped_by_type: Vec<(String, u64)> = EventType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), counters.dropped_count(*t)))
            .filter(|(_, n)| *n > 0)
            .collect();
        QueueSnapshot {
            capacity: self.capacity,
            queued_total: counters.queued.load(Ordering::Relaxed),
            processed_total: counters.processed.load(Ordering::Relaxed),
            dropped_total: dropped_by_type.iter().map(|(_, n)| n).sum(),
            dropped_by_type,
            dropped_batches: counters.dropped_batches.load(Ordering::Relaxed),
        }
    }
}
