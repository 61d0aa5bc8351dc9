//! Exporter contract and the composite fan-out implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::Result;
use crate::events::Event;

/// Consumer of event batches. The storage exporter is the default
/// implementation; remote backends plug in through the same seam.
///
/// `export_batch` must be safe to call repeatedly and report per-batch
/// success; individual event failures are handled (and logged) inside the
/// implementation.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn export_batch(&self, events: &[Event]) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
}

/// Fans a batch out to several exporters in order. One failing exporter is
/// logged and does not keep the rest from receiving the batch; shutdown runs
/// in reverse order.
pub struct CompositeExporter {
    exporters: Vec<Arc<dyn Exporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Arc<dyn Exporter>>) -> Self {
        assert!(
            !exporters.is_empty(),
            "CompositeExporter requires at least one exporter"
        );
        Self { exporters }
    }
}

#[async_trait]
impl Exporter for CompositeExporter {
    async fn initialize(&self) -> Result<()> {
        for (i, exporter) in self.exporters.iter().enumerate() {
            exporter.initialize().await.map_err(|e| {
                error!(exporter = i, "composite exporter initialization failed: {e}");
                e
            })?;
        }
        Ok(())
    }

    async fn export_batch(&self, events: &[Event]) -> Result<()> {
        for (i, exporter) in self.exporters.iter().enumerate() {
            if let Err(e) = exporter.export_batch(events).await {
                error!(
                    exporter = i,
                    batch_len = events.len(),
                    "composite exporter failed on batch: {e}"
                );
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        for (i, exporter) in self.exporters.iter().enumerate().rev() {
            if let Err(e) = exporter.shutdown().await {
                error!(exporter = i, "composite exporter shutdown error: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::TraceError;
    use tokio::sync::Mutex;

    /// Capturing exporter for tests: records every batch, optionally failing
    /// a fixed number of export calls first or stalling each export for a
    /// configured duration.
    pub struct MockExporter {
        pub batches: Mutex<Vec<Vec<Event>>>,
        pub fail_next: Mutex<usize>,
        pub shutdowns: Mutex<usize>,
        pub export_delay: Mutex<std::time::Duration>,
    }

    impl MockExporter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail_next: Mutex::new(0),
                shutdowns: Mutex::new(0),
                export_delay: Mutex::new(std::time::Duration::ZERO),
            })
        }

        pub fn failing(times: usize) -> Arc<Self> {
            let m = Self::new();
            *m.fail_next.try_lock().unwrap() = times;
            m
        }

        pub fn stalling(delay: std::time::Duration) -> Arc<Self> {
            let m = Self::new();
            *m.export_delay.try_lock().unwrap() = delay;
            m
        }

        pub async fn exported(&self) -> Vec<Event> {
            self.batches
                .lock()
                .await
                .iter()
                .flat_map(|b| b.iter().cloned())
                .collect()
        }
    }

    #[async_trait]
    impl Exporter for MockExporter {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn export_batch(&self, events: &[Event]) -> Result<()> {
            let delay = *self.export_delay.lock().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut fail = self.fail_next.lock().await;
            if *fail > 0 {
                *fail -= 1;
                return Err(TraceError::StoreFatal("mock export failure".into()));
            }
            self.batches.lock().await.push(events.to_vec());
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            *self.shutdowns.lock().await += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockExporter;
    use super::*;
    use crate::events::EventPayload;
    use serde_json::json;

    fn event(i: u64) -> Event {
        Event::new(
            "run-x",
            i,
            EventPayload::Custom {
                name: "probe".into(),
                payload: json!({"i": i}),
            },
        )
    }

    #[tokio::test]
    async fn composite_delivers_to_all_despite_failure() {
        let failing = MockExporter::failing(1);
        let healthy = MockExporter::new();
        let composite = CompositeExporter::new(vec![
            failing.clone() as Arc<dyn Exporter>,
            healthy.clone() as Arc<dyn Exporter>,
        ]);

        composite.initialize().await.unwrap();
        composite.export_batch(&[event(0), event(1)]).await.unwrap();

        assert_eq!(failing.exported().await.len(), 0);
        assert_eq!(healthy.exported().await.len(), 2);
    }

    #[tokio::test]
    async fn composite_shutdown_reaches_every_exporter() {
        let a = MockExporter::new();
        let b = MockExporter::new();
        let composite = CompositeExporter::new(vec![
            a.clone() as Arc<dyn Exporter>,
            b.clone() as Arc<dyn Exporter>,
        ]);
        composite.shutdown().await.unwrap();
        assert_eq!(*a.shutdowns.lock().await, 1);
        assert_eq!(*b.shutdowns.lock().await, 1);
    }
}
