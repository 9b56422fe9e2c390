use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use storage::Store;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;
use types::DeviceEvent;

use crate::handler::EventHandler;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EventStats {
    pub total: u64,
    pub pending: u64,
    pub queue_full_drops: u64,
    pub by_severity: HashMap<String, u64>,
    pub by_type: HashMap<String, u64>,
}

/// Bounded FIFO in front of durable event storage. Enqueue never blocks:
/// when the queue is full the newest event is dropped and counted.
pub struct EventProcessor {
    store: Store,
    tx: mpsc::Sender<DeviceEvent>,
    rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    queue_full: AtomicU64,
    stats: RwLock<EventStats>,
}

impl EventProcessor {
    pub fn new(store: Store, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            store,
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: RwLock::new(Vec::new()),
            queue_full: AtomicU64::new(0),
            stats: RwLock::new(EventStats::default()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Non-blocking enqueue, called from the bus consumer.
    pub fn enqueue(&self, event: DeviceEvent) {
        if self.tx.try_send(event).is_err() {
            self.queue_full.fetch_add(1, Ordering::Relaxed);
            warn!("event queue full, dropping newest event");
        }
    }

    /// Take the receiver half; the worker owns it for the process lifetime.
    pub async fn take_queue(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        self.rx.lock().await.take()
    }

    /// Persist, dispatch to matching handlers (best effort), then rewrite
    /// the record as processed.
    pub async fn process(&self, mut event: DeviceEvent) {
        if let Err(e) = self.store.put_json(event.storage_key(), &event) {
            warn!("failed to persist event {}: {e}", event.id);
            return;
        }

        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if !handler.can_handle(&event.event_type) {
                continue;
            }
            if let Err(e) = handler.handle(&event).await {
                warn!(handler = handler.name(), "event handler failed: {e}");
            }
        }

        event.processed = true;
        event.processed_at = Some(types::now_ms());
        if let Err(e) = self.store.put_json(event.storage_key(), &event) {
            warn!("failed to mark event {} processed: {e}", event.id);
        }
    }

    /// Full-scan statistics refresh; run periodically, not per event.
    pub async fn refresh_stats(&self) {
        let mut stats = EventStats {
            queue_full_drops: self.queue_full.load(Ordering::Relaxed),
            ..EventStats::default()
        };
        for (_, bytes) in self.store.iterate_prefix(storage::keys::EVENT_PREFIX) {
            let Ok(event) = serde_json::from_slice::<DeviceEvent>(&bytes) else {
                continue;
            };
            stats.total += 1;
            if !event.processed {
                stats.pending += 1;
            }
            *stats
                .by_severity
                .entry(event.severity.to_string())
                .or_default() += 1;
            *stats.by_type.entry(event.event_type.clone()).or_default() += 1;
        }
        *self.stats.write().await = stats;
    }

    pub async fn stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// Events in `[from_ms, to_ms)`, oldest first.
    pub fn events_in_range(&self, from_ms: i64, to_ms: i64) -> Vec<DeviceEvent> {
        let (start, end) = storage::keys::event_range(from_ms, to_ms);
        self.store
            .iterate_range(&start, &end)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use miette::Result;
    use std::sync::atomic::AtomicUsize;
    use types::{DeviceId, Severity};

    struct CountingHandler {
        hits: AtomicUsize,
        only: &'static str,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }
        fn can_handle(&self, event_type: &str) -> bool {
            event_type == self.only
        }
        async fn handle(&self, _event: &DeviceEvent) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(ts: i64, kind: &str) -> DeviceEvent {
        DeviceEvent::new(
            DeviceId::new("home", "main", "aabbccddeeff"),
            kind,
            "rtk/v1/home/main/aabbccddeeff/evt/system",
            ts,
            Severity::Info,
        )
    }

    #[tokio::test]
    async fn process_persists_dispatches_and_marks() {
        let processor = EventProcessor::new(Store::new(), 10);
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
            only: "boot",
        });
        processor.register_handler(handler.clone()).await;
        processor
            .register_handler(Arc::new(crate::handler::LogHandler))
            .await;

        processor.process(event(1_700_000_000_000, "boot")).await;
        processor.process(event(1_700_000_000_001, "other")).await;

        // Selective dispatch.
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);

        // Both events stored and marked processed.
        let stored = processor.events_in_range(1_700_000_000_000, 1_700_000_001_000);
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|e| e.processed && e.processed_at.is_some()));
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let processor = EventProcessor::new(Store::new(), 2);
        for i in 0..5 {
            processor.enqueue(event(1_700_000_000_000 + i, "boot"));
        }
        processor.refresh_stats().await;
        assert_eq!(processor.stats().await.queue_full_drops, 3);

        // The two oldest enqueues survived.
        let mut rx = processor.take_queue().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().ts_ms, 1_700_000_000_000);
        assert_eq!(rx.recv().await.unwrap().ts_ms, 1_700_000_000_001);
    }

    #[tokio::test]
    async fn stats_aggregate_by_severity_and_type() {
        let processor = EventProcessor::new(Store::new(), 10);
        processor.process(event(1, "boot")).await;
        processor.process(event(2, "boot")).await;
        processor.process(event(3, "roam")).await;
        processor.refresh_stats().await;

        let stats = processor.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.by_type["boot"], 2);
        assert_eq!(stats.by_severity["info"], 3);
    }
}
