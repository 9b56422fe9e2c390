use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use miette::Result;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::Duration;
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
};

/// Default bus depth. A lagging subscriber skips the oldest events rather
/// than blocking the publisher; the skip count shows up in `BusStats`.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    handle: ServiceHandle,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    // Keep one receiver alive so the channel never closes between
    // subscriber generations.
    _keep_alive_rx: Arc<Mutex<Option<broadcast::Receiver<BusEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = broadcast::channel(capacity);
        Self {
            tx,
            handle: ServiceHandle::new(),
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            _keep_alive_rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish never blocks and never propagates errors to the caller;
    /// a send failure is counted and logged.
    pub fn publish(&self, event: BusEvent) {
        match self.tx.send(event) {
            Ok(_) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("bus publish failed (no live subscribers?): {e}");
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for EventBus {
    async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {},
                _ = self.handle.wait_for_cancel() => {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        *self._keep_alive_rx.lock().await = None;
        Ok(())
    }

    fn handle(&self) -> Option<&ServiceHandle> {
        Some(&self.handle)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            handle: self.handle.clone(),
            published: self.published.clone(),
            dropped: self.dropped.clone(),
            _keep_alive_rx: self._keep_alive_rx.clone(),
        }
    }
}
