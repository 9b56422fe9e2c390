//! Topic router: drains the transport's inbound channel single-threaded
//! (preserving per-topic order), parses the topic grammar, validates the
//! payload against its versioned schema, and fans the typed result out on
//! the bus. Malformed traffic is counted and recorded, never fatal.

pub mod error;
pub mod schema;
pub mod topic;

pub use error::ProtocolError;
pub use topic::{parse_topic, ParsedTopic, TopicKind};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use transport::RawMessage;
use types::system_service::{Service, ServiceHandle};

/// How many recent protocol failures are kept for diagnostics.
const ERROR_RING_CAPACITY: usize = 100;

/// A validation failure with the offending payload preserved.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub topic: String,
    pub error: ProtocolError,
    pub payload: Vec<u8>,
    pub ts_ms: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    pub routed: u64,
    pub skipped: u64,
    pub rejected: u64,
}

pub struct RouterService {
    inbound: Mutex<mpsc::Receiver<RawMessage>>,
    bus: Arc<EventBus>,
    routed: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    recent_errors: Mutex<VecDeque<ErrorRecord>>,
    handle: ServiceHandle,
}

impl RouterService {
    pub fn new(inbound: mpsc::Receiver<RawMessage>, bus: Arc<EventBus>) -> Self {
        Self {
            inbound: Mutex::new(inbound),
            bus,
            routed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            handle: ServiceHandle::new(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub async fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.lock().await.iter().cloned().collect()
    }

    async fn record_error(&self, msg: &RawMessage, error: ProtocolError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(topic = %msg.topic, "rejected message: {error}");
        let mut ring = self.recent_errors.lock().await;
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ErrorRecord {
            topic: msg.topic.clone(),
            error,
            payload: msg.payload.clone(),
            ts_ms: msg.received_at,
        });
    }

    async fn handle_message(&self, msg: RawMessage) {
        let parsed = match topic::parse_topic(&msg.topic) {
            Ok(p) => p,
            Err(e) => {
                self.record_error(&msg, e).await;
                return;
            }
        };

        match schema::classify(&parsed, &msg.topic, &msg.payload, types::now_ms()) {
            Ok(Some(event)) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                self.bus.publish(event);
            }
            Ok(None) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %msg.topic, "skipped non-inbound traffic");
            }
            Err(e) => {
                self.record_error(&msg, e).await;
            }
        }
    }
}

#[async_trait]
impl Service for RouterService {
    async fn run(&self) -> Result<()> {
        let mut inbound = self.inbound.lock().await;
        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
                _ = self.handle.wait_for_cancel() => break,
            }
        }
        Ok(())
    }

    fn handle(&self) -> Option<&ServiceHandle> {
        Some(&self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::events::BusEvent;

    #[tokio::test]
    async fn routes_valid_state_to_bus() {
        let (tx, rx) = mpsc::channel(8);
        let bus = Arc::new(EventBus::with_capacity(8));
        let mut bus_rx = bus.subscribe();
        let router = Arc::new(RouterService::new(rx, bus));

        tx.send(RawMessage {
            topic: "rtk/v1/home/main/aabbccddeeff/state".into(),
            payload: br#"{"schema":"state/1.0","ts":1700000000000,"health":"ok"}"#.to_vec(),
            received_at: types::now_ms(),
        })
        .await
        .unwrap();
        drop(tx);

        router.run().await.unwrap();
        assert!(matches!(
            bus_rx.recv().await.unwrap(),
            BusEvent::StateReceived { .. }
        ));
        assert_eq!(router.stats().routed, 1);
    }

    #[tokio::test]
    async fn records_rejects_with_payload() {
        let (tx, rx) = mpsc::channel(8);
        let bus = Arc::new(EventBus::with_capacity(8));
        let router = Arc::new(RouterService::new(rx, bus));

        tx.send(RawMessage {
            topic: "rtk/v1/home/main/aabbccddeeff/state".into(),
            payload: b"not json".to_vec(),
            received_at: types::now_ms(),
        })
        .await
        .unwrap();
        drop(tx);

        router.run().await.unwrap();
        let errors = router.recent_errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload, b"not json".to_vec());
        assert_eq!(router.stats().rejected, 1);
    }
}
