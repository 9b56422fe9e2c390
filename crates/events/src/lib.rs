//! Event processor: bounded queue in front of durable event storage with
//! handler fan-out.

mod handler;
mod processor;

pub use handler::{EventHandler, LogHandler};
pub use processor::{EventProcessor, EventStats};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tracing::warn;
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
    DeviceEvent,
};

/// Statistics are refreshed by full scan on this cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub struct EventService {
    processor: Arc<EventProcessor>,
    bus: Arc<EventBus>,
    handle: ServiceHandle,
}

impl EventService {
    pub fn new(processor: Arc<EventProcessor>, bus: Arc<EventBus>) -> Self {
        Self {
            processor,
            bus,
            handle: ServiceHandle::new(),
        }
    }

    pub fn processor(&self) -> Arc<EventProcessor> {
        self.processor.clone()
    }
}

#[async_trait]
impl Service for EventService {
    async fn init(&self) -> Result<()> {
        self.processor
            .register_handler(Arc::new(LogHandler))
            .await;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut bus_rx = self.bus.subscribe();
        let Some(mut queue) = self.processor.take_queue().await else {
            // Another worker generation already owns the queue.
            self.handle.wait_for_cancel().await;
            return Ok(());
        };
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = bus_rx.recv() => {
                    match event {
                        Ok(BusEvent::EventReceived { device, topic, msg }) => {
                            let mut record = DeviceEvent::new(
                                device,
                                msg.event_type.clone(),
                                topic,
                                msg.ts,
                                msg.severity,
                            );
                            record.message = msg.message.clone();
                            record.data = msg.data.clone();
                            self.processor.enqueue(record);
                        }
                        // Quality anomalies become durable events too.
                        Ok(BusEvent::AnomalyDetected(anomaly)) => {
                            let mut record = DeviceEvent::new(
                                anomaly.device_id.clone(),
                                format!("anomaly.{}", anomaly.kind),
                                "internal/quality",
                                anomaly.ts_ms,
                                types::Severity::Warning,
                            );
                            record.message = Some(anomaly.detail.clone());
                            record.data = serde_json::to_value(&anomaly)
                                .unwrap_or(serde_json::Value::Null);
                            self.processor.enqueue(record);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("event service lagged, skipped {n} bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                queued = queue.recv() => {
                    match queued {
                        Some(event) => self.processor.process(event).await,
                        None => break,
                    }
                }
                _ = stats_tick.tick() => {
                    self.processor.refresh_stats().await;
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
