//! Connection inference engine, topology manager and quality monitors.

pub mod algorithms;
pub mod fusion;
mod manager;
mod quality;

pub use algorithms::{Algorithm, Candidate, ModelView};
pub use manager::TopologyManager;
pub use quality::{EdgeQuality, QualityMonitor, QualitySample};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tokio::sync::mpsc;
use tracing::warn;
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
};

/// Runs inference on a timer and on model-change triggers. Triggers that
/// arrive during a run are coalesced into a single follow-up run.
pub struct InferenceService {
    topology: Arc<TopologyManager>,
    quality: Arc<QualityMonitor>,
    bus: Arc<EventBus>,
    interval: Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    handle: ServiceHandle,
}

impl InferenceService {
    pub fn new(
        topology: Arc<TopologyManager>,
        quality: Arc<QualityMonitor>,
        bus: Arc<EventBus>,
        cfg: &config::InferenceConfig,
    ) -> Self {
        // Depth 1: a pending trigger already covers any number of new ones.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            topology,
            quality,
            bus,
            interval: Duration::from_secs(cfg.interval_s),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
            handle: ServiceHandle::new(),
        }
    }

    pub fn topology(&self) -> Arc<TopologyManager> {
        self.topology.clone()
    }

    pub fn quality(&self) -> Arc<QualityMonitor> {
        self.quality.clone()
    }

    async fn run_cycle(&self) {
        let now = types::now_ms();
        if let Some(hash) = self.topology.run_inference(now).await {
            self.bus.publish(BusEvent::TopologyChanged { hash });
        }

        let snapshot = self.topology.get_current_topology().await;
        let anomalies = self
            .quality
            .evaluate(&snapshot.devices, &snapshot.connections, now)
            .await;
        for anomaly in anomalies {
            self.bus.publish(BusEvent::AnomalyDetected(anomaly));
        }
    }
}

#[async_trait]
impl Service for InferenceService {
    async fn run(&self) -> Result<()> {
        let mut bus_rx = self.bus.subscribe();
        let mut trigger_rx = self.trigger_rx.lock().await;
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = bus_rx.recv() => {
                    match event {
                        Ok(
                            BusEvent::ModelChanged { .. }
                            | BusEvent::DeviceRegistered { .. }
                            | BusEvent::DeviceRemoved { .. }
                        ) => {
                            // Full channel means a run is already owed.
                            let _ = self.trigger_tx.try_send(());
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("inference service lagged, skipped {n} bus events");
                            let _ = self.trigger_tx.try_send(());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    self.run_cycle().await;
                }
                Some(()) = trigger_rx.recv() => {
                    self.run_cycle().await;
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
