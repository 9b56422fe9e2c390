//! Roaming detection, session reconstruction, pattern mining and the
//! history query engine.

pub mod detector;
pub mod history;
pub mod patterns;
pub mod sessions;

pub use detector::{ClientObservation, RoamingDetector};
pub use history::{
    CacheStats, FlowDiagram, FlowEdge, HeatmapCell, HistoryQuery, HistoryResult,
    HistoryStatistics, RoamingHistoryEngine, SortOrder, TimelinePoint,
};
pub use patterns::{detect_anomalies, mine_patterns};
pub use sessions::build_sessions;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tracing::warn;
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
    WifiMode,
};

/// Cache prune cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Feeds WiFi client observations from device state into the detector and
/// publishes detected roaming events on the bus.
pub struct RoamingService {
    detector: Arc<RoamingDetector>,
    history: Arc<RoamingHistoryEngine>,
    bus: Arc<EventBus>,
    handle: ServiceHandle,
}

impl RoamingService {
    pub fn new(
        detector: Arc<RoamingDetector>,
        history: Arc<RoamingHistoryEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            detector,
            history,
            bus,
            handle: ServiceHandle::new(),
        }
    }

    pub fn detector(&self) -> Arc<RoamingDetector> {
        self.detector.clone()
    }

    pub fn history(&self) -> Arc<RoamingHistoryEngine> {
        self.history.clone()
    }

    async fn handle_state(&self, msg: &types::wire::StateMsg) {
        let Some(interfaces) = &msg.interfaces else {
            return;
        };
        for iface in interfaces {
            let Some(wifi) = &iface.wifi else { continue };
            if wifi.mode != WifiMode::Sta {
                continue;
            }
            let obs = ClientObservation {
                ts_ms: msg.ts,
                client_mac: iface.mac.clone(),
                bssid: wifi.bssid.clone(),
                ssid: wifi.ssid.clone(),
                rssi: wifi.rssi,
            };
            if let Some(event) = self.detector.observe(obs).await {
                self.bus.publish(BusEvent::RoamingDetected(event));
            }
        }
    }
}

#[async_trait]
impl Service for RoamingService {
    async fn run(&self) -> Result<()> {
        let mut rx = self.bus.subscribe();
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(BusEvent::StateReceived { msg, .. }) => {
                            self.handle_state(&msg).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("roaming service lagged, skipped {n} bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = prune.tick() => {
                    self.history.prune_cache();
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
