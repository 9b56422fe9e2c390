//! Device & identity manager: ingests `state`, `attr` and `lwt` traffic,
//! maintains the device mapping and flips online/offline by LWT or
//! staleness.

mod error;
mod manager;

pub use error::{DeviceError, DeviceResult};
pub use manager::{ApplyOutcome, DeviceFilter, DeviceManager, DeviceStats, SharedDeviceManager};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tracing::{debug, warn};
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
};

/// How often the staleness sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct DeviceService {
    manager: SharedDeviceManager,
    bus: Arc<EventBus>,
    handle: ServiceHandle,
}

impl DeviceService {
    pub fn new(manager: SharedDeviceManager, bus: Arc<EventBus>) -> Self {
        Self {
            manager,
            bus,
            handle: ServiceHandle::new(),
        }
    }

    pub fn manager(&self) -> SharedDeviceManager {
        self.manager.clone()
    }

    fn emit_outcome(&self, device: &types::DeviceId, outcome: ApplyOutcome) {
        if outcome.registered {
            self.bus.publish(BusEvent::DeviceRegistered {
                device: device.clone(),
            });
        }
        if let Some(online) = outcome.online_changed {
            self.bus.publish(BusEvent::DeviceOnlineChanged {
                device: device.clone(),
                online,
            });
        }
        if outcome.model_changed || outcome.registered {
            self.bus.publish(BusEvent::ModelChanged {
                device: device.clone(),
            });
        }
    }

    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::AttrReceived { device, msg, .. } => {
                match self.manager.register(device.clone(), &msg).await {
                    Ok(outcome) => self.emit_outcome(&device, outcome),
                    Err(e) => warn!("failed to register {device}: {e}"),
                }
            }
            BusEvent::StateReceived { device, msg, .. } => {
                match self.manager.update_state(device.clone(), &msg).await {
                    Ok(outcome) => self.emit_outcome(&device, outcome),
                    Err(e) => warn!("failed to apply state for {device}: {e}"),
                }
            }
            BusEvent::LwtReceived { device, msg, .. } => {
                match self.manager.apply_lwt(&device, &msg).await {
                    Ok(outcome) => self.emit_outcome(&device, outcome),
                    Err(DeviceError::UnknownDevice(_)) => {
                        debug!("LWT for unknown device {device}");
                    }
                    Err(e) => warn!("failed to apply LWT for {device}: {e}"),
                }
            }
            BusEvent::TelemetryReceived { device, ts, .. } => {
                if let Err(e) = self.manager.touch(&device, ts).await {
                    warn!("failed to touch {device}: {e}");
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Service for DeviceService {
    async fn init(&self) -> Result<()> {
        self.manager
            .load()
            .await
            .map_err(|e| miette::miette!("device replay failed: {e}"))?;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut rx = self.bus.subscribe();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("device service lagged, skipped {n} bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sweep.tick() => {
                    match self.manager.sweep_stale(types::now_ms()).await {
                        Ok(flipped) => {
                            for device in flipped {
                                self.bus.publish(BusEvent::DeviceOnlineChanged {
                                    device,
                                    online: false,
                                });
                            }
                        }
                        Err(e) => warn!("staleness sweep failed: {e}"),
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
