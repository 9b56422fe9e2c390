//! Diagnostics engine (speed/WAN/latency probes) and periodic scheduler.

mod engine;
mod error;
mod scheduler;

pub use engine::DiagnosticsEngine;
pub use error::{DiagError, DiagResult};
pub use scheduler::{Scheduler, ScheduleStatus};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devices::{DeviceFilter, DeviceManager};
use miette::Result;
use tracing::{info, warn};
use types::{
    system_service::{Service, ServiceHandle},
    ProbeKind,
};

/// Scheduler resolution.
const TICK: Duration = Duration::from_secs(1);

pub struct DiagnosticsService {
    engine: Arc<DiagnosticsEngine>,
    scheduler: Arc<Scheduler>,
    devices: Arc<DeviceManager>,
    cfg: config::DiagnosticsConfig,
    handle: ServiceHandle,
}

impl DiagnosticsService {
    pub fn new(
        engine: Arc<DiagnosticsEngine>,
        scheduler: Arc<Scheduler>,
        devices: Arc<DeviceManager>,
        cfg: config::DiagnosticsConfig,
    ) -> Self {
        Self {
            engine,
            scheduler,
            devices,
            cfg,
            handle: ServiceHandle::new(),
        }
    }

    pub fn engine(&self) -> Arc<DiagnosticsEngine> {
        self.engine.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Probe every online device of the configured kind; overlap with a
    /// still-running probe on a device is skipped by the engine.
    async fn sweep(engine: Arc<DiagnosticsEngine>, devices: Arc<DeviceManager>, kind: ProbeKind) {
        let online = devices
            .list(&DeviceFilter {
                online: Some(true),
                ..DeviceFilter::default()
            })
            .await;
        for device in online {
            let outcome = match kind {
                ProbeKind::SpeedTest => engine.speed_test(device.id.clone()).await,
                ProbeKind::WanTest => engine.wan_test(device.id.clone()).await,
                ProbeKind::LatencyTest => {
                    engine
                        .latency_test(
                            device.id.clone(),
                            vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
                        )
                        .await
                }
            };
            match outcome {
                Ok(record) => {
                    if let Some(error) = &record.error {
                        warn!("{kind} on {} failed: {error}", device.id);
                    }
                }
                Err(DiagError::ProbeInProgress { .. }) => {}
                Err(e) => warn!("{kind} on {} errored: {e}", device.id),
            }
        }
    }
}

#[async_trait]
impl Service for DiagnosticsService {
    async fn init(&self) -> Result<()> {
        for schedule in &self.cfg.schedules {
            let Ok(kind) = schedule.kind.parse::<ProbeKind>() else {
                warn!(
                    "schedule {} has unknown probe kind {:?}, skipping",
                    schedule.name, schedule.kind
                );
                continue;
            };
            let engine = self.engine.clone();
            let devices = self.devices.clone();
            self.scheduler
                .register(&schedule.name, schedule.interval_s as i64 * 1000, move || {
                    Self::sweep(engine.clone(), devices.clone(), kind)
                })
                .await;
        }
        self.scheduler.start_all().await;
        info!("diagnostics scheduler armed ({} schedules)", self.cfg.schedules.len());
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.scheduler.fire_due(types::now_ms()).await;
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
