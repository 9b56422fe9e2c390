use async_trait::async_trait;
use miette::Result;
use tracing::{debug, error, info, warn};
use types::{DeviceEvent, Severity};

/// A registered consumer of device events. Handlers run after the event
/// is persisted; handler failures are logged and never block the queue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, event_type: &str) -> bool;

    async fn handle(&self, event: &DeviceEvent) -> Result<()>;
}

/// Default handler: logs every event at its severity.
pub struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn can_handle(&self, _event_type: &str) -> bool {
        true
    }

    async fn handle(&self, event: &DeviceEvent) -> Result<()> {
        let message = event.message.as_deref().unwrap_or("");
        match event.severity {
            Severity::Info => {
                info!(device = %event.device_id, kind = %event.event_type, "{message}")
            }
            Severity::Warning => {
                warn!(device = %event.device_id, kind = %event.event_type, "{message}")
            }
            Severity::Error | Severity::Critical => {
                error!(device = %event.device_id, kind = %event.event_type, "{message}")
            }
        }
        Ok(())
    }
}
