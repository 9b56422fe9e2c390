//! Command manager (issue, correlate, timeout) and changeset manager
//! (grouped execution with rollback).

mod changeset;
mod error;
mod manager;

pub use changeset::{ChangesetManager, NoPriorValues, PriorValueSource};
pub use error::{CommandError, CommandResult};
pub use manager::{CommandManager, RequestPublisher};

use std::sync::Arc;

use async_trait::async_trait;
use bus::EventBus;
use miette::Result;
use tracing::warn;
use types::{
    events::BusEvent,
    system_service::{Service, ServiceHandle},
};

/// Bus consumer that feeds correlated acks and results into the manager.
pub struct CommandService {
    manager: Arc<CommandManager>,
    bus: Arc<EventBus>,
    handle: ServiceHandle,
}

impl CommandService {
    pub fn new(manager: Arc<CommandManager>, bus: Arc<EventBus>) -> Self {
        Self {
            manager,
            bus,
            handle: ServiceHandle::new(),
        }
    }

    pub fn manager(&self) -> Arc<CommandManager> {
        self.manager.clone()
    }
}

#[async_trait]
impl Service for CommandService {
    async fn run(&self) -> Result<()> {
        let mut rx = self.bus.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(BusEvent::CommandAck { msg, .. }) => {
                            if let Err(e) = self.manager.handle_ack(&msg).await {
                                warn!("failed to apply ack {}: {e}", msg.id);
                            }
                        }
                        Ok(BusEvent::CommandResult { msg, .. }) => {
                            if let Err(e) = self.manager.handle_result(&msg).await {
                                warn!("failed to apply result {}: {e}", msg.id);
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("command service lagged, skipped {n} bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
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
