use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::{miette, Result};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Delay before a failed worker is restarted.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// A long-lived controller component with an init/run/cleanup lifecycle.
///
/// `run` is the worker body; if it returns an error the handle logs it and
/// reruns it after a short backoff, so one failing worker never takes the
/// process down. Cancellation is cooperative: the body must select on
/// `handle.wait_for_cancel()` at every blocking point.
#[async_trait]
pub trait Service: Send + Sync {
    /// Initialize the service. Called once before the worker starts.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// The main service logic, run in its own task.
    async fn run(&self) -> Result<()>;

    /// Cleanup when the service is stopped.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Start the service.
    async fn start(self: Arc<Self>) -> Result<()>
    where
        Self: Sized + 'static,
    {
        let service = self.clone();
        let handle = self
            .handle()
            .ok_or_else(|| miette!("service has no handle"))?;
        handle.start(service).await
    }

    /// Stop the service, waiting up to the shutdown grace period.
    async fn stop(&self) -> Result<()>
    where
        Self: Sized + 'static,
    {
        let handle = self
            .handle()
            .ok_or_else(|| miette!("service has no handle"))?;
        handle.stop(self).await
    }

    fn handle(&self) -> Option<&ServiceHandle>;
}

/// Shared lifecycle state for one service worker.
pub struct ServiceHandle {
    running: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    grace: Duration,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHandle {
    pub fn new() -> Self {
        Self::with_grace(Duration::from_secs(3))
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            grace,
            task_handle: Mutex::new(None),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait_for_cancel(&self) {
        self.cancel.notified().await
    }

    pub async fn start<S: Service + ?Sized + 'static>(&self, service: Arc<S>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) || self.is_stopped() {
            return Ok(());
        }

        service.init().await?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let stopped = self.stopped.clone();

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) && !stopped.load(Ordering::SeqCst) {
                if let Err(e) = service.run().await {
                    tracing::error!("service worker failed, restarting: {e}");
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    continue;
                }
                // A clean return means the worker is done.
                break;
            }
        });

        *self.task_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop<S: Service + ?Sized>(&self, service: &S) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();

        let mut lock = self.task_handle.lock().await;
        if let Some(handle) = lock.take() {
            drop(lock);
            match timeout(self.grace, handle).await {
                Ok(Ok(())) => {
                    tracing::debug!("service stopped gracefully");
                }
                Ok(Err(e)) => {
                    tracing::warn!("service task panicked during shutdown: {e}");
                }
                Err(_) => {
                    tracing::warn!("service shutdown timed out after {:?}, aborting", self.grace);
                }
            }
        }

        service.cleanup().await.map_err(|e| {
            tracing::error!("service cleanup failed: {e}");
            miette!("cleanup failed: {e}")
        })?;

        Ok(())
    }
}

impl Default for ServiceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ServiceHandle {
    fn clone(&self) -> Self {
        Self {
            running: self.running.clone(),
            stopped: self.stopped.clone(),
            cancel: self.cancel.clone(),
            grace: self.grace,
            task_handle: Mutex::new(None),
        }
    }
}
