//! URI-addressed read-only snapshots with per-provider TTL caches.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use llm::ToolContext;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::types::ResourceDescriptor;

type FetchFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type FetchFn = Arc<dyn Fn(Arc<ToolContext>) -> FetchFuture + Send + Sync>;

struct CachedValue {
    value: Value,
    fetched_at: Instant,
}

struct Provider {
    descriptor: ResourceDescriptor,
    ttl: Duration,
    fetch: FetchFn,
    cache: Mutex<Option<CachedValue>>,
}

/// Registry of resource providers, each with an independent TTL cache.
pub struct ResourceCatalog {
    ctx: Arc<ToolContext>,
    providers: HashMap<String, Provider>,
}

impl ResourceCatalog {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        let mut catalog = Self {
            ctx,
            providers: HashMap::new(),
        };
        catalog.register_defaults();
        catalog
    }

    fn register<F, Fut>(
        &mut self,
        uri: &str,
        name: &str,
        description: &str,
        ttl: Duration,
        fetch: F,
    ) where
        F: Fn(Arc<ToolContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.providers.insert(
            uri.to_string(),
            Provider {
                descriptor: ResourceDescriptor {
                    uri: uri.to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                    mime_type: "application/json".to_string(),
                },
                ttl,
                fetch: Arc::new(move |ctx| Box::pin(fetch(ctx))),
                cache: Mutex::new(None),
            },
        );
    }

    fn register_defaults(&mut self) {
        self.register(
            "topology://network/current",
            "Current network topology",
            "Full device and connection snapshot",
            Duration::from_secs(10),
            |ctx| async move {
                let snapshot = ctx.topology.get_current_topology().await;
                serde_json::to_value(&snapshot).map_err(|e| e.to_string())
            },
        );
        self.register(
            "topology://devices/list",
            "Device list",
            "All known devices with state and health",
            Duration::from_secs(10),
            |ctx| async move {
                let devices = ctx.devices.all().await;
                serde_json::to_value(&devices).map_err(|e| e.to_string())
            },
        );
        self.register(
            "topology://connections/graph",
            "Connection graph",
            "Inferred edges with confidence and metrics",
            Duration::from_secs(10),
            |ctx| async move {
                let connections = ctx.topology.connections().await;
                serde_json::to_value(&connections).map_err(|e| e.to_string())
            },
        );
        self.register(
            "devices://status/all",
            "Device status",
            "Aggregate online/health statistics",
            Duration::from_secs(5),
            |ctx| async move {
                let stats = ctx.devices.get_stats().await;
                serde_json::to_value(&stats).map_err(|e| e.to_string())
            },
        );
        self.register(
            "diagnostics://history/recent",
            "Recent diagnostics",
            "Most recent probe results across the fleet",
            Duration::from_secs(30),
            |ctx| async move {
                let records = ctx.diagnostics.recent_results(50);
                serde_json::to_value(&records).map_err(|e| e.to_string())
            },
        );
    }

    pub fn list(&self) -> Vec<ResourceDescriptor> {
        let mut out: Vec<ResourceDescriptor> = self
            .providers
            .values()
            .map(|p| p.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        out
    }

    /// Read a resource, serving from the provider's cache within its TTL.
    pub async fn read(&self, uri: &str) -> Option<Result<Value, String>> {
        let provider = self.providers.get(uri)?;

        let mut cache = provider.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() <= provider.ttl {
                return Some(Ok(json!({
                    "uri": uri,
                    "cached": true,
                    "data": cached.value.clone(),
                })));
            }
        }

        match (provider.fetch)(self.ctx.clone()).await {
            Ok(value) => {
                *cache = Some(CachedValue {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                });
                Some(Ok(json!({
                    "uri": uri,
                    "cached": false,
                    "data": value,
                })))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
