use std::sync::Arc;

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{TransportError, TransportResult};

/// Outbound publish handle shared with components. Stays valid across
/// reconnects because it reads the transport's current client.
#[derive(Clone)]
pub struct Publisher {
    client: Arc<RwLock<Option<AsyncClient>>>,
}

impl Publisher {
    pub(crate) fn new(client: Arc<RwLock<Option<AsyncClient>>>) -> Self {
        Self { client }
    }

    /// Detached publisher that is never connected; lets components under
    /// test construct their dependencies without a broker.
    pub fn disconnected() -> Self {
        Self {
            client: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(TransportError::NotConnected)?;
        client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Publish a JSON-serializable payload at QoS 1, non-retained — the
    /// policy for command requests.
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> TransportResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, QoS::AtLeastOnce, false, payload).await
    }
}
