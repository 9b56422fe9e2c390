//! MQTT transport plane.
//!
//! One long-lived MQTT 3.1.1 session per controller. The transport task
//! never does schema validation or business work: received publishes are
//! handed to the router over a bounded channel (drop-newest, counted) and
//! the poll loop goes straight back to the socket.

mod error;
mod publisher;

pub use error::{TransportError, TransportResult};
pub use publisher::Publisher;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use types::system_service::{Service, ServiceHandle};
use uuid::Uuid;

/// A raw publish as received from the broker, untouched.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: i64,
}

/// Subscriptions and their QoS, per the retain/QoS policy: state and attr
/// are retained QoS 1, telemetry is QoS 0, events and command traffic are
/// QoS 1, LWT is retained QoS 1.
const SUBSCRIPTIONS: &[(&str, QoS)] = &[
    ("rtk/v1/+/+/+/state", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/telemetry/#", QoS::AtMostOnce),
    ("rtk/v1/+/+/+/evt/#", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/attr", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/lwt", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/cmd/ack", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/cmd/res", QoS::AtLeastOnce),
    ("rtk/v1/+/+/+/topology/#", QoS::AtLeastOnce),
];

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct MqttTransport {
    cfg: config::MqttConfig,
    namespace: config::NamespaceConfig,
    inbound_tx: mpsc::Sender<RawMessage>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    dropped_inbound: Arc<AtomicU64>,
    handle: ServiceHandle,
}

impl MqttTransport {
    pub fn new(
        cfg: config::MqttConfig,
        namespace: config::NamespaceConfig,
        inbound_tx: mpsc::Sender<RawMessage>,
    ) -> Self {
        Self {
            cfg,
            namespace,
            inbound_tx,
            client: Arc::new(RwLock::new(None)),
            dropped_inbound: Arc::new(AtomicU64::new(0)),
            handle: ServiceHandle::new(),
        }
    }

    /// Handle for outbound publishes, valid for the transport's lifetime.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.client.clone())
    }

    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    fn controller_topic(&self, kind: &str) -> String {
        format!(
            "rtk/v1/{}/{}/controller/{kind}",
            self.namespace.tenant, self.namespace.site
        )
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = self
            .cfg
            .client_id
            .clone()
            .unwrap_or_else(|| format!("lattice-controller-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let mut options = MqttOptions::new(client_id, self.cfg.host.clone(), self.cfg.port);
        options.set_keep_alive(Duration::from_secs(self.cfg.keepalive_s));
        if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        let lwt_payload = serde_json::json!({
            "schema": "lwt/1.0",
            "ts": types::now_ms(),
            "device_id": "controller",
            "status": "offline",
            "reason": "connection_lost",
        });
        options.set_last_will(LastWill::new(
            self.controller_topic("lwt"),
            lwt_payload.to_string(),
            QoS::AtLeastOnce,
            true,
        ));
        options
    }

    async fn announce_online(&self, client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
        let payload = serde_json::json!({
            "schema": "state/1.0",
            "ts": types::now_ms(),
            "health": "ok",
            "connection_status": "online",
        });
        client
            .publish(
                self.controller_topic("state"),
                QoS::AtLeastOnce,
                true,
                payload.to_string(),
            )
            .await
    }

    async fn subscribe_all(&self, client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
        for (topic, qos) in SUBSCRIPTIONS {
            client.subscribe(*topic, *qos).await?;
        }
        Ok(())
    }

    /// One broker session: connect, announce, subscribe, poll until the
    /// connection drops or the service is cancelled. Returns whether the
    /// loop should reconnect.
    async fn session(&self) -> bool {
        let (client, mut eventloop) = AsyncClient::new(self.mqtt_options(), 64);
        *self.client.write().await = Some(client.clone());

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker {}:{}", self.cfg.host, self.cfg.port);
                            if let Err(e) = self.announce_online(&client).await {
                                warn!("failed to announce controller online: {e}");
                            }
                            if let Err(e) = self.subscribe_all(&client).await {
                                warn!("failed to subscribe: {e}");
                                return true;
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let msg = RawMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                                received_at: types::now_ms(),
                            };
                            if self.inbound_tx.try_send(msg).is_err() {
                                // Router is saturated; drop-newest, never
                                // block the transport task.
                                self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("broker sent disconnect");
                            return true;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT connection error: {e}");
                            return true;
                        }
                    }
                }
                _ = self.handle.wait_for_cancel() => {
                    debug!("transport cancelled");
                    let _ = client.disconnect().await;
                    return false;
                }
            }
        }
    }
}

#[async_trait]
impl Service for MqttTransport {
    async fn run(&self) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let started = std::time::Instant::now();
            let reconnect = self.session().await;
            *self.client.write().await = None;
            if !reconnect {
                return Ok(());
            }

            // A session that survived a while earns a fresh backoff.
            if started.elapsed() > MAX_BACKOFF {
                backoff = INITIAL_BACKOFF;
            }
            info!("reconnecting to broker in {backoff:?}");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.handle.wait_for_cancel() => return Ok(()),
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn handle(&self) -> Option<&ServiceHandle> {
        Some(&self.handle)
    }
}
