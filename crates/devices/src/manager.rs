use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use storage::{keys, Store};
use tokio::sync::RwLock;
use tracing::{debug, info};
use types::{
    normalize_mac,
    wire::{AttrMsg, LwtMsg, StateMsg},
    Device, DeviceId, DeviceIdentity, Health,
};

use crate::error::{DeviceError, DeviceResult};

#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub online: Option<bool>,
    pub health: Option<Health>,
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub by_health: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

/// Outcome of applying one inbound message, so the service layer knows
/// which bus events to emit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOutcome {
    pub registered: bool,
    pub online_changed: Option<bool>,
    pub model_changed: bool,
}

/// Owns the device mapping and the friendly-identity mapping. The
/// in-memory map is a cache over storage and is rebuilt by replay at
/// startup.
pub struct DeviceManager {
    store: Store,
    devices: RwLock<HashMap<DeviceId, Device>>,
    offline_threshold_ms: i64,
}

impl DeviceManager {
    pub fn new(store: Store, offline_threshold_ms: i64) -> Self {
        Self {
            store,
            devices: RwLock::new(HashMap::new()),
            offline_threshold_ms,
        }
    }

    /// Rebuild the in-memory map from storage.
    pub async fn load(&self) -> DeviceResult<()> {
        let mut map = HashMap::new();
        for (_, bytes) in self.store.iterate_prefix("devices:") {
            let device: Device =
                serde_json::from_slice(&bytes).map_err(storage::StorageError::from)?;
            map.insert(device.id.clone(), device);
        }
        let count = map.len();
        *self.devices.write().await = map;
        info!("loaded {count} devices from storage");
        Ok(())
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn list(&self, filter: &DeviceFilter) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut out: Vec<Device> = devices
            .values()
            .filter(|d| {
                filter.online.map_or(true, |o| d.online == o)
                    && filter.health.map_or(true, |h| d.health == h)
                    && filter
                        .device_type
                        .as_deref()
                        .map_or(true, |t| d.device_type == t)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_stats(&self) -> DeviceStats {
        let devices = self.devices.read().await;
        let mut stats = DeviceStats {
            total: devices.len(),
            ..DeviceStats::default()
        };
        for d in devices.values() {
            if d.online {
                stats.online += 1;
            } else {
                stats.offline += 1;
            }
            *stats.by_health.entry(d.health.to_string()).or_default() += 1;
            *stats.by_type.entry(d.device_type.clone()).or_default() += 1;
        }
        stats
    }

    /// Register a device from its `attr` announcement. Re-registration
    /// with a newer timestamp supersedes the declared attributes.
    pub async fn register(&self, id: DeviceId, msg: &AttrMsg) -> DeviceResult<ApplyOutcome> {
        let mut devices = self.devices.write().await;
        let mut outcome = ApplyOutcome::default();

        let device = devices.entry(id.clone()).or_insert_with(|| {
            outcome.registered = true;
            Device::new(id.clone(), msg.device_type.clone())
        });
        if !outcome.registered && msg.ts < device.last_seen {
            debug!("stale attr for {id}, ignoring");
            return Ok(outcome);
        }

        device.device_type = msg.device_type.clone();
        device
            .attributes
            .insert("mac_address".into(), msg.mac_address.clone().into());
        if let Some(m) = &msg.manufacturer {
            device.attributes.insert("manufacturer".into(), m.clone().into());
        }
        if let Some(m) = &msg.model {
            device.attributes.insert("model".into(), m.clone().into());
        }
        if let Some(v) = &msg.firmware_version {
            device.version = Some(v.clone());
        }
        device.attributes.insert(
            "capabilities".into(),
            serde_json::json!(msg.capabilities.clone()),
        );
        device.last_seen = device.last_seen.max(msg.ts);
        device.updated = Utc::now();

        self.persist(device)?;
        Ok(outcome)
    }

    /// Apply a `state` publication. Creates the device if `attr` has not
    /// been seen yet (declared type defaults to `unknown`).
    pub async fn update_state(&self, id: DeviceId, msg: &StateMsg) -> DeviceResult<ApplyOutcome> {
        let mut devices = self.devices.write().await;
        let mut outcome = ApplyOutcome::default();

        let device = devices.entry(id.clone()).or_insert_with(|| {
            outcome.registered = true;
            Device::new(id.clone(), "unknown")
        });
        if !outcome.registered && msg.ts < device.last_seen {
            debug!("stale state for {id}, ignoring");
            return Ok(outcome);
        }

        if !device.online {
            outcome.online_changed = Some(true);
        }
        device.online = true;
        device.health = msg.health;
        device.last_seen = msg.ts;
        device.uptime_s = msg.uptime_s;
        if let Some(v) = &msg.version {
            device.version = Some(v.clone());
        }
        if !msg.components.is_empty() {
            device.components = msg.components.clone();
        }
        for (k, v) in &msg.attributes {
            device.attributes.insert(k.clone(), v.clone());
        }

        if let Some(interfaces) = &msg.interfaces {
            let before = device.interfaces.clone();
            for iface in interfaces.clone() {
                device.upsert_interface(iface);
            }
            if before != device.interfaces {
                outcome.model_changed = true;
            }
        }
        if let Some(bridge) = &msg.bridge_table {
            if &device.bridge_table != bridge {
                device.bridge_table = bridge.clone();
                outcome.model_changed = true;
            }
        }
        if let Some(routes) = &msg.routing_table {
            if &device.routing_table != routes {
                device.routing_table = routes.clone();
                outcome.model_changed = true;
            }
        }
        if let Some(dhcp) = &msg.dhcp_server {
            if device.dhcp_server.as_ref() != Some(dhcp) {
                device.dhcp_server = Some(dhcp.clone());
                outcome.model_changed = true;
            }
        }
        device.updated = Utc::now();

        self.persist(device)?;
        Ok(outcome)
    }

    /// Apply a broker-published LWT: the device is offline.
    pub async fn apply_lwt(&self, id: &DeviceId, msg: &LwtMsg) -> DeviceResult<ApplyOutcome> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;

        let mut outcome = ApplyOutcome::default();
        if device.online {
            device.online = false;
            outcome.online_changed = Some(false);
        }
        debug!(
            "device {id} offline via LWT (reason: {})",
            msg.reason.as_deref().unwrap_or("unspecified")
        );
        device.updated = Utc::now();
        self.persist(device)?;
        Ok(outcome)
    }

    /// Record liveness from telemetry without any state change.
    pub async fn touch(&self, id: &DeviceId, ts: i64) -> DeviceResult<()> {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(id) {
            if ts > device.last_seen {
                device.last_seen = ts;
                self.persist(device)?;
            }
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &DeviceId, online: bool) -> DeviceResult<ApplyOutcome> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::UnknownDevice(id.clone()))?;
        let mut outcome = ApplyOutcome::default();
        if device.online != online {
            device.online = online;
            device.updated = Utc::now();
            outcome.online_changed = Some(online);
            self.persist(device)?;
        }
        Ok(outcome)
    }

    pub async fn delete(&self, id: &DeviceId) -> DeviceResult<()> {
        let removed = self.devices.write().await.remove(id);
        if removed.is_none() {
            return Err(DeviceError::UnknownDevice(id.clone()));
        }
        self.store
            .delete(&keys::device(&id.tenant, &id.site, &id.mac))?;
        Ok(())
    }

    /// Flip devices offline whose `last_seen` is staler than the
    /// threshold. Returns the ids that changed.
    pub async fn sweep_stale(&self, now_ms: i64) -> DeviceResult<Vec<DeviceId>> {
        let mut flipped = Vec::new();
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            if device.online && now_ms - device.last_seen > self.offline_threshold_ms {
                device.online = false;
                device.updated = Utc::now();
                self.persist(device)?;
                flipped.push(device.id.clone());
            }
        }
        Ok(flipped)
    }

    // Identity mapping, keyed by primary MAC.

    pub fn identity(&self, mac: &str) -> DeviceResult<Option<DeviceIdentity>> {
        Ok(self
            .store
            .get_json::<DeviceIdentity>(&keys::identity(&normalize_mac(mac)))?)
    }

    pub fn set_identity(&self, mac: &str, identity: &DeviceIdentity) -> DeviceResult<()> {
        self.store
            .put_json(keys::identity(&normalize_mac(mac)), identity)?;
        Ok(())
    }

    fn persist(&self, device: &Device) -> DeviceResult<()> {
        let key = keys::device(&device.id.tenant, &device.id.site, &device.id.mac);
        self.store.put_json(key, device)?;
        Ok(())
    }

    /// All devices, unfiltered, for the inference engine's model view.
    pub async fn all(&self) -> Vec<Device> {
        self.list(&DeviceFilter::default()).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

pub type SharedDeviceManager = Arc<DeviceManager>;

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(ts: i64) -> AttrMsg {
        AttrMsg {
            schema: "attr/1.0".into(),
            ts,
            device_type: "router".into(),
            manufacturer: Some("Lattice Labs".into()),
            model: Some("LX-1".into()),
            firmware_version: Some("2.1.0".into()),
            hardware_version: None,
            mac_address: "aabbccddeeff".into(),
            capabilities: vec!["routing".into(), "nat".into()],
        }
    }

    fn state(ts: i64) -> StateMsg {
        StateMsg {
            schema: "state/1.0".into(),
            ts,
            health: Health::Ok,
            connection_status: None,
            uptime_s: Some(3600),
            cpu_usage: None,
            memory_usage: None,
            version: None,
            components: HashMap::new(),
            attributes: HashMap::new(),
            interfaces: None,
            bridge_table: None,
            routing_table: None,
            dhcp_server: None,
        }
    }

    fn manager() -> DeviceManager {
        DeviceManager::new(Store::new(), 60_000)
    }

    #[tokio::test]
    async fn attr_then_state_registers_online_device() {
        let mgr = manager();
        let id = DeviceId::new("home", "main", "aabbccddeeff");

        let outcome = mgr.register(id.clone(), &attr(1_700_000_000_000)).await.unwrap();
        assert!(outcome.registered);

        mgr.update_state(id.clone(), &state(1_700_000_000_100)).await.unwrap();
        let dev = mgr.get(&id).await.unwrap();
        assert!(dev.online);
        assert_eq!(dev.health, Health::Ok);
        assert_eq!(dev.device_type, "router");

        let listed = mgr.list(&DeviceFilter::default()).await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn stale_state_does_not_regress() {
        let mgr = manager();
        let id = DeviceId::new("home", "main", "aabbccddeeff");
        mgr.update_state(id.clone(), &state(2_000)).await.unwrap();

        let mut old = state(1_000);
        old.health = Health::Critical;
        mgr.update_state(id.clone(), &old).await.unwrap();

        assert_eq!(mgr.get(&id).await.unwrap().health, Health::Ok);
    }

    #[tokio::test]
    async fn sweep_flips_stale_devices_offline() {
        let mgr = manager();
        let id = DeviceId::new("home", "main", "aabbccddeeff");
        mgr.update_state(id.clone(), &state(1_000_000)).await.unwrap();

        let flipped = mgr.sweep_stale(1_000_000 + 61_000).await.unwrap();
        assert_eq!(flipped, vec![id.clone()]);
        assert!(!mgr.get(&id).await.unwrap().online);

        // Second sweep is a no-op.
        assert!(mgr.sweep_stale(1_000_000 + 120_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reload_replays_storage() {
        let store = Store::new();
        let id = DeviceId::new("home", "main", "aabbccddeeff");
        {
            let mgr = DeviceManager::new(store.clone(), 60_000);
            mgr.update_state(id.clone(), &state(5_000)).await.unwrap();
        }
        let mgr = DeviceManager::new(store, 60_000);
        mgr.load().await.unwrap();
        assert!(mgr.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn identity_round_trips() {
        let mgr = manager();
        let identity = DeviceIdentity {
            friendly_name: Some("Living room AP".into()),
            location: Some("living room".into()),
            group: None,
            tags: vec!["wifi".into()],
        };
        mgr.set_identity("AA:BB:CC:DD:EE:FF", &identity).unwrap();
        assert_eq!(mgr.identity("aabbccddeeff").unwrap(), Some(identity));
    }
}
