use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::ids::DeviceId;

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Warning,
    Error,
    Critical,
    Unknown,
}

impl Default for Health {
    fn default() -> Self {
        Health::Unknown
    }
}

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
    Bridge,
    Tunnel,
    Loopback,
}

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WifiMode {
    #[strum(serialize = "AP")]
    #[serde(rename = "AP")]
    Ap,
    #[strum(serialize = "STA")]
    #[serde(rename = "STA")]
    Sta,
    #[strum(serialize = "mesh")]
    Mesh,
}

/// WiFi sub-record of an interface. `bssid` identifies the AP radio this
/// interface either owns (AP mode) or is associated to (STA mode).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WifiInfo {
    pub mode: WifiMode,
    pub ssid: Option<String>,
    pub bssid: Option<String>,
    pub channel: Option<u16>,
    pub band: Option<String>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    pub mac: String,
    /// IP addresses in CIDR notation, e.g. `192.168.1.10/24`.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiInfo>,
}

/// One learned entry of a device's Layer-2 forwarding table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeEntry {
    pub mac: String,
    pub interface: String,
    pub is_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    /// Destination in CIDR notation; `0.0.0.0/0` for the default route.
    pub destination: String,
    pub gateway: String,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: String,
    pub lease_start: i64,
    pub lease_end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DhcpServer {
    pub subnet: String,
    #[serde(default)]
    pub leases: Vec<DhcpLease>,
}

/// A device record as maintained by the Device Manager.
///
/// `online` is an inference, not a declaration: the manager flips it when
/// `now - last_seen` crosses the offline threshold or an LWT arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub device_type: String,
    pub online: bool,
    pub health: Health,
    /// Milliseconds since epoch of the last fresh state/telemetry/attr.
    pub last_seen: i64,
    pub uptime_s: Option<u64>,
    pub version: Option<String>,
    #[serde(default)]
    pub components: HashMap<String, Value>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridge_table: Vec<BridgeEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_table: Vec<RouteEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_server: Option<DhcpServer>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Device {
    pub fn new(id: DeviceId, device_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            device_type: device_type.into(),
            online: false,
            health: Health::Unknown,
            last_seen: 0,
            uptime_s: None,
            version: None,
            components: HashMap::new(),
            attributes: HashMap::new(),
            interfaces: Vec::new(),
            bridge_table: Vec::new(),
            routing_table: Vec::new(),
            dhcp_server: None,
            created: now,
            updated: now,
        }
    }

    /// Add or replace an interface, collapsing duplicates by MAC. Interface
    /// MACs are unique within a device; a rediscovered MAC updates in place.
    pub fn upsert_interface(&mut self, iface: Interface) {
        let mac = crate::normalize_mac(&iface.mac);
        if let Some(existing) = self
            .interfaces
            .iter_mut()
            .find(|i| crate::normalize_mac(&i.mac) == mac)
        {
            *existing = iface;
        } else {
            self.interfaces.push(iface);
        }
    }

    /// Find the interface owning the given MAC (normalized comparison).
    pub fn interface_by_mac(&self, mac: &str) -> Option<&Interface> {
        let mac = crate::normalize_mac(mac);
        self.interfaces
            .iter()
            .find(|i| crate::normalize_mac(&i.mac) == mac)
    }
}

/// Friendly identity attached to a primary MAC, maintained separately from
/// the live device record so it survives re-registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceIdentity {
    pub friendly_name: Option<String>,
    pub location: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
