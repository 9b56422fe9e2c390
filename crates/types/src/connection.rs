use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::ids::DeviceId;

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Bridge,
    Wifi,
    Route,
    Dhcp,
    Scan,
    Ethernet,
}

impl ConnectionType {
    /// Priority used to pick the primary type of a fused edge. Lower wins.
    pub fn priority(self) -> u8 {
        match self {
            ConnectionType::Bridge => 0,
            ConnectionType::Wifi => 1,
            ConnectionType::Route => 2,
            ConnectionType::Dhcp => 3,
            ConnectionType::Scan => 4,
            ConnectionType::Ethernet => 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionMetrics {
    pub rssi: Option<i32>,
    pub link_speed: Option<u32>,
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    /// Fused belief that this edge exists, in `[0, 1]`.
    pub confidence: f64,
}

/// A topology edge. Undirected in concept; endpoints are stored in
/// canonical `(min, max)` order so the same physical link always
/// deduplicates to one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub from_device: DeviceId,
    pub to_device: DeviceId,
    pub from_interface: Option<String>,
    pub to_interface: Option<String>,
    pub connection_type: ConnectionType,
    pub is_direct_link: bool,
    pub discovered_at: i64,
    pub last_seen: i64,
    pub metrics: ConnectionMetrics,
}

impl Connection {
    /// Canonical endpoint ordering for deduplication. Returns the pair in
    /// `(min, max)` order together with whether the input was swapped.
    pub fn canonical_pair(a: &DeviceId, b: &DeviceId) -> (DeviceId, DeviceId, bool) {
        if a <= b {
            (a.clone(), b.clone(), false)
        } else {
            (b.clone(), a.clone(), true)
        }
    }

    /// Stable identifier derived from the canonical pair and primary type.
    pub fn edge_id(a: &DeviceId, b: &DeviceId, kind: ConnectionType) -> String {
        let (lo, hi, _) = Self::canonical_pair(a, b);
        format!("{lo}|{hi}|{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_is_order_insensitive() {
        let a = DeviceId::new("home", "main", "aabbccddee01");
        let b = DeviceId::new("home", "main", "aabbccddee02");
        let (lo1, hi1, swapped1) = Connection::canonical_pair(&a, &b);
        let (lo2, hi2, swapped2) = Connection::canonical_pair(&b, &a);
        assert_eq!((&lo1, &hi1), (&lo2, &hi2));
        assert!(!swapped1);
        assert!(swapped2);
    }

    #[test]
    fn edge_id_is_stable_across_direction() {
        let a = DeviceId::new("home", "main", "aabbccddee01");
        let b = DeviceId::new("home", "main", "aabbccddee02");
        assert_eq!(
            Connection::edge_id(&a, &b, ConnectionType::Wifi),
            Connection::edge_id(&b, &a, ConnectionType::Wifi)
        );
    }

    #[test]
    fn bridge_outranks_scan() {
        assert!(ConnectionType::Bridge.priority() < ConnectionType::Scan.priority());
    }
}
