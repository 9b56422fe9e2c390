//! The five connection-inference algorithms. Each produces candidate
//! edges with a base confidence; the fusion stage (which knows nothing
//! about the algorithms except their weight) merges them.

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use types::{normalize_mac, ConnectionType, Device, DeviceId, WifiMode};

/// A candidate edge from one algorithm, before fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub from: DeviceId,
    pub to: DeviceId,
    pub from_interface: Option<String>,
    pub to_interface: Option<String>,
    pub kind: ConnectionType,
    pub base_confidence: f64,
    pub observed_at: i64,
    pub rssi: Option<i32>,
    pub link_speed: Option<u32>,
}

/// Read-only view the algorithms run against.
pub struct ModelView<'a> {
    pub devices: &'a [Device],
    pub now_ms: i64,
}

impl ModelView<'_> {
    /// Find the device (and interface name) owning a MAC.
    fn owner_of_mac(&self, mac: &str) -> Option<(&Device, String)> {
        let mac = normalize_mac(mac);
        self.devices.iter().find_map(|d| {
            d.interfaces
                .iter()
                .find(|i| normalize_mac(&i.mac) == mac)
                .map(|i| (d, i.name.clone()))
        })
    }

    /// Find the device (and interface name) holding an IP address.
    fn owner_of_ip(&self, ip: IpAddr) -> Option<(&Device, String)> {
        self.devices.iter().find_map(|d| {
            d.interfaces.iter().find_map(|i| {
                i.addresses.iter().any(|cidr| {
                    IpNetwork::from_str(cidr)
                        .map(|net| net.ip() == ip)
                        .unwrap_or(false)
                })
                .then(|| (d, i.name.clone()))
            })
        })
    }

    /// Find the device owning an AP radio with the given BSSID.
    fn ap_with_bssid(&self, bssid: &str) -> Option<(&Device, String)> {
        let bssid = normalize_mac(bssid);
        self.devices.iter().find_map(|d| {
            d.interfaces
                .iter()
                .find(|i| {
                    i.wifi.as_ref().is_some_and(|w| {
                        w.mode == WifiMode::Ap
                            && w.bssid
                                .as_deref()
                                .is_some_and(|b| normalize_mac(b) == bssid)
                    })
                })
                .map(|i| (d, i.name.clone()))
        })
    }
}

/// Closed set of inference algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    LayerTwo,
    LayerThree,
    Wifi,
    Dhcp,
    SubnetScan,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::LayerTwo,
        Algorithm::LayerThree,
        Algorithm::Wifi,
        Algorithm::Dhcp,
        Algorithm::SubnetScan,
    ];

    pub fn produce_candidates(self, view: &ModelView<'_>) -> Vec<Candidate> {
        match self {
            Algorithm::LayerTwo => layer_two(view),
            Algorithm::LayerThree => layer_three(view),
            Algorithm::Wifi => wifi(view),
            Algorithm::Dhcp => dhcp(view),
            Algorithm::SubnetScan => subnet_scan(view),
        }
    }
}

/// Bridge-table walk: every non-local forwarding entry whose MAC belongs
/// to another device's interface is evidence of an L2 adjacency.
fn layer_two(view: &ModelView<'_>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for device in view.devices {
        for entry in &device.bridge_table {
            if entry.is_local {
                continue;
            }
            let Some((peer, peer_iface)) = view.owner_of_mac(&entry.mac) else {
                continue;
            };
            if peer.id == device.id {
                continue;
            }
            out.push(Candidate {
                from: device.id.clone(),
                to: peer.id.clone(),
                from_interface: Some(entry.interface.clone()),
                to_interface: Some(peer_iface),
                kind: ConnectionType::Bridge,
                base_confidence: 0.9,
                observed_at: device.last_seen,
                rssi: None,
                link_speed: None,
            });
        }
    }
    out
}

/// Routing-table walk: a route via a gateway held by another device's
/// interface links the two at L3.
fn layer_three(view: &ModelView<'_>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for device in view.devices {
        for route in &device.routing_table {
            let Ok(gateway) = route.gateway.parse::<IpAddr>() else {
                continue;
            };
            if gateway.is_unspecified() {
                continue;
            }
            let Some((peer, peer_iface)) = view.owner_of_ip(gateway) else {
                continue;
            };
            if peer.id == device.id {
                continue;
            }
            out.push(Candidate {
                from: device.id.clone(),
                to: peer.id.clone(),
                from_interface: Some(route.interface.clone()),
                to_interface: Some(peer_iface),
                kind: ConnectionType::Route,
                base_confidence: 0.8,
                observed_at: device.last_seen,
                rssi: None,
                link_speed: None,
            });
        }
    }
    out
}

/// Association walk: a STA interface carrying a BSSID is linked to the AP
/// radio owning that BSSID.
fn wifi(view: &ModelView<'_>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for device in view.devices {
        for iface in &device.interfaces {
            let Some(wifi) = &iface.wifi else { continue };
            if wifi.mode != WifiMode::Sta {
                continue;
            }
            let Some(bssid) = &wifi.bssid else { continue };
            let Some((ap, ap_iface)) = view.ap_with_bssid(bssid) else {
                continue;
            };
            if ap.id == device.id {
                continue;
            }
            out.push(Candidate {
                from: device.id.clone(),
                to: ap.id.clone(),
                from_interface: Some(iface.name.clone()),
                to_interface: Some(ap_iface),
                kind: ConnectionType::Wifi,
                base_confidence: 0.85,
                observed_at: device.last_seen,
                rssi: wifi.rssi,
                link_speed: None,
            });
        }
    }
    out
}

/// DHCP lease walk: each active lease produces a client-to-server edge.
fn dhcp(view: &ModelView<'_>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for server in view.devices {
        let Some(dhcp) = &server.dhcp_server else {
            continue;
        };
        for lease in &dhcp.leases {
            if lease.lease_end < view.now_ms {
                continue;
            }
            let Some((client, client_iface)) = view.owner_of_mac(&lease.mac) else {
                continue;
            };
            if client.id == server.id {
                continue;
            }
            out.push(Candidate {
                from: client.id.clone(),
                to: server.id.clone(),
                from_interface: Some(client_iface),
                to_interface: None,
                kind: ConnectionType::Dhcp,
                base_confidence: 0.7,
                observed_at: client.last_seen.max(lease.lease_start),
                rssi: None,
                link_speed: None,
            });
        }
    }
    out
}

/// Subnet co-membership: devices with interfaces in the same CIDR are
/// weak pairwise candidates.
fn subnet_scan(view: &ModelView<'_>) -> Vec<Candidate> {
    // (network, device, interface name) per address.
    let mut members: Vec<(IpNetwork, &Device, String)> = Vec::new();
    for device in view.devices {
        for iface in &device.interfaces {
            for addr in &iface.addresses {
                if let Ok(net) = IpNetwork::from_str(addr) {
                    // Normalize to the subnet, not the host address.
                    if let Ok(subnet) = IpNetwork::new(net.network(), net.prefix()) {
                        members.push((subnet, device, iface.name.clone()));
                    }
                }
            }
        }
    }

    let mut out = Vec::new();
    for i in 0..members.len() {
        for j in (i + 1)..members.len() {
            let (net_a, dev_a, if_a) = &members[i];
            let (net_b, dev_b, if_b) = &members[j];
            if net_a != net_b || dev_a.id == dev_b.id {
                continue;
            }
            out.push(Candidate {
                from: dev_a.id.clone(),
                to: dev_b.id.clone(),
                from_interface: Some(if_a.clone()),
                to_interface: Some(if_b.clone()),
                kind: ConnectionType::Scan,
                base_confidence: 0.6,
                observed_at: dev_a.last_seen.min(dev_b.last_seen),
                rssi: None,
                link_speed: None,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{BridgeEntry, Interface, InterfaceKind, RouteEntry, WifiInfo};

    fn device(mac: &str) -> Device {
        Device::new(DeviceId::new("home", "main", mac), "router")
    }

    fn eth(name: &str, mac: &str, addr: &str) -> Interface {
        Interface {
            name: name.into(),
            kind: InterfaceKind::Ethernet,
            mac: mac.into(),
            addresses: vec![addr.into()],
            wifi: None,
        }
    }

    #[test]
    fn layer_two_matches_peer_by_mac() {
        let mut a = device("aabbccddee01");
        a.bridge_table = vec![BridgeEntry {
            mac: "AA:BB:CC:DD:EE:02".into(),
            interface: "br0".into(),
            is_local: false,
        }];
        let mut b = device("aabbccddee02");
        b.interfaces = vec![eth("eth0", "aa:bb:cc:dd:ee:02", "192.168.1.2/24")];

        let devices = vec![a, b];
        let view = ModelView {
            devices: &devices,
            now_ms: 0,
        };
        let candidates = Algorithm::LayerTwo.produce_candidates(&view);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, ConnectionType::Bridge);
        assert_eq!(candidates[0].base_confidence, 0.9);
    }

    #[test]
    fn layer_three_matches_gateway_holder() {
        let mut a = device("aabbccddee01");
        a.routing_table = vec![RouteEntry {
            destination: "0.0.0.0/0".into(),
            gateway: "192.168.1.1".into(),
            interface: "eth0".into(),
        }];
        let mut b = device("aabbccddee02");
        b.interfaces = vec![eth("lan0", "aa:bb:cc:dd:ee:02", "192.168.1.1/24")];

        let devices = vec![a, b];
        let view = ModelView {
            devices: &devices,
            now_ms: 0,
        };
        let candidates = Algorithm::LayerThree.produce_candidates(&view);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, ConnectionType::Route);
    }

    #[test]
    fn wifi_links_sta_to_ap() {
        let mut ap = device("aabbccddee01");
        ap.interfaces = vec![Interface {
            name: "wlan0".into(),
            kind: InterfaceKind::Wifi,
            mac: "aa:bb:cc:dd:ee:01".into(),
            addresses: vec![],
            wifi: Some(WifiInfo {
                mode: WifiMode::Ap,
                ssid: Some("lab".into()),
                bssid: Some("aa:bb:cc:dd:ee:01".into()),
                channel: Some(36),
                band: Some("5GHz".into()),
                rssi: None,
            }),
        }];
        let mut sta = device("aabbccddee02");
        sta.interfaces = vec![Interface {
            name: "wlan0".into(),
            kind: InterfaceKind::Wifi,
            mac: "aa:bb:cc:dd:ee:02".into(),
            addresses: vec![],
            wifi: Some(WifiInfo {
                mode: WifiMode::Sta,
                ssid: Some("lab".into()),
                bssid: Some("AA:BB:CC:DD:EE:01".into()),
                channel: Some(36),
                band: Some("5GHz".into()),
                rssi: Some(-45),
            }),
        }];

        let devices = vec![ap, sta];
        let view = ModelView {
            devices: &devices,
            now_ms: 0,
        };
        let candidates = Algorithm::Wifi.produce_candidates(&view);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rssi, Some(-45));
        assert_eq!(candidates[0].kind, ConnectionType::Wifi);
    }

    #[test]
    fn subnet_scan_pairs_same_network_only() {
        let mut a = device("aabbccddee01");
        a.interfaces = vec![eth("eth0", "aa:bb:cc:dd:ee:01", "192.168.1.10/24")];
        let mut b = device("aabbccddee02");
        b.interfaces = vec![eth("eth0", "aa:bb:cc:dd:ee:02", "192.168.1.20/24")];
        let mut c = device("aabbccddee03");
        c.interfaces = vec![eth("eth0", "aa:bb:cc:dd:ee:03", "10.0.0.1/8")];

        let devices = vec![a, b, c];
        let view = ModelView {
            devices: &devices,
            now_ms: 0,
        };
        let candidates = Algorithm::SubnetScan.produce_candidates(&view);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, ConnectionType::Scan);
    }
}
