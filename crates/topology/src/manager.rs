use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use devices::DeviceManager;
use tokio::sync::RwLock;
use tracing::debug;
use types::{Connection, Device, DeviceId, TopologySnapshot};

use crate::algorithms::{Algorithm, ModelView};
use crate::fusion;

/// Owns the edge set and produces consistent snapshots. Nodes and edges
/// are independently indexed collections; edges never hold references
/// into the device map.
pub struct TopologyManager {
    devices: Arc<DeviceManager>,
    edges: RwLock<HashMap<(DeviceId, DeviceId), Connection>>,
    last_hash: RwLock<u64>,
    cfg: config::InferenceConfig,
}

impl TopologyManager {
    pub fn new(devices: Arc<DeviceManager>, cfg: config::InferenceConfig) -> Self {
        Self {
            devices,
            edges: RwLock::new(HashMap::new()),
            last_hash: RwLock::new(0),
            cfg,
        }
    }

    /// Run one full inference cycle. Returns the new snapshot hash when
    /// the topology changed.
    pub async fn run_inference(&self, now_ms: i64) -> Option<u64> {
        let device_list = self.devices.all().await;
        let view = ModelView {
            devices: &device_list,
            now_ms,
        };

        let mut candidates = Vec::new();
        for algorithm in Algorithm::ALL {
            candidates.extend(algorithm.produce_candidates(&view));
        }

        let mut edges = self.edges.write().await;
        let fused = fusion::fuse(candidates, &edges, &self.cfg, now_ms);

        // Replace the edge set wholesale; edges for vanished devices are
        // pruned here because fusion only sees current devices.
        let known: HashSet<&DeviceId> = device_list.iter().map(|d| &d.id).collect();
        edges.clear();
        for edge in fused {
            if known.contains(&edge.from_device) && known.contains(&edge.to_device) {
                edges.insert((edge.from_device.clone(), edge.to_device.clone()), edge);
            }
        }

        let hash = Self::content_hash(&device_list, edges.values());
        drop(edges);

        let mut last = self.last_hash.write().await;
        if *last != hash {
            debug!("topology changed, hash {hash:016x}");
            *last = hash;
            Some(hash)
        } else {
            None
        }
    }

    /// A consistent `{devices, connections}` snapshot under a read barrier.
    pub async fn get_current_topology(&self) -> TopologySnapshot {
        // Lock order: edges before device read to pair with run_inference
        // holding the edge write lock across its device read.
        let edges = self.edges.read().await;
        let devices = self.devices.all().await;
        let mut connections: Vec<Connection> = edges.values().cloned().collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));
        let hash = Self::content_hash(&devices, connections.iter());
        TopologySnapshot {
            devices,
            connections,
            generated_at: types::now_ms(),
            hash,
        }
    }

    pub async fn connections(&self) -> Vec<Connection> {
        let edges = self.edges.read().await;
        let mut out: Vec<Connection> = edges.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Edges touching one device.
    pub async fn connections_of(&self, device: &DeviceId) -> Vec<Connection> {
        self.connections()
            .await
            .into_iter()
            .filter(|e| &e.from_device == device || &e.to_device == device)
            .collect()
    }

    fn content_hash<'a>(
        devices: &[Device],
        connections: impl Iterator<Item = &'a Connection>,
    ) -> u64 {
        let mut ids: Vec<String> = devices
            .iter()
            .map(|d| format!("{}|{}|{}", d.id, d.online, d.health))
            .collect();
        ids.sort();
        let mut edge_keys: Vec<String> = connections
            .map(|e| {
                format!(
                    "{}|{}|{:.3}|{}",
                    e.id, e.connection_type, e.metrics.confidence, e.is_direct_link
                )
            })
            .collect();
        edge_keys.sort();

        let mut hasher = DefaultHasher::new();
        ids.hash(&mut hasher);
        edge_keys.hash(&mut hasher);
        hasher.finish()
    }
}
