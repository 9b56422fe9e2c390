use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::connection::Connection;
use crate::device::Device;
use crate::ids::DeviceId;

/// A consistent `{devices, connections}` view produced under a read
/// barrier. Consumers must treat it as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub devices: Vec<Device>,
    pub connections: Vec<Connection>,
    pub generated_at: i64,
    /// Content hash of the snapshot; changes iff the topology changed.
    pub hash: u64,
}

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    PoorQuality,
    HighLatency,
    IsolatedNode,
}

/// A connection-quality anomaly published by the monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAnomaly {
    pub kind: AnomalyKind,
    pub device_id: DeviceId,
    /// Edge id when the anomaly is tied to a specific connection.
    pub connection_id: Option<String>,
    pub ts_ms: i64,
    pub detail: String,
}
