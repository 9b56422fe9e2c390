use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::ids::DeviceId;

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    SpeedTest,
    WanTest,
    LatencyTest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub jitter_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WanTestResult {
    pub gateway_reachable: bool,
    pub gateway_latency_ms: Option<f64>,
    pub dns_latency_ms: Option<f64>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyTarget {
    pub target: String,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub loss_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatencyTestResult {
    pub targets: Vec<LatencyTarget>,
}

/// Typed payload of a completed probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    SpeedTest(SpeedTestResult),
    WanTest(WanTestResult),
    LatencyTest(LatencyTestResult),
}

impl ProbeOutcome {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeOutcome::SpeedTest(_) => ProbeKind::SpeedTest,
            ProbeOutcome::WanTest(_) => ProbeKind::WanTest,
            ProbeOutcome::LatencyTest(_) => ProbeKind::LatencyTest,
        }
    }
}

/// Cached last result of a probe for `(device, kind)` lookup. Exactly one
/// of `outcome` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub device_id: DeviceId,
    pub kind: ProbeKind,
    pub started_at: i64,
    pub finished_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProbeOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiagnosticRecord {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_some()
    }
}
