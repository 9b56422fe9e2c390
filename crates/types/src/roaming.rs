use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// One observation of a WiFi client moving between APs. Derived by the
/// roaming detector; never externally authored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoamingEvent {
    pub ts_ms: i64,
    /// Client MAC, normalized.
    pub device_mac: String,
    pub from_ap: String,
    pub to_ap: String,
    pub from_ssid: Option<String>,
    pub to_ssid: Option<String>,
    pub reason: RoamReason,
    /// Handover duration in milliseconds, when observable.
    pub duration_ms: i64,
    pub signal_before: Option<i32>,
    pub signal_after: Option<i32>,
    /// Handover quality in `[0, 1]`: RSSI improvement raises it, long or
    /// signal-degrading handovers lower it.
    pub quality: f64,
}

impl RoamingEvent {
    pub fn storage_key(&self) -> String {
        format!("roaming:{:020}:{}", self.ts_ms, self.device_mac)
    }
}

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoamReason {
    BssidChange,
    Reconnect,
    Unknown,
}

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionClass {
    Optimal,
    Normal,
    Problematic,
    Unusual,
}

/// A maximal run of one client's roaming events separated by at most the
/// configured gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoamingSession {
    pub id: String,
    pub device_mac: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
    /// APs visited, in order, including the starting AP.
    pub ap_sequence: Vec<String>,
    pub events: Vec<RoamingEvent>,
    pub avg_quality: f64,
    pub class: SessionClass,
}

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoamingPatternKind {
    Sequential,
    Cyclic,
    Radial,
    Random,
    Predictable,
    PingPong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoamingPattern {
    pub kind: RoamingPatternKind,
    pub device_mac: String,
    /// APs participating in the pattern.
    pub aps: Vec<String>,
    pub occurrences: u32,
    pub confidence: f64,
}

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoamingAnomalyKind {
    PingPong,
    RepeatedFailure,
    LongDwellIsolated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoamingAnomaly {
    pub kind: RoamingAnomalyKind,
    pub device_mac: String,
    pub ts_ms: i64,
    pub detail: String,
}
