use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::ids::DeviceId;

#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    EnumString,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A device-originated event, persisted under `event:<ts_ms>:<id>` so that
/// range scans replay in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub id: String,
    pub device_id: DeviceId,
    pub event_type: String,
    pub topic: String,
    pub ts_ms: i64,
    pub severity: Severity,
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub processed: bool,
    pub processed_at: Option<i64>,
}

impl DeviceEvent {
    pub fn new(
        device_id: DeviceId,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        ts_ms: i64,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            event_type: event_type.into(),
            topic: topic.into(),
            ts_ms,
            severity,
            message: None,
            data: Value::Null,
            processed: false,
            processed_at: None,
        }
    }

    /// Storage key; timestamps are zero-padded so lexicographic order is
    /// chronological order.
    pub fn storage_key(&self) -> String {
        format!("event:{:020}:{}", self.ts_ms, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_sort_chronologically() {
        let dev = DeviceId::new("home", "main", "aabbccddeeff");
        let early = DeviceEvent::new(dev.clone(), "boot", "t", 999, Severity::Info);
        let late = DeviceEvent::new(dev, "boot", "t", 1_700_000_000_000, Severity::Info);
        assert!(early.storage_key() < late.storage_key());
    }
}
