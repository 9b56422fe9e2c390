//! Wire envelopes for every message kind the controller speaks, plus the
//! `schema` tag grammar they all share.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Health;
use crate::event::Severity;

/// Parsed `schema` field: `<kind>(.<detail>)?/<major>.<minor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTag {
    pub kind: String,
    pub detail: Option<String>,
    pub major: u32,
    pub minor: u32,
}

impl SchemaTag {
    pub fn new(kind: &str, detail: Option<&str>, major: u32, minor: u32) -> Self {
        Self {
            kind: kind.to_string(),
            detail: detail.map(str::to_string),
            major,
            minor,
        }
    }
}

impl fmt::Display for SchemaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}.{}/{}.{}", self.kind, d, self.major, self.minor),
            None => write!(f, "{}/{}.{}", self.kind, self.major, self.minor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed schema tag {0:?}")]
pub struct SchemaTagParseError(pub String);

impl FromStr for SchemaTag {
    type Err = SchemaTagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .split_once('/')
            .ok_or_else(|| SchemaTagParseError(s.to_string()))?;
        let (major, minor) = version
            .split_once('.')
            .ok_or_else(|| SchemaTagParseError(s.to_string()))?;
        let major: u32 = major
            .parse()
            .map_err(|_| SchemaTagParseError(s.to_string()))?;
        let minor: u32 = minor
            .parse()
            .map_err(|_| SchemaTagParseError(s.to_string()))?;
        let (kind, detail) = match name.split_once('.') {
            Some((k, d)) if !d.is_empty() => (k, Some(d)),
            _ => (name, None),
        };
        if kind.is_empty() {
            return Err(SchemaTagParseError(s.to_string()));
        }
        Ok(SchemaTag {
            kind: kind.to_string(),
            detail: detail.map(str::to_string),
            major,
            minor,
        })
    }
}

/// Header every payload carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub ts: i64,
}

/// `state/1.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMsg {
    pub schema: String,
    pub ts: i64,
    pub health: Health,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub components: HashMap<String, Value>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Interface inventory, bridge/routing tables and DHCP leases ride on
    /// state as optional sections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<crate::device::Interface>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_table: Option<Vec<crate::device::BridgeEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_table: Option<Vec<crate::device::RouteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_server: Option<crate::device::DhcpServer>,
}

/// `attr/1.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrMsg {
    pub schema: String,
    pub ts: i64,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    pub mac_address: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `evt.<category>/1.x`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvtMsg {
    pub schema: String,
    pub ts: i64,
    pub event_type: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// `lwt/1.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwtMsg {
    pub schema: String,
    pub ts: i64,
    pub device_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `cmd.<op>/1.x` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdReqMsg {
    pub schema: String,
    pub ts: i64,
    pub id: String,
    pub op: String,
    #[serde(default)]
    pub args: Value,
    pub timeout_ms: u64,
    pub expect: crate::command::Expectation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// `cmd.ack/1.0`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdAckMsg {
    pub schema: String,
    pub ts: i64,
    pub id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Timeout,
}

/// `cmd.<op>.result/1.x`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdResMsg {
    pub schema: String,
    pub ts: i64,
    pub id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tag_round_trip() {
        let tag: SchemaTag = "telemetry.wifi/1.2".parse().unwrap();
        assert_eq!(tag.kind, "telemetry");
        assert_eq!(tag.detail.as_deref(), Some("wifi"));
        assert_eq!((tag.major, tag.minor), (1, 2));
        assert_eq!(tag.to_string(), "telemetry.wifi/1.2");

        let plain: SchemaTag = "state/1.0".parse().unwrap();
        assert_eq!(plain.kind, "state");
        assert!(plain.detail.is_none());
    }

    #[test]
    fn schema_tag_rejects_garbage() {
        assert!("state".parse::<SchemaTag>().is_err());
        assert!("state/one.zero".parse::<SchemaTag>().is_err());
        assert!("/1.0".parse::<SchemaTag>().is_err());
    }

    #[test]
    fn cmd_result_deserializes() {
        let raw = r#"{"schema":"cmd.speed_test.result/1.0","ts":1700000000000,
            "id":"C1","status":"completed","result":{"download_mbps":85.2}}"#;
        let msg: CmdResMsg = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.status, ResultStatus::Completed);
        assert_eq!(msg.result.unwrap()["download_mbps"], 85.2);
    }
}
