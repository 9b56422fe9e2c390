use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::ids::DeviceId;

#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Test,
    Act,
    Workflow,
}

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Failed,
}

/// One tool invocation recorded in a session's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub params: Value,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// An LLM-driven diagnostic session. Tool calls within one session are
/// strictly serialized; sessions are independent of each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSession {
    pub session_id: String,
    pub device_id: Option<DeviceId>,
    pub user_id: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub trace_id: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub metadata: Value,
}

impl LlmSession {
    pub fn new(device_id: Option<DeviceId>, user_id: impl Into<String>, metadata: Value) -> Self {
        let now = crate::now_ms();
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_id,
            user_id: user_id.into(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            trace_id: Uuid::new_v4().to_string(),
            tool_calls: Vec::new(),
            metadata,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("session:{}", self.session_id)
    }
}

/// Result of executing a tool on an LLM's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub trace_id: Option<String>,
    pub duration_ms: i64,
}

impl ToolResult {
    pub fn ok(data: Value, duration_ms: i64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            session_id: None,
            trace_id: None,
            duration_ms,
        }
    }

    pub fn err(message: impl Into<String>, duration_ms: i64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            session_id: None,
            trace_id: None,
            duration_ms,
        }
    }

    pub fn with_session(mut self, session_id: &str, trace_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self.trace_id = Some(trace_id.to_string());
        self
    }
}
