use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangesetStatus {
    Draft,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

/// Per-step outcome recorded during changeset execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub command_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// A named group of device commands executed as a unit. The changeset
/// references commands by id but does not own their lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changeset {
    pub id: String,
    pub description: String,
    pub status: ChangesetStatus,
    pub created_at: i64,
    pub executed_at: Option<i64>,
    pub rolled_back_at: Option<i64>,
    /// `rolled_back_at` is only ever set when `executed_at` is.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub results: Vec<StepResult>,
    /// Opaque caller data, echoed back untouched.
    #[serde(default)]
    pub metadata: Value,
    /// Run steps concurrently instead of in order.
    #[serde(default)]
    pub parallel: bool,
}

impl Changeset {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            status: ChangesetStatus::Draft,
            created_at: crate::now_ms(),
            executed_at: None,
            rolled_back_at: None,
            commands: Vec::new(),
            results: Vec::new(),
            metadata: Value::Null,
            parallel: false,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("changeset:{}", self.id)
    }
}
