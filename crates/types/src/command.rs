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
pub enum CommandStatus {
    Pending,
    Sent,
    Accepted,
    Rejected,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandStatus {
    /// Terminal states can never be rewritten.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Rejected
                | CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is allowed. Status only
    /// advances monotonically through the state machine.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Sent) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Sent, Accepted) | (Sent, Rejected) | (Sent, Completed) | (Sent, Failed) => true,
            (Sent, Timeout) | (Sent, Cancelled) => true,
            (Accepted, Completed) | (Accepted, Failed) | (Accepted, Timeout) => true,
            (Accepted, Cancelled) => true,
            _ => false,
        }
    }
}

/// What the issuer waits for before considering the command settled.
#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Expectation {
    Ack,
    Result,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub device_id: DeviceId,
    pub operation: String,
    #[serde(default)]
    pub args: Value,
    pub timeout_ms: u64,
    pub status: CommandStatus,
    pub expect: Expectation,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Command {
    pub fn new(
        device_id: DeviceId,
        operation: impl Into<String>,
        args: Value,
        timeout_ms: u64,
        expect: Expectation,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            operation: operation.into(),
            args,
            timeout_ms,
            status: CommandStatus::Pending,
            expect,
            created_at: crate::now_ms(),
            sent_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("cmd:{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_transition() {
        for terminal in [
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Timeout,
            CommandStatus::Cancelled,
            CommandStatus::Rejected,
        ] {
            assert!(!terminal.can_transition_to(CommandStatus::Sent));
            assert!(!terminal.can_transition_to(CommandStatus::Completed));
        }
    }

    #[test]
    fn happy_path_transitions() {
        assert!(CommandStatus::Pending.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::Accepted));
        assert!(CommandStatus::Accepted.can_transition_to(CommandStatus::Completed));
    }

    #[test]
    fn no_skipping_backwards() {
        assert!(!CommandStatus::Accepted.can_transition_to(CommandStatus::Sent));
        assert!(!CommandStatus::Sent.can_transition_to(CommandStatus::Pending));
    }
}
