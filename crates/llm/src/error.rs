use thiserror::Error;

/// Tool-layer failures: validation problems are the caller's fault,
/// execution problems are downstream.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid params for {tool}: {details}")]
    Validation { tool: String, details: String },

    #[error("tool {tool} failed: {details}")]
    Execution { tool: String, details: String },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {0} is not active")]
    SessionClosed(String),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

pub type ToolResultT<T> = std::result::Result<T, ToolError>;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("required step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("step {0} timed out")]
    StepTimeout(String),

    #[error("unresolvable reference {reference} in step {step}")]
    BadReference { step: String, reference: String },

    #[error("no workflow matches the given input")]
    NoMatch,

    #[error(transparent)]
    Tool(#[from] ToolError),
}

pub type WorkflowResultT<T> = std::result::Result<T, WorkflowError>;
