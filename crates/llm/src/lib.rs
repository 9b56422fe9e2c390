//! LLM tool registry, session manager and workflow engine.

mod builtin;
mod context;
mod error;
pub mod nl;
mod sessions;
mod tools;
mod validator;
mod workflow;

pub use builtin::register_builtin_tools;
pub use context::ToolContext;
pub use error::{ToolError, ToolResultT, WorkflowError, WorkflowResultT};
pub use sessions::SessionManager;
pub use tools::{Tool, ToolDescriptor, ToolFn, ToolRegistry};
pub use validator::{validate_set, validate_workflow, ValidationReport};
pub use workflow::{StepOutcome, StepStatus, WorkflowEngine, WorkflowRun};

use std::collections::HashSet;

/// Load workflow definitions from configuration into the engine after
/// validating them against the registered tool set. Returns the report;
/// definitions are only swapped in when valid.
pub async fn load_workflows(
    engine: &WorkflowEngine,
    set: config::WorkflowSet,
) -> ValidationReport {
    let tool_names: HashSet<String> = engine
        .registry()
        .list()
        .await
        .into_iter()
        .map(|t| t.name)
        .collect();
    let report = validate_set(&set.workflows, &tool_names);
    if report.is_valid {
        engine.reload(set.workflows).await;
    }
    report
}
