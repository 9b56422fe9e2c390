//! The MCP façade: dispatches envelope requests onto the tool registry,
//! session manager and workflow engine.

use std::sync::Arc;
use std::time::Instant;

use llm::{SessionManager, ToolError, WorkflowEngine, WorkflowError, WorkflowRun};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::prompts::PromptCatalog;
use crate::resources::ResourceCatalog;
use crate::types::{
    CallToolResult, ContentBlock, McpErrorBody, McpRequest, McpResponse, PROTOCOL_VERSION,
    SERVER_NAME,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Derived workflow tools are exposed under this prefix.
const WORKFLOW_TOOL_PREFIX: &str = "workflow.";

pub struct McpAdapter {
    sessions: Arc<SessionManager>,
    engine: Arc<WorkflowEngine>,
    resources: ResourceCatalog,
    prompts: PromptCatalog,
    /// Lazily created session direct tool calls run in.
    shared_session: Mutex<Option<String>>,
    started_at: Instant,
}

impl McpAdapter {
    pub fn new(
        sessions: Arc<SessionManager>,
        engine: Arc<WorkflowEngine>,
        resources: ResourceCatalog,
    ) -> Self {
        Self {
            sessions,
            engine,
            resources,
            prompts: PromptCatalog::new(),
            shared_session: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub async fn handle(&self, request: McpRequest) -> McpResponse {
        debug!("mcp request: {}", request.method);
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => McpResponse::ok(id, self.initialize()),
            "tools.list" => McpResponse::ok(id, self.tools_list().await),
            "tools.call" => self.tools_call(id, &request.params).await,
            "resources.list" => McpResponse::ok(id, json!({"resources": self.resources.list()})),
            "resources.read" => self.resources_read(id, &request.params).await,
            "prompts.list" => McpResponse::ok(id, json!({"prompts": self.prompts.list()})),
            "prompts.get" => self.prompts_get(id, &request.params),
            "health" => McpResponse::ok(
                id,
                json!({"status": "ok", "uptime_s": self.started_at.elapsed().as_secs()}),
            ),
            "info" => McpResponse::ok(id, self.server_info()),
            other => McpResponse::err(id, McpErrorBody::method_not_found(other)),
        }
    }

    fn server_info(&self) -> Value {
        json!({"name": SERVER_NAME, "version": VERSION})
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {},
                "resources": {},
                "prompts": {},
            },
            "serverInfo": self.server_info(),
        })
    }

    async fn tools_list(&self) -> Value {
        let mut tools: Vec<Value> = self
            .sessions
            .registry()
            .list()
            .await
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "category": t.category,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();

        for def in self.engine.list().await {
            tools.push(json!({
                "name": format!("{WORKFLOW_TOOL_PREFIX}{}", def.id),
                "description": def.description,
                "category": "workflow",
                "inputSchema": workflow_schema(&def),
            }));
        }
        json!({"tools": tools})
    }

    async fn tools_call(&self, id: Option<Value>, params: &Value) -> McpResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::err(id, McpErrorBody::invalid_params("missing tool name"));
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        if let Some(workflow_id) = name.strip_prefix(WORKFLOW_TOOL_PREFIX) {
            return match self.engine.execute(workflow_id, arguments).await {
                Ok(run) => {
                    let def_name = self
                        .engine
                        .get(workflow_id)
                        .await
                        .map(|d| d.name)
                        .unwrap_or_else(|| workflow_id.to_string());
                    let result = consolidate_workflow_result(&def_name, &run);
                    McpResponse::ok(id, serde_json::to_value(result).unwrap_or_default())
                }
                Err(WorkflowError::UnknownWorkflow(w)) => {
                    McpResponse::err(id, McpErrorBody::not_found(&w))
                }
                Err(e) => McpResponse::ok(
                    id,
                    serde_json::to_value(CallToolResult::error(e.to_string()))
                        .unwrap_or_default(),
                ),
            };
        }

        let session_id = match self.ensure_session().await {
            Ok(session_id) => session_id,
            Err(e) => return McpResponse::err(id, McpErrorBody::internal(e.to_string())),
        };
        match self.sessions.execute_tool(&session_id, name, arguments).await {
            Ok(result) if result.success => {
                let blocks = vec![
                    ContentBlock::json(result.data.clone().unwrap_or(Value::Null)),
                    ContentBlock::text(format!(
                        "Tool {name} completed in {} ms",
                        result.duration_ms
                    )),
                ];
                McpResponse::ok(
                    id,
                    serde_json::to_value(CallToolResult::success(blocks)).unwrap_or_default(),
                )
            }
            // Downstream failure: a valid call whose result is an error.
            Ok(result) => McpResponse::ok(
                id,
                serde_json::to_value(CallToolResult::error(
                    result.error.unwrap_or_else(|| "tool failed".to_string()),
                ))
                .unwrap_or_default(),
            ),
            Err(ToolError::UnknownTool(t)) => McpResponse::err(id, McpErrorBody::not_found(&t)),
            Err(ToolError::Validation { details, .. }) => {
                McpResponse::err(id, McpErrorBody::invalid_params(details))
            }
            Err(e) => McpResponse::err(id, McpErrorBody::internal(e.to_string())),
        }
    }

    async fn ensure_session(&self) -> Result<String, ToolError> {
        let mut shared = self.shared_session.lock().await;
        if let Some(session_id) = shared.as_ref() {
            if self.sessions.get(session_id).is_ok() {
                return Ok(session_id.clone());
            }
        }
        let session = self.sessions.create(None, "mcp", json!({"origin": "mcp"})).await?;
        *shared = Some(session.session_id.clone());
        Ok(session.session_id)
    }

    async fn resources_read(&self, id: Option<Value>, params: &Value) -> McpResponse {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return McpResponse::err(id, McpErrorBody::invalid_params("missing uri"));
        };
        match self.resources.read(uri).await {
            None => McpResponse::err(id, McpErrorBody::not_found(uri)),
            Some(Ok(value)) => McpResponse::ok(id, value),
            Some(Err(e)) => McpResponse::err(id, McpErrorBody::internal(e)),
        }
    }

    fn prompts_get(&self, id: Option<Value>, params: &Value) -> McpResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::err(id, McpErrorBody::invalid_params("missing prompt name"));
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        match self.prompts.get(name, &arguments) {
            Some(text) => McpResponse::ok(id, json!({"name": name, "text": text})),
            None => McpResponse::err(id, McpErrorBody::not_found(name)),
        }
    }
}

/// JSON schema for a derived workflow tool, based on the workflow's
/// intent-specific parameter hints.
fn workflow_schema(def: &config::WorkflowDef) -> Value {
    let mut properties = serde_json::Map::new();
    match def.intent.primary.as_str() {
        "coverage" => {
            properties.insert(
                "location1".to_string(),
                json!({"type": "string", "description": "Area with the coverage problem"}),
            );
        }
        "roaming" => {
            properties.insert(
                "device_id".to_string(),
                json!({"type": "string", "description": "Client MAC or device id"}),
            );
            properties.insert(
                "window_hours".to_string(),
                json!({"type": "string", "description": "History window in hours"}),
            );
        }
        _ => {
            properties.insert(
                "device_id".to_string(),
                json!({"type": "string", "description": "Target device id or MAC"}),
            );
        }
    }
    let required: Vec<String> = def.metadata.requirements.clone();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": true,
    })
}

/// Consolidate a workflow run into MCP content blocks: summary,
/// recommendations, detailed results and execution details.
fn consolidate_workflow_result(workflow_name: &str, run: &WorkflowRun) -> CallToolResult {
    let duration_ms = run.finished_at - run.started_at;
    let summary = if run.success {
        format!(
            "Workflow {workflow_name} completed: {} of {} steps succeeded in {duration_ms} ms.",
            run.successful_steps(),
            run.steps.len()
        )
    } else {
        let failed: Vec<&str> = run
            .steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    llm::StepStatus::Failed | llm::StepStatus::TimedOut
                )
            })
            .map(|s| s.id.as_str())
            .collect();
        format!(
            "Workflow {workflow_name} failed at step(s) {}.",
            failed.join(", ")
        )
    };

    let mut blocks = vec![ContentBlock::text(summary)];

    // Surface recommendations buried in step outputs (the roaming query
    // and quality tools produce them).
    let mut recommendations: Vec<String> = Vec::new();
    for output in run.outputs.values() {
        if let Some(items) = output.get("recommendations").and_then(Value::as_array) {
            recommendations.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }
    if !recommendations.is_empty() {
        blocks.push(ContentBlock::text(format!(
            "Recommendations:\n- {}",
            recommendations.join("\n- ")
        )));
    }

    blocks.push(ContentBlock::json(json!({"results": run.outputs})));
    blocks.push(ContentBlock::json(json!({
        "execution_details": {
            "successful_steps": run.successful_steps(),
            "failed_steps": run
                .steps
                .iter()
                .filter(|s| matches!(s.status, llm::StepStatus::Failed | llm::StepStatus::TimedOut))
                .count(),
            "skipped_steps": run
                .steps
                .iter()
                .filter(|s| s.status == llm::StepStatus::Skipped)
                .count(),
            "duration_ms": duration_ms,
            "steps": run.steps.iter().map(|s| json!({
                "id": s.id,
                "status": s.status,
                "duration_ms": s.duration_ms,
            })).collect::<Vec<_>>(),
        }
    })));

    CallToolResult {
        content: blocks,
        is_error: !run.success,
    }
}
