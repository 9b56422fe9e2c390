//! Workflow engine: executes declarative step trees over the tool
//! registry. Reload swaps the definition map atomically; executions in
//! flight keep the version they started with.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use config::{ConditionDef, ConditionOperator, StepDef, StepType, WorkflowDef};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ToolError, WorkflowError, WorkflowResultT};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
    TimedOut,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StepOutcome {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: i64,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub success: bool,
    pub started_at: i64,
    pub finished_at: i64,
    /// Outputs keyed by `output_binding`.
    pub outputs: HashMap<String, Value>,
    pub steps: Vec<StepOutcome>,
}

impl WorkflowRun {
    pub fn successful_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }
}

/// Mutable execution state threaded through the step tree.
#[derive(Default, Clone)]
struct ExecState {
    params: Value,
    /// Raw step outputs by step id.
    by_step: HashMap<String, Value>,
    /// Bound outputs by `output_binding` name.
    bindings: HashMap<String, Value>,
}

impl ExecState {
    /// Resolve one input-mapping value: `$steps.<id>.<path>` references a
    /// prior step output, `$params.<name>` a query parameter, anything
    /// else is a literal.
    fn resolve(&self, value: &Value, step_id: &str) -> WorkflowResultT<Value> {
        let Some(raw) = value.as_str() else {
            return Ok(value.clone());
        };
        if let Some(reference) = raw.strip_prefix("$steps.") {
            let mut parts = reference.split('.');
            let id = parts.next().unwrap_or_default();
            let root = self
                .by_step
                .get(id)
                .or_else(|| self.bindings.get(id))
                .ok_or_else(|| WorkflowError::BadReference {
                    step: step_id.to_string(),
                    reference: raw.to_string(),
                })?;
            let mut cursor = root;
            for part in parts {
                cursor = cursor.get(part).ok_or_else(|| WorkflowError::BadReference {
                    step: step_id.to_string(),
                    reference: raw.to_string(),
                })?;
            }
            return Ok(cursor.clone());
        }
        if let Some(name) = raw.strip_prefix("$params.") {
            return Ok(self.params.get(name).cloned().unwrap_or(Value::Null));
        }
        Ok(value.clone())
    }

    /// Context object the condition evaluator walks.
    fn context_value(&self) -> Value {
        let mut root = serde_json::Map::new();
        root.insert("params".to_string(), self.params.clone());
        root.insert("steps".to_string(), json!(self.by_step));
        for (k, v) in &self.bindings {
            root.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(root)
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;
    for part in path.split('.') {
        cursor = cursor.get(part)?;
    }
    Some(cursor)
}

fn evaluate_condition(cond: &ConditionDef, context: &Value) -> bool {
    let field = lookup_path(context, &cond.field);
    match cond.operator {
        ConditionOperator::Exists => field.is_some_and(|v| !v.is_null()),
        ConditionOperator::Eq => field.is_some_and(|v| v == &cond.value),
        ConditionOperator::Ne => field.map_or(true, |v| v != &cond.value),
        ConditionOperator::Contains => field.is_some_and(|v| match (v, &cond.value) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        }),
        ConditionOperator::Gt | ConditionOperator::Ge | ConditionOperator::Lt | ConditionOperator::Le => {
            let (Some(lhs), Some(rhs)) =
                (field.and_then(Value::as_f64), cond.value.as_f64())
            else {
                return false;
            };
            match cond.operator {
                ConditionOperator::Gt => lhs > rhs,
                ConditionOperator::Ge => lhs >= rhs,
                ConditionOperator::Lt => lhs < rhs,
                ConditionOperator::Le => lhs <= rhs,
                _ => unreachable!(),
            }
        }
    }
}

pub struct WorkflowEngine {
    registry: Arc<ToolRegistry>,
    defs: RwLock<Arc<HashMap<String, WorkflowDef>>>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            defs: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Atomically replace the workflow set. In-flight executions keep the
    /// map they started with.
    pub async fn reload(&self, workflows: HashMap<String, WorkflowDef>) {
        info!("workflow registry reloaded: {} definitions", workflows.len());
        *self.defs.write().await = Arc::new(workflows);
    }

    pub async fn list(&self) -> Vec<WorkflowDef> {
        let defs = self.defs.read().await;
        let mut out: Vec<WorkflowDef> = defs.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get(&self, id: &str) -> Option<WorkflowDef> {
        self.defs.read().await.get(id).cloned()
    }

    pub async fn execute(&self, id: &str, params: Value) -> WorkflowResultT<WorkflowRun> {
        let version = self.defs.read().await.clone();
        let def = version
            .get(id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(id.to_string()))?;

        let started_at = types::now_ms();
        let mut state = ExecState {
            params,
            ..ExecState::default()
        };
        let mut outcomes = Vec::new();
        let mut success = true;

        for step in &def.steps {
            let outcome = self.run_step(step, &mut state).await;
            let failed = matches!(outcome.status, StepStatus::Failed | StepStatus::TimedOut);
            outcomes.push(outcome);
            if failed && !step.optional {
                success = false;
                break;
            }
        }

        Ok(WorkflowRun {
            workflow_id: def.id.clone(),
            success,
            started_at,
            finished_at: types::now_ms(),
            outputs: state.bindings,
            steps: outcomes,
        })
    }

    fn run_step<'a>(
        &'a self,
        step: &'a StepDef,
        state: &'a mut ExecState,
    ) -> Pin<Box<dyn std::future::Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(async move {
            let started = types::now_ms();
            let result = match step.step_type {
                StepType::Tool => self.run_tool_step(step, state).await,
                StepType::Condition => self.run_condition_step(step, state).await,
                StepType::Parallel => self.run_parallel_step(step, state).await,
                StepType::Sequential => self.run_sequential_step(step, state).await,
                StepType::Aggregate => self.run_aggregate_step(step, state),
            };
            let duration_ms = types::now_ms() - started;

            match result {
                Ok(Some(output)) => {
                    state.by_step.insert(step.id.clone(), output.clone());
                    if let Some(binding) = &step.output_binding {
                        state.bindings.insert(binding.clone(), output.clone());
                    }
                    StepOutcome {
                        id: step.id.clone(),
                        name: step.name.clone(),
                        status: StepStatus::Success,
                        duration_ms,
                        output: Some(output),
                        error: None,
                    }
                }
                Ok(None) => StepOutcome {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    duration_ms,
                    output: None,
                    error: None,
                },
                Err(WorkflowError::StepTimeout(_)) => StepOutcome {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    status: StepStatus::TimedOut,
                    duration_ms,
                    output: None,
                    error: Some("timeout".to_string()),
                },
                Err(e) => StepOutcome {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    status: StepStatus::Failed,
                    duration_ms,
                    output: None,
                    error: Some(e.to_string()),
                },
            }
        })
    }

    async fn run_tool_step(
        &self,
        step: &StepDef,
        state: &mut ExecState,
    ) -> WorkflowResultT<Option<Value>> {
        let tool_name = step.tool_name.as_deref().ok_or_else(|| {
            WorkflowError::Tool(ToolError::UnknownTool(format!(
                "step {} has no tool_name",
                step.id
            )))
        })?;

        let mut params = serde_json::Map::new();
        for (key, raw) in &step.input_mapping {
            params.insert(key.clone(), state.resolve(raw, &step.id)?);
        }
        let params = Value::Object(params);

        debug!("workflow step {} invoking {tool_name}", step.id);
        let invocation = self.registry.invoke(tool_name, params);
        let output = match step.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), invocation)
                .await
                .map_err(|_| WorkflowError::StepTimeout(step.id.clone()))??,
            None => invocation.await?,
        };
        Ok(Some(output))
    }

    async fn run_condition_step(
        &self,
        step: &StepDef,
        state: &mut ExecState,
    ) -> WorkflowResultT<Option<Value>> {
        let Some(cond) = &step.condition else {
            return Ok(None);
        };
        if !evaluate_condition(cond, &state.context_value()) {
            return Ok(None);
        }
        for sub in &step.sub_steps {
            let outcome = self.run_step(sub, state).await;
            if matches!(outcome.status, StepStatus::Failed | StepStatus::TimedOut) && !sub.optional
            {
                return Err(WorkflowError::StepFailed {
                    step: sub.id.clone(),
                    reason: outcome.error.unwrap_or_default(),
                });
            }
        }
        Ok(Some(json!({"matched": true})))
    }

    async fn run_parallel_step(
        &self,
        step: &StepDef,
        state: &mut ExecState,
    ) -> WorkflowResultT<Option<Value>> {
        // Sub-steps run without ordering against a snapshot of the state;
        // their outputs merge when all have settled.
        let snapshot = state.clone();
        let futures = step.sub_steps.iter().map(|sub| {
            let mut local = snapshot.clone();
            async move {
                let outcome = self.run_step(sub, &mut local).await;
                (sub, outcome, local)
            }
        });

        let mut merged = serde_json::Map::new();
        for (sub, outcome, local) in join_all(futures).await {
            if matches!(outcome.status, StepStatus::Failed | StepStatus::TimedOut) && !sub.optional
            {
                return Err(WorkflowError::StepFailed {
                    step: sub.id.clone(),
                    reason: outcome.error.unwrap_or_default(),
                });
            }
            for (k, v) in local.by_step {
                state.by_step.entry(k).or_insert(v);
            }
            for (k, v) in local.bindings {
                state.bindings.entry(k).or_insert(v);
            }
            if let Some(output) = outcome.output {
                merged.insert(sub.id.clone(), output);
            }
        }
        Ok(Some(Value::Object(merged)))
    }

    async fn run_sequential_step(
        &self,
        step: &StepDef,
        state: &mut ExecState,
    ) -> WorkflowResultT<Option<Value>> {
        let mut merged = serde_json::Map::new();
        for sub in &step.sub_steps {
            let outcome = self.run_step(sub, state).await;
            let failed = matches!(outcome.status, StepStatus::Failed | StepStatus::TimedOut);
            if let Some(output) = outcome.output {
                merged.insert(sub.id.clone(), output);
            }
            if failed && !sub.optional {
                return Err(WorkflowError::StepFailed {
                    step: sub.id.clone(),
                    reason: outcome.error.unwrap_or_default(),
                });
            }
        }
        Ok(Some(Value::Object(merged)))
    }

    /// Aggregate: a named merge of listed prior outputs.
    fn run_aggregate_step(
        &self,
        step: &StepDef,
        state: &mut ExecState,
    ) -> WorkflowResultT<Option<Value>> {
        let mut merged = serde_json::Map::new();
        for source in &step.sources {
            let value = state
                .bindings
                .get(source)
                .or_else(|| state.by_step.get(source))
                .cloned()
                .ok_or_else(|| WorkflowError::BadReference {
                    step: step.id.clone(),
                    reference: source.clone(),
                })?;
            merged.insert(source.clone(), value);
        }
        Ok(Some(Value::Object(merged)))
    }
}
