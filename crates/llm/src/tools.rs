use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use types::ToolCategory;

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResultT};

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolResultT<Value>> + Send>>;
pub type ToolFn = Arc<dyn Fn(Value, Arc<ToolContext>) -> ToolFuture + Send + Sync>;

/// A tool as a value: name, schema, category and an execute closure.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    /// JSON Schema for the params object.
    pub input_schema: Value,
    pub execute: ToolFn,
}

impl Tool {
    pub fn new<F, Fut>(
        name: &str,
        description: &str,
        category: ToolCategory,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, Arc<ToolContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResultT<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            input_schema,
            execute: Arc::new(move |params, ctx| Box::pin(f(params, ctx))),
        }
    }

    /// Validate params against the tool's schema.
    pub fn validate(&self, params: &Value) -> ToolResultT<()> {
        if !jsonschema::is_valid(&self.input_schema, params) {
            return Err(ToolError::Validation {
                tool: self.name.clone(),
                details: "params do not match the tool's input schema".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Compact descriptor for listing surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub input_schema: Value,
}

/// Registry of tools keyed by name, populated at startup.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<Tool>>>,
    ctx: Arc<ToolContext>,
}

impl ToolRegistry {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            ctx,
        }
    }

    pub fn context(&self) -> Arc<ToolContext> {
        self.ctx.clone()
    }

    pub async fn register(&self, tool: Tool) {
        self.tools.write().await.insert(tool.name.clone(), Arc::new(tool));
    }

    pub async fn get(&self, name: &str) -> ToolResultT<Arc<Tool>> {
        self.tools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolDescriptor> = tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                category: t.category,
                input_schema: t.input_schema.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Validate and run a tool outside any session (workflow steps and
    /// resource providers use this path).
    pub async fn invoke(&self, name: &str, params: Value) -> ToolResultT<Value> {
        let tool = self.get(name).await?;
        tool.validate(&params)?;
        (tool.execute)(params, self.ctx.clone()).await
    }
}
