use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use storage::{keys, Store};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use types::{
    DeviceId, LlmSession, SessionStatus, ToolCall, ToolCallStatus, ToolResult,
};

use crate::error::{ToolError, ToolResultT};
use crate::tools::ToolRegistry;

/// Session manager: session lifecycle plus serialized tool execution
/// within each session. Sessions are independent of each other.
pub struct SessionManager {
    store: Store,
    registry: Arc<ToolRegistry>,
    /// Per-session locks serializing tool calls.
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Store, registry: Arc<ToolRegistry>) -> Self {
        Self {
            store,
            registry,
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    pub async fn create(
        &self,
        device_id: Option<DeviceId>,
        user_id: &str,
        metadata: Value,
    ) -> ToolResultT<LlmSession> {
        let session = LlmSession::new(device_id, user_id, metadata);
        self.store.put_json(session.storage_key(), &session)?;
        self.locks
            .write()
            .await
            .insert(session.session_id.clone(), Arc::new(Mutex::new(())));
        info!("created session {} for {user_id}", session.session_id);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> ToolResultT<LlmSession> {
        self.store
            .get_json::<LlmSession>(&keys::session(session_id))?
            .ok_or_else(|| ToolError::UnknownSession(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<LlmSession> {
        self.store
            .iterate_prefix(keys::SESSION_PREFIX)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }

    pub async fn close(&self, session_id: &str, status: SessionStatus) -> ToolResultT<LlmSession> {
        let mut session = self.get(session_id)?;
        session.status = status;
        session.updated_at = types::now_ms();
        self.store.put_json(session.storage_key(), &session)?;
        self.locks.write().await.remove(session_id);
        Ok(session)
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.write().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Execute a tool within a session: validate, record the call in
    /// `running` state, invoke, record completion. Calls within one
    /// session are strictly serialized.
    pub async fn execute_tool(
        &self,
        session_id: &str,
        name: &str,
        params: Value,
    ) -> ToolResultT<ToolResult> {
        let lock = self.session_lock(session_id).await;
        let _serialized = lock.lock().await;

        let mut session = self.get(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(ToolError::SessionClosed(session_id.to_string()));
        }

        let tool = self.registry.get(name).await?;
        tool.validate(&params)?;

        let started_at = types::now_ms();
        session.tool_calls.push(ToolCall {
            tool_name: name.to_string(),
            params: params.clone(),
            started_at,
            completed_at: None,
            status: ToolCallStatus::Running,
            result: None,
            error: None,
        });
        session.updated_at = started_at;
        self.store.put_json(session.storage_key(), &session)?;

        let outcome = (tool.execute)(params, self.registry.context()).await;
        let completed_at = types::now_ms();

        let call = session
            .tool_calls
            .last_mut()
            .expect("call recorded above");
        call.completed_at = Some(completed_at);
        let result = match outcome {
            Ok(data) => {
                call.status = ToolCallStatus::Completed;
                call.result = Some(data.clone());
                ToolResult::ok(data, completed_at - started_at)
            }
            Err(e) => {
                call.status = ToolCallStatus::Failed;
                call.error = Some(e.to_string());
                ToolResult::err(e.to_string(), completed_at - started_at)
            }
        };
        session.updated_at = completed_at;
        self.store.put_json(session.storage_key(), &session)?;

        Ok(result.with_session(session_id, &session.trace_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::builtin::register_builtin_tools;
    use crate::context::ToolContext;
    use commands::{ChangesetManager, CommandManager, NoPriorValues};
    use devices::DeviceManager;
    use diagnostics::DiagnosticsEngine;
    use roaming::{RoamingDetector, RoamingHistoryEngine};
    use topology::{QualityMonitor, TopologyManager};

    pub(crate) async fn test_registry() -> Arc<ToolRegistry> {
        let store = Store::new();
        let device_mgr = Arc::new(DeviceManager::new(store.clone(), 60_000));
        let topo = Arc::new(TopologyManager::new(
            device_mgr.clone(),
            config::InferenceConfig::default(),
        ));
        let _quality = QualityMonitor::new(60_000);
        let detector = Arc::new(RoamingDetector::new(store.clone(), 30_000));
        let history = Arc::new(RoamingHistoryEngine::new(
            detector,
            config::RoamingConfig::default(),
            &config::HistoryConfig::default(),
        ));
        let publisher: Arc<dyn commands::RequestPublisher> = Arc::new(NullPublisher);
        let commands = Arc::new(CommandManager::new(store.clone(), publisher));
        let changesets = Arc::new(ChangesetManager::new(
            store.clone(),
            commands.clone(),
            Arc::new(NoPriorValues),
        ));
        let diag = Arc::new(DiagnosticsEngine::new(commands.clone(), store.clone(), 3));

        let ctx = Arc::new(ToolContext {
            devices: device_mgr,
            topology: topo,
            roaming: history,
            diagnostics: diag,
            commands,
            changesets,
            namespace: config::NamespaceConfig::default(),
        });
        let registry = Arc::new(ToolRegistry::new(ctx));
        register_builtin_tools(&registry).await;
        registry
    }

    struct NullPublisher;

    #[async_trait::async_trait]
    impl commands::RequestPublisher for NullPublisher {
        async fn publish_request(
            &self,
            _topic: &str,
            _msg: &types::wire::CmdReqMsg,
        ) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn session_lifecycle_and_tool_history() {
        let registry = test_registry().await;
        let manager = SessionManager::new(Store::new(), registry);

        let session = manager
            .create(None, "operator", Value::Null)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let result = manager
            .execute_tool(&session.session_id, "devices.list", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.session_id.as_deref(), Some(session.session_id.as_str()));
        assert!(result.duration_ms >= 0);

        let reloaded = manager.get(&session.session_id).unwrap();
        assert_eq!(reloaded.tool_calls.len(), 1);
        assert_eq!(reloaded.tool_calls[0].status, ToolCallStatus::Completed);

        let closed = manager
            .close(&session.session_id, SessionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Completed);

        // A closed session refuses further tool calls.
        assert!(matches!(
            manager
                .execute_tool(&session.session_id, "devices.list", serde_json::json!({}))
                .await,
            Err(ToolError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_params_are_distinct() {
        let registry = test_registry().await;
        let manager = SessionManager::new(Store::new(), registry);
        let session = manager.create(None, "operator", Value::Null).await.unwrap();

        assert!(matches!(
            manager
                .execute_tool(&session.session_id, "no.such.tool", serde_json::json!({}))
                .await,
            Err(ToolError::UnknownTool(_))
        ));

        // devices.get requires device_id.
        assert!(matches!(
            manager
                .execute_tool(&session.session_id, "devices.get", serde_json::json!({}))
                .await,
            Err(ToolError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn failed_tool_is_recorded_and_surfaced() {
        let registry = test_registry().await;
        let manager = SessionManager::new(Store::new(), registry);
        let session = manager.create(None, "operator", Value::Null).await.unwrap();

        let result = manager
            .execute_tool(
                &session.session_id,
                "devices.get",
                serde_json::json!({"device_id": "home:main:000000000000"}),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());

        let reloaded = manager.get(&session.session_id).unwrap();
        assert_eq!(reloaded.tool_calls[0].status, ToolCallStatus::Failed);
    }
}
