//! End-to-end exercises of the MCP façade over a fully wired (brokerless)
//! controller stack. A fake publisher plays the device side of the
//! command plane so probes complete.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use commands::{ChangesetManager, CommandManager, NoPriorValues, RequestPublisher};
use devices::DeviceManager;
use diagnostics::DiagnosticsEngine;
use llm::{
    load_workflows, register_builtin_tools, SessionManager, ToolContext, ToolRegistry,
    WorkflowEngine,
};
use mcp::{McpAdapter, McpRequest, ResourceCatalog};
use roaming::{RoamingDetector, RoamingHistoryEngine};
use serde_json::{json, Value};
use storage::Store;
use topology::TopologyManager;
use types::wire::{CmdReqMsg, CmdResMsg, ResultStatus, StateMsg};
use types::{DeviceId, Health};

/// Plays the device: acknowledges every request with a completed result.
struct EchoDevice {
    manager: OnceLock<Arc<CommandManager>>,
    speed_tests: AtomicUsize,
}

impl EchoDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: OnceLock::new(),
            speed_tests: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl RequestPublisher for EchoDevice {
    async fn publish_request(&self, _topic: &str, msg: &CmdReqMsg) -> Result<(), String> {
        if msg.op == "speed_test" {
            self.speed_tests.fetch_add(1, Ordering::SeqCst);
        }
        let result = match msg.op.as_str() {
            "speed_test" => json!({"download_mbps": 85.2, "upload_mbps": 12.4}),
            "wan_test" => json!({"gateway_reachable": true, "gateway_latency_ms": 2.0,
                                 "dns_latency_ms": 8.0, "public_ip": "203.0.113.7"}),
            _ => json!({}),
        };
        let manager = self.manager.get().expect("manager wired").clone();
        let response = CmdResMsg {
            schema: format!("cmd.{}.result/1.0", msg.op),
            ts: types::now_ms(),
            id: msg.id.clone(),
            status: ResultStatus::Completed,
            result: Some(result),
            error: None,
        };
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let _ = manager.handle_result(&response).await;
        });
        Ok(())
    }
}

async fn build_adapter() -> (McpAdapter, Arc<EchoDevice>) {
    let store = Store::new();
    let device_mgr = Arc::new(DeviceManager::new(store.clone(), 60_000));

    // One online router the probes can target.
    let router = DeviceId::new("home", "main", "r1r1r1r1r1r1");
    let state = StateMsg {
        schema: "state/1.0".into(),
        ts: types::now_ms(),
        health: Health::Ok,
        connection_status: None,
        uptime_s: Some(3600),
        cpu_usage: None,
        memory_usage: None,
        version: None,
        components: Default::default(),
        attributes: Default::default(),
        interfaces: None,
        bridge_table: None,
        routing_table: None,
        dhcp_server: None,
    };
    device_mgr.update_state(router.clone(), &state).await.unwrap();
    let attr = types::wire::AttrMsg {
        schema: "attr/1.0".into(),
        ts: types::now_ms(),
        device_type: "router".into(),
        manufacturer: None,
        model: None,
        firmware_version: None,
        hardware_version: None,
        mac_address: "r1r1r1r1r1r1".into(),
        capabilities: vec!["routing".into()],
    };
    device_mgr.register(router.clone(), &attr).await.unwrap();

    let echo = EchoDevice::new();
    let publisher: Arc<dyn RequestPublisher> = echo.clone();
    let command_mgr = Arc::new(CommandManager::new(store.clone(), publisher));
    echo.manager.set(command_mgr.clone()).ok();

    let topo = Arc::new(TopologyManager::new(
        device_mgr.clone(),
        config::InferenceConfig::default(),
    ));
    let detector = Arc::new(RoamingDetector::new(store.clone(), 30_000));
    let history = Arc::new(RoamingHistoryEngine::new(
        detector,
        config::RoamingConfig::default(),
        &config::HistoryConfig::default(),
    ));
    let diag = Arc::new(DiagnosticsEngine::new(command_mgr.clone(), store.clone(), 3));
    let changesets = Arc::new(ChangesetManager::new(
        store.clone(),
        command_mgr.clone(),
        Arc::new(NoPriorValues),
    ));

    let ctx = Arc::new(ToolContext {
        devices: device_mgr,
        topology: topo,
        roaming: history,
        diagnostics: diag,
        commands: command_mgr,
        changesets,
        namespace: config::NamespaceConfig::default(),
    });

    let registry = Arc::new(ToolRegistry::new(ctx.clone()));
    register_builtin_tools(&registry).await;

    let engine = Arc::new(WorkflowEngine::new(registry.clone()));
    let workflows: config::WorkflowSet = serde_yaml::from_str(WORKFLOW_YAML).unwrap();
    let mut workflows = workflows;
    for (id, wf) in workflows.workflows.iter_mut() {
        if wf.id.is_empty() {
            wf.id = id.clone();
        }
    }
    let report = load_workflows(&engine, workflows).await;
    assert!(report.is_valid, "workflow config invalid: {:?}", report.errors);

    let sessions = Arc::new(SessionManager::new(store, registry));
    let resources = ResourceCatalog::new(ctx);
    (McpAdapter::new(sessions, engine, resources), echo)
}

const WORKFLOW_YAML: &str = r#"
workflows:
  weak_signal_coverage_diagnosis:
    name: Weak signal coverage diagnosis
    description: Diagnose weak WiFi coverage in a named location
    intent:
      primary: coverage
      secondary: [signal]
    steps:
      - id: gather
        name: Gather state
        type: parallel
        sub_steps:
          - id: topo
            name: Full topology
            type: tool
            tool_name: topology.get_full
            output_binding: topology
          - id: clients
            name: Client list
            type: tool
            tool_name: clients.list
            output_binding: clients
      - id: speed
        name: Speed test
        type: tool
        tool_name: network.speedtest_full
        output_binding: speed
      - id: merge
        name: Consolidate
        type: aggregate
        sources: [topology, clients, speed]
        output_binding: report
"#;

fn request(method: &str, params: Value) -> McpRequest {
    McpRequest {
        method: method.to_string(),
        params,
        id: Some(json!(1)),
    }
}

#[tokio::test]
async fn initialize_reports_capabilities() {
    let (adapter, _) = build_adapter().await;
    let response = adapter.handle(request("initialize", json!({}))).await;
    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "lattice-controller");
    assert!(result["capabilities"]["tools"].is_object());
    assert!(result["capabilities"]["resources"].is_object());
    assert!(result["capabilities"]["prompts"].is_object());
}

#[tokio::test]
async fn tools_list_includes_builtins_and_derived_workflow() {
    let (adapter, _) = build_adapter().await;
    let response = adapter.handle(request("tools.list", json!({}))).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"topology.get_full"));
    assert!(names.contains(&"devices.list"));
    assert!(names.contains(&"workflow.weak_signal_coverage_diagnosis"));

    let derived = tools
        .iter()
        .find(|t| t["name"] == "workflow.weak_signal_coverage_diagnosis")
        .unwrap();
    assert!(derived["inputSchema"]["properties"]["location1"].is_object());
}

#[tokio::test]
async fn coverage_workflow_runs_end_to_end() {
    let (adapter, echo) = build_adapter().await;
    let response = adapter
        .handle(request(
            "tools.call",
            json!({
                "name": "workflow.weak_signal_coverage_diagnosis",
                "arguments": {"location1": "living room"},
            }),
        ))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["is_error"], false);

    // The speed test ran exactly once.
    assert_eq!(echo.speed_tests.load(Ordering::SeqCst), 1);

    let content = result["content"].as_array().unwrap();
    // Summary block first.
    let summary = content[0]["text"].as_str().unwrap();
    assert!(summary.contains("completed"));

    // Execution details block reports three successful steps.
    let details = content
        .iter()
        .find_map(|b| b.get("json").and_then(|j| j.get("execution_details")))
        .expect("execution_details block");
    assert_eq!(details["successful_steps"], 3);
    assert_eq!(details["failed_steps"], 0);

    // All three bindings surfaced under their names.
    let results = content
        .iter()
        .find_map(|b| b.get("json").and_then(|j| j.get("results")))
        .expect("results block");
    for binding in ["topology", "clients", "speed", "report"] {
        assert!(results.get(binding).is_some(), "missing binding {binding}");
    }
}

#[tokio::test]
async fn direct_tool_call_round_trips() {
    let (adapter, _) = build_adapter().await;
    let response = adapter
        .handle(request(
            "tools.call",
            json!({"name": "devices.list", "arguments": {}}),
        ))
        .await;
    let result = response.result.unwrap();
    assert_eq!(result["is_error"], false);
    let devices = &result["content"][0]["json"];
    assert_eq!(devices.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failure_semantics() {
    let (adapter, _) = build_adapter().await;

    // Unknown tool -> not found.
    let response = adapter
        .handle(request("tools.call", json!({"name": "no.such.tool"})))
        .await;
    assert!(response.error.unwrap().message.contains("not found"));

    // Invalid params -> invalid params.
    let response = adapter
        .handle(request(
            "tools.call",
            json!({"name": "devices.get", "arguments": {}}),
        ))
        .await;
    assert!(response.error.unwrap().message.contains("invalid params"));

    // Downstream failure -> is_error=true result, not an envelope error.
    let response = adapter
        .handle(request(
            "tools.call",
            json!({"name": "devices.get", "arguments": {"device_id": "home:main:000000000000"}}),
        ))
        .await;
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["is_error"], true);

    // Unknown method -> method not found.
    let response = adapter.handle(request("bogus.method", json!({}))).await;
    assert!(response.error.unwrap().message.contains("method not found"));

    // Unknown resource and prompt -> not found.
    let response = adapter
        .handle(request("resources.read", json!({"uri": "nope://x"})))
        .await;
    assert!(response.error.is_some());
    let response = adapter
        .handle(request("prompts.get", json!({"name": "nope"})))
        .await;
    assert!(response.error.is_some());
}

#[tokio::test]
async fn resources_serve_and_cache() {
    let (adapter, _) = build_adapter().await;
    let response = adapter.handle(request("resources.list", json!({}))).await;
    let resources = response.result.unwrap()["resources"].as_array().unwrap().clone();
    assert_eq!(resources.len(), 5);

    let first = adapter
        .handle(request(
            "resources.read",
            json!({"uri": "topology://devices/list"}),
        ))
        .await
        .result
        .unwrap();
    assert_eq!(first["cached"], false);

    let second = adapter
        .handle(request(
            "resources.read",
            json!({"uri": "topology://devices/list"}),
        ))
        .await
        .result
        .unwrap();
    assert_eq!(second["cached"], true);
    assert_eq!(first["data"], second["data"]);
}

#[tokio::test]
async fn prompts_render() {
    let (adapter, _) = build_adapter().await;
    let response = adapter
        .handle(request(
            "prompts.get",
            json!({"name": "intent_classification",
                   "arguments": {"user_input": "wifi is slow in the kitchen"}}),
        ))
        .await;
    let text = response.result.unwrap()["text"].as_str().unwrap().to_string();
    assert!(text.contains("wifi is slow in the kitchen"));
}
