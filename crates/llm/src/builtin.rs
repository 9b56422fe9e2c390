//! The built-in Read/Test/Act tool set registered at startup.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use types::{DeviceId, Expectation, ProbeKind, ToolCategory, WifiMode};

use crate::context::ToolContext;
use crate::error::{ToolError, ToolResultT};
use crate::tools::{Tool, ToolRegistry};

/// Resolve a `device_id` param: either a full `tenant:site:mac` id or a
/// bare MAC scoped to the controller's namespace.
fn resolve_device_id(ctx: &ToolContext, raw: &str) -> DeviceId {
    DeviceId::from_str(raw).unwrap_or_else(|_| {
        DeviceId::new(ctx.namespace.tenant.clone(), ctx.namespace.site.clone(), raw)
    })
}

/// Pick the probe target: an explicit `device_id` param, else the first
/// online gateway-ish device, else any online device.
async fn resolve_probe_target(ctx: &ToolContext, params: &Value) -> ToolResultT<DeviceId> {
    if let Some(raw) = params.get("device_id").and_then(Value::as_str) {
        return Ok(resolve_device_id(ctx, raw));
    }
    let online = ctx
        .devices
        .list(&devices::DeviceFilter {
            online: Some(true),
            ..devices::DeviceFilter::default()
        })
        .await;
    let gateway = online
        .iter()
        .find(|d| matches!(d.device_type.as_str(), "router" | "gateway"))
        .or_else(|| online.first());
    gateway.map(|d| d.id.clone()).ok_or(ToolError::Execution {
        tool: "network".to_string(),
        details: "no online device to probe".to_string(),
    })
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": true,
    })
}

fn to_json<T: serde::Serialize>(value: &T, tool: &str) -> ToolResultT<Value> {
    serde_json::to_value(value).map_err(|e| ToolError::Execution {
        tool: tool.to_string(),
        details: e.to_string(),
    })
}

/// Register every built-in tool.
pub async fn register_builtin_tools(registry: &ToolRegistry) {
    registry
        .register(Tool::new(
            "topology.get_full",
            "Read the full topology snapshot: devices and inferred connections",
            ToolCategory::Read,
            object_schema(json!({}), &[]),
            |_params, ctx| async move {
                let snapshot = ctx.topology.get_current_topology().await;
                to_json(&snapshot, "topology.get_full")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "topology.get_connections",
            "Read the inferred connection graph only",
            ToolCategory::Read,
            object_schema(json!({}), &[]),
            |_params, ctx| async move {
                let connections = ctx.topology.connections().await;
                to_json(&connections, "topology.get_connections")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "devices.list",
            "List known devices, optionally filtered by online state or type",
            ToolCategory::Read,
            object_schema(
                json!({
                    "online": {"type": "boolean"},
                    "device_type": {"type": "string"},
                }),
                &[],
            ),
            |params, ctx| async move {
                let filter = devices::DeviceFilter {
                    online: params.get("online").and_then(Value::as_bool),
                    device_type: params
                        .get("device_type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ..devices::DeviceFilter::default()
                };
                let list = ctx.devices.list(&filter).await;
                to_json(&list, "devices.list")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "devices.get",
            "Read one device record by id or MAC",
            ToolCategory::Read,
            object_schema(json!({"device_id": {"type": "string"}}), &["device_id"]),
            |params, ctx| async move {
                let raw = params
                    .get("device_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let id = resolve_device_id(&ctx, raw);
                match ctx.devices.get(&id).await {
                    Some(device) => to_json(&device, "devices.get"),
                    None => Err(ToolError::Execution {
                        tool: "devices.get".to_string(),
                        details: format!("unknown device {id}"),
                    }),
                }
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "clients.list",
            "List WiFi client associations (STA interfaces) across the fleet",
            ToolCategory::Read,
            object_schema(json!({}), &[]),
            |_params, ctx| async move {
                let all = ctx.devices.all().await;
                let mut clients = Vec::new();
                for device in &all {
                    for iface in &device.interfaces {
                        let Some(wifi) = &iface.wifi else { continue };
                        if wifi.mode != WifiMode::Sta {
                            continue;
                        }
                        clients.push(json!({
                            "device_id": device.id.to_string(),
                            "client_mac": iface.mac,
                            "ssid": wifi.ssid,
                            "bssid": wifi.bssid,
                            "rssi": wifi.rssi,
                            "online": device.online,
                        }));
                    }
                }
                Ok(Value::Array(clients))
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "network.speedtest_full",
            "Run a full speed test on a device (defaults to the gateway)",
            ToolCategory::Test,
            object_schema(
                json!({
                    "device_id": {"type": "string"},
                    "location": {"type": "string"},
                }),
                &[],
            ),
            |params, ctx| async move {
                let target = resolve_probe_target(&ctx, &params).await?;
                let record = ctx.diagnostics.speed_test(target).await.map_err(|e| {
                    ToolError::Execution {
                        tool: "network.speedtest_full".to_string(),
                        details: e.to_string(),
                    }
                })?;
                to_json(&record, "network.speedtest_full")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "network.wan_test",
            "Check WAN reachability, DNS latency and public IP from a device",
            ToolCategory::Test,
            object_schema(json!({"device_id": {"type": "string"}}), &[]),
            |params, ctx| async move {
                let target = resolve_probe_target(&ctx, &params).await?;
                let record = ctx.diagnostics.wan_test(target).await.map_err(|e| {
                    ToolError::Execution {
                        tool: "network.wan_test".to_string(),
                        details: e.to_string(),
                    }
                })?;
                to_json(&record, "network.wan_test")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "network.latency_test",
            "Measure latency from a device to a set of targets",
            ToolCategory::Test,
            object_schema(
                json!({
                    "device_id": {"type": "string"},
                    "targets": {"type": "array", "items": {"type": "string"}},
                }),
                &[],
            ),
            |params, ctx| async move {
                let target = resolve_probe_target(&ctx, &params).await?;
                let targets: Vec<String> = params
                    .get("targets")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_else(|| vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]);
                let record = ctx
                    .diagnostics
                    .latency_test(target, targets)
                    .await
                    .map_err(|e| ToolError::Execution {
                        tool: "network.latency_test".to_string(),
                        details: e.to_string(),
                    })?;
                to_json(&record, "network.latency_test")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "diagnostics.last_result",
            "Read the cached last probe result for a device",
            ToolCategory::Read,
            object_schema(
                json!({
                    "device_id": {"type": "string"},
                    "kind": {"type": "string"},
                }),
                &["device_id", "kind"],
            ),
            |params, ctx| async move {
                let id = resolve_device_id(
                    &ctx,
                    params.get("device_id").and_then(Value::as_str).unwrap_or_default(),
                );
                let kind: ProbeKind = params
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| ToolError::Validation {
                        tool: "diagnostics.last_result".to_string(),
                        details: "kind must be speed_test, wan_test or latency_test".to_string(),
                    })?;
                let record = ctx.diagnostics.last_result(&id, kind).map_err(|e| {
                    ToolError::Execution {
                        tool: "diagnostics.last_result".to_string(),
                        details: e.to_string(),
                    }
                })?;
                to_json(&record, "diagnostics.last_result")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "roaming.query_history",
            "Query roaming events, sessions, patterns and anomalies",
            ToolCategory::Read,
            object_schema(
                json!({
                    "from_ms": {"type": "integer"},
                    "to_ms": {"type": "integer"},
                    "device_macs": {"type": "array", "items": {"type": "string"}},
                    "include_patterns": {"type": "boolean"},
                    "include_anomalies": {"type": "boolean"},
                    "include_visualization": {"type": "boolean"},
                }),
                &[],
            ),
            |params, ctx| async move {
                let query: roaming::HistoryQuery =
                    serde_json::from_value(params).map_err(|e| ToolError::Validation {
                        tool: "roaming.query_history".to_string(),
                        details: e.to_string(),
                    })?;
                let result = ctx.roaming.execute(&query);
                to_json(&result, "roaming.query_history")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "device.run_command",
            "Send a raw command to a device and wait for the outcome",
            ToolCategory::Act,
            object_schema(
                json!({
                    "device_id": {"type": "string"},
                    "operation": {"type": "string"},
                    "args": {"type": "object"},
                    "timeout_ms": {"type": "integer"},
                    "expect": {"type": "string", "enum": ["ack", "result", "none"]},
                }),
                &["device_id", "operation"],
            ),
            |params, ctx| async move {
                let id = resolve_device_id(
                    &ctx,
                    params.get("device_id").and_then(Value::as_str).unwrap_or_default(),
                );
                let operation = params
                    .get("operation")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let args = params.get("args").cloned().unwrap_or(Value::Null);
                let timeout_ms = params
                    .get("timeout_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(30_000);
                let expect = params
                    .get("expect")
                    .and_then(Value::as_str)
                    .and_then(|e| e.parse::<Expectation>().ok())
                    .unwrap_or(Expectation::Result);
                let command = ctx
                    .commands
                    .send(id, &operation, args, timeout_ms, expect)
                    .await
                    .map_err(|e| ToolError::Execution {
                        tool: "device.run_command".to_string(),
                        details: e.to_string(),
                    })?;
                to_json(&command, "device.run_command")
            },
        ))
        .await;

    registry
        .register(Tool::new(
            "changeset.apply",
            "Build and execute a changeset of device commands, optionally rolling back on failure",
            ToolCategory::Act,
            object_schema(
                json!({
                    "description": {"type": "string"},
                    "parallel": {"type": "boolean"},
                    "rollback_on_failure": {"type": "boolean"},
                    "commands": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "device_id": {"type": "string"},
                                "operation": {"type": "string"},
                                "args": {"type": "object"},
                                "timeout_ms": {"type": "integer"},
                            },
                            "required": ["device_id", "operation"],
                        },
                    },
                }),
                &["description", "commands"],
            ),
            |params, ctx| async move {
                let tool = "changeset.apply";
                let description = params
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let parallel = params
                    .get("parallel")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let rollback_on_failure = params
                    .get("rollback_on_failure")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                let map_err = |e: commands::CommandError| ToolError::Execution {
                    tool: tool.to_string(),
                    details: e.to_string(),
                };
                let changeset = ctx
                    .changesets
                    .create(description, parallel)
                    .map_err(map_err)?;

                for entry in params
                    .get("commands")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                {
                    let id = resolve_device_id(
                        &ctx,
                        entry.get("device_id").and_then(Value::as_str).unwrap_or_default(),
                    );
                    ctx.changesets
                        .add_command(
                            &changeset.id,
                            id,
                            entry.get("operation").and_then(Value::as_str).unwrap_or_default(),
                            entry.get("args").cloned().unwrap_or(Value::Null),
                            entry
                                .get("timeout_ms")
                                .and_then(Value::as_u64)
                                .unwrap_or(30_000),
                            Expectation::Result,
                        )
                        .map_err(map_err)?;
                }

                let mut executed = ctx.changesets.execute(&changeset.id).await.map_err(map_err)?;
                if executed.status == types::ChangesetStatus::Failed && rollback_on_failure {
                    executed = ctx.changesets.rollback(&changeset.id).await.map_err(map_err)?;
                }
                to_json(&executed, tool)
            },
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_schema_enforces_required_fields() {
        let schema = object_schema(json!({"x": {"type": "string"}}), &["x"]);
        assert!(jsonschema::is_valid(&schema, &json!({"x": "y"})));
        assert!(!jsonschema::is_valid(&schema, &json!({})));
    }
}
