//! Declarative workflow definitions, authored as YAML and loaded into the
//! workflow registry at startup (and on reload).

use std::collections::HashMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Tool,
    Condition,
    Parallel,
    Sequential,
    Aggregate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConditionDef {
    /// Path into the workflow context, e.g. `steps.speed.download_mbps`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Per-step timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Literal values, `$steps.<id>.<path>` references to prior outputs,
    /// or `$params.<name>` query parameters.
    #[serde(default)]
    pub input_mapping: HashMap<String, Value>,
    #[serde(default)]
    pub output_binding: Option<String>,
    #[serde(default)]
    pub condition: Option<ConditionDef>,
    #[serde(default)]
    pub sub_steps: Vec<StepDef>,
    /// For `aggregate`: names of prior outputs to merge.
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IntentDef {
    pub primary: String,
    #[serde(default)]
    pub secondary: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDef {
    /// Filled from the map key when omitted in the body.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub intent: IntentDef,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    pub steps: Vec<StepDef>,
}

/// Top-level shape of one workflow YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSet {
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowDef>,
}

impl WorkflowSet {
    /// Load every `*.yaml`/`*.yml` file in a directory and merge their
    /// workflow maps. Later files override earlier ids with a warning.
    pub async fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut merged = WorkflowSet::default();

        let mut entries =
            tokio::fs::read_dir(dir)
                .await
                .map_err(|e| ConfigError::LoadFailed {
                    path: dir.to_path_buf(),
                    source: std::sync::Arc::new(e),
                })?;

        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let contents =
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ConfigError::LoadFailed {
                        path: path.clone(),
                        source: std::sync::Arc::new(e),
                    })?;
            let set: WorkflowSet =
                serde_yaml::from_str(&contents).map_err(|e| ConfigError::InvalidFormat {
                    path: path.clone(),
                    details: e.to_string(),
                    content: contents.clone(),
                    span: (e.location().map(|l| l.index()).unwrap_or(0)
                        ..e.location().map(|l| l.index() + 1).unwrap_or(1))
                        .into(),
                })?;
            for (id, mut wf) in set.workflows {
                if wf.id.is_empty() {
                    wf.id = id.clone();
                }
                if merged.workflows.insert(id.clone(), wf).is_some() {
                    warn!("workflow {id:?} redefined by {}", path.display());
                }
            }
        }

        info!("loaded {} workflow definitions", merged.workflows.len());
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workflows:
  weak_signal_coverage_diagnosis:
    name: Weak signal coverage diagnosis
    description: Diagnose weak WiFi coverage in a named location
    intent:
      primary: coverage
      secondary: [signal, wifi]
    metadata:
      version: "1.0"
      tags: [wifi, coverage]
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
        input_mapping:
          location: "$params.location1"
        output_binding: speed
      - id: merge
        name: Consolidate
        type: aggregate
        sources: [topology, clients, speed]
        output_binding: report
"#;

    #[test]
    fn parses_sample_workflow() {
        let set: WorkflowSet = serde_yaml::from_str(SAMPLE).unwrap();
        let wf = &set.workflows["weak_signal_coverage_diagnosis"];
        assert_eq!(wf.steps.len(), 3);
        assert_eq!(wf.steps[0].step_type, StepType::Parallel);
        assert_eq!(wf.steps[0].sub_steps.len(), 2);
        assert_eq!(wf.steps[2].sources, vec!["topology", "clients", "speed"]);
        assert_eq!(wf.intent.primary, "coverage");
    }
}
