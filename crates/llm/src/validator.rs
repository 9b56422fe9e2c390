//! Workflow configuration validator: structural checks run before a
//! definition set is accepted into the engine.

use std::collections::HashSet;

use config::{StepDef, StepType, WorkflowDef};
use serde_json::Value;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validate one workflow definition against the set of registered tool
/// names.
pub fn validate_workflow(def: &WorkflowDef, tool_names: &HashSet<String>) -> ValidationReport {
    let mut report = ValidationReport {
        is_valid: true,
        ..ValidationReport::default()
    };

    if def.intent.primary.trim().is_empty() {
        report
            .errors
            .push(format!("workflow {}: intent.primary is empty", def.id));
    }
    if def.steps.is_empty() {
        report
            .errors
            .push(format!("workflow {}: no steps", def.id));
    }

    let mut seen_ids = HashSet::new();
    let mut defined_so_far = HashSet::new();
    for step in &def.steps {
        check_step(
            &def.id,
            step,
            tool_names,
            &mut seen_ids,
            &mut defined_so_far,
            &mut report,
        );
    }

    report.is_valid = report.errors.is_empty();
    report
}

fn check_step(
    workflow: &str,
    step: &StepDef,
    tool_names: &HashSet<String>,
    seen_ids: &mut HashSet<String>,
    defined_so_far: &mut HashSet<String>,
    report: &mut ValidationReport,
) {
    if !seen_ids.insert(step.id.clone()) {
        report
            .errors
            .push(format!("{workflow}: duplicate step id {:?}", step.id));
    }

    match step.step_type {
        StepType::Tool => {
            match &step.tool_name {
                None => report
                    .errors
                    .push(format!("{workflow}/{}: tool step without tool_name", step.id)),
                Some(name) if !tool_names.contains(name) => report
                    .errors
                    .push(format!("{workflow}/{}: unknown tool {name:?}", step.id)),
                Some(_) => {}
            }
            if !step.sub_steps.is_empty() {
                report
                    .warnings
                    .push(format!("{workflow}/{}: tool step ignores sub_steps", step.id));
            }
        }
        StepType::Condition => {
            if step.condition.is_none() {
                report.errors.push(format!(
                    "{workflow}/{}: condition step without condition",
                    step.id
                ));
            }
            if step.sub_steps.is_empty() {
                report.warnings.push(format!(
                    "{workflow}/{}: condition step with no sub_steps",
                    step.id
                ));
            }
        }
        StepType::Parallel | StepType::Sequential => {
            if step.sub_steps.is_empty() {
                report
                    .errors
                    .push(format!("{workflow}/{}: group step with no sub_steps", step.id));
            }
        }
        StepType::Aggregate => {
            if step.sources.is_empty() {
                report.errors.push(format!(
                    "{workflow}/{}: aggregate step with no sources",
                    step.id
                ));
            }
        }
    }

    // References in input_mapping must point at steps defined earlier.
    for raw in step.input_mapping.values() {
        if let Some(reference) = raw.as_str().and_then(|s| s.strip_prefix("$steps.")) {
            let target = reference.split('.').next().unwrap_or_default();
            if !defined_so_far.contains(target) {
                report.errors.push(format!(
                    "{workflow}/{}: reference to {target:?} which is not defined earlier",
                    step.id
                ));
            }
        }
    }

    // Aggregate sources must name earlier outputs.
    if step.step_type == StepType::Aggregate {
        for source in &step.sources {
            if !defined_so_far.contains(source) {
                report.errors.push(format!(
                    "{workflow}/{}: aggregate source {source:?} not produced earlier",
                    step.id
                ));
            }
        }
    }

    for sub in &step.sub_steps {
        check_step(workflow, sub, tool_names, seen_ids, defined_so_far, report);
    }

    // The step's own id and binding become referenceable afterwards.
    defined_so_far.insert(step.id.clone());
    if let Some(binding) = &step.output_binding {
        defined_so_far.insert(binding.clone());
    }
}

/// Validate a whole set; one report with everything aggregated.
pub fn validate_set(
    workflows: &std::collections::HashMap<String, WorkflowDef>,
    tool_names: &HashSet<String>,
) -> ValidationReport {
    let mut merged = ValidationReport {
        is_valid: true,
        ..ValidationReport::default()
    };
    let mut ids: Vec<&String> = workflows.keys().collect();
    ids.sort();
    for id in ids {
        let report = validate_workflow(&workflows[id], tool_names);
        merged.errors.extend(report.errors);
        merged.warnings.extend(report.warnings);
    }
    merged.is_valid = merged.errors.is_empty();
    merged
}

/// True when the value looks like a `$steps` or `$params` reference.
pub fn is_reference(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with("$steps.") || s.starts_with("$params."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{ConditionDef, ConditionOperator, IntentDef, WorkflowMetadata};
    use std::collections::HashMap;

    fn tools() -> HashSet<String> {
        ["devices.list", "topology.get_full"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn step(id: &str, step_type: StepType) -> StepDef {
        StepDef {
            id: id.into(),
            name: id.into(),
            step_type,
            timeout: None,
            optional: false,
            tool_name: None,
            input_mapping: HashMap::new(),
            output_binding: None,
            condition: None,
            sub_steps: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn wf(steps: Vec<StepDef>) -> WorkflowDef {
        WorkflowDef {
            id: "w".into(),
            name: "w".into(),
            description: String::new(),
            intent: IntentDef {
                primary: "diagnose".into(),
                secondary: vec![],
            },
            metadata: WorkflowMetadata::default(),
            steps,
        }
    }

    #[test]
    fn valid_workflow_passes() {
        let mut s1 = step("list", StepType::Tool);
        s1.tool_name = Some("devices.list".into());
        s1.output_binding = Some("devices".into());
        let mut s2 = step("merge", StepType::Aggregate);
        s2.sources = vec!["devices".into()];

        let report = validate_workflow(&wf(vec![s1, s2]), &tools());
        assert!(report.is_valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn duplicate_ids_and_unknown_tools_fail() {
        let mut s1 = step("x", StepType::Tool);
        s1.tool_name = Some("devices.list".into());
        let mut s2 = step("x", StepType::Tool);
        s2.tool_name = Some("nope".into());

        let report = validate_workflow(&wf(vec![s1, s2]), &tools());
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
        assert!(report.errors.iter().any(|e| e.contains("unknown tool")));
    }

    #[test]
    fn forward_references_fail() {
        let mut s1 = step("first", StepType::Tool);
        s1.tool_name = Some("devices.list".into());
        s1.input_mapping
            .insert("x".into(), serde_json::json!("$steps.later.field"));
        let mut s2 = step("later", StepType::Tool);
        s2.tool_name = Some("topology.get_full".into());

        let report = validate_workflow(&wf(vec![s1, s2]), &tools());
        assert!(!report.is_valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("not defined earlier")));
    }

    #[test]
    fn condition_without_condition_fails() {
        let report = validate_workflow(&wf(vec![step("c", StepType::Condition)]), &tools());
        assert!(!report.is_valid);

        let mut ok = step("c", StepType::Condition);
        ok.condition = Some(ConditionDef {
            field: "params.x".into(),
            operator: ConditionOperator::Exists,
            value: serde_json::Value::Null,
        });
        let mut sub = step("s", StepType::Tool);
        sub.tool_name = Some("devices.list".into());
        ok.sub_steps = vec![sub];
        let report = validate_workflow(&wf(vec![ok]), &tools());
        assert!(report.is_valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn empty_intent_fails() {
        let mut s = step("t", StepType::Tool);
        s.tool_name = Some("devices.list".into());
        let mut workflow = wf(vec![s]);
        workflow.intent.primary = "  ".into();
        let report = validate_workflow(&workflow, &tools());
        assert!(!report.is_valid);
    }
}
