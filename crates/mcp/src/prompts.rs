//! Parameterized prompt templates with `{{name}}` substitution.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::PromptDescriptor;

pub struct PromptTemplate {
    pub name: String,
    pub description: String,
    pub arguments: Vec<String>,
    pub template: String,
}

impl PromptTemplate {
    pub fn render(&self, args: &Value) -> String {
        let mut out = self.template.clone();
        for arg in &self.arguments {
            let value = args
                .get(arg)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            out = out.replace(&format!("{{{{{arg}}}}}"), &value);
        }
        out
    }
}

pub struct PromptCatalog {
    prompts: HashMap<String, PromptTemplate>,
}

impl PromptCatalog {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        for template in default_prompts() {
            prompts.insert(template.name.clone(), template);
        }
        Self { prompts }
    }

    pub fn list(&self) -> Vec<PromptDescriptor> {
        let mut out: Vec<PromptDescriptor> = self
            .prompts
            .values()
            .map(|p| PromptDescriptor {
                name: p.name.clone(),
                description: p.description.clone(),
                arguments: p.arguments.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str, args: &Value) -> Option<String> {
        self.prompts.get(name).map(|p| p.render(args))
    }
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn default_prompts() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            name: "intent_classification".into(),
            description: "Classify a user's network complaint into a diagnostic intent".into(),
            arguments: vec!["user_input".into()],
            template: "Classify the following user statement into one of the intents \
                       (coverage, speed, roaming, wan, topology) and name the affected \
                       location or device if present.\n\nUser: {{user_input}}"
                .into(),
        },
        PromptTemplate {
            name: "diagnostic_report".into(),
            description: "Render a structured diagnostic report from workflow output".into(),
            arguments: vec!["workflow_name".into(), "results".into()],
            template: "Write a concise diagnostic report for the run of {{workflow_name}}. \
                       Summarize findings, then list concrete next steps.\n\n\
                       Results:\n{{results}}"
                .into(),
        },
        PromptTemplate {
            name: "troubleshooting_guide".into(),
            description: "Step-by-step troubleshooting for a named problem".into(),
            arguments: vec!["problem".into(), "device".into()],
            template: "Produce a step-by-step troubleshooting guide for {{problem}} on \
                       device {{device}}. Prefer read-only checks before configuration \
                       changes."
                .into(),
        },
        PromptTemplate {
            name: "wifi_optimization".into(),
            description: "Suggest WiFi optimization based on roaming and quality data".into(),
            arguments: vec!["roaming_summary".into()],
            template: "Given this roaming and quality summary, suggest channel, power and \
                       placement changes:\n\n{{roaming_summary}}"
                .into(),
        },
        PromptTemplate {
            name: "network_summary".into(),
            description: "Plain-language summary of the current network state".into(),
            arguments: vec!["topology".into(), "anomalies".into()],
            template: "Summarize the network for a non-technical user.\n\nTopology:\n\
                       {{topology}}\n\nActive anomalies:\n{{anomalies}}"
                .into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_with_substitution() {
        let catalog = PromptCatalog::new();
        let text = catalog
            .get(
                "troubleshooting_guide",
                &json!({"problem": "packet loss", "device": "home:main:r1"}),
            )
            .unwrap();
        assert!(text.contains("packet loss"));
        assert!(text.contains("home:main:r1"));
        assert!(!text.contains("{{"));
    }

    #[test]
    fn missing_args_render_empty() {
        let catalog = PromptCatalog::new();
        let text = catalog
            .get("intent_classification", &json!({}))
            .unwrap();
        assert!(text.ends_with("User: "));
    }

    #[test]
    fn unknown_prompt_is_none() {
        let catalog = PromptCatalog::new();
        assert!(catalog.get("nope", &json!({})).is_none());
    }

    #[test]
    fn all_five_prompts_exist() {
        let names: Vec<String> = PromptCatalog::new()
            .list()
            .into_iter()
            .map(|p| p.name)
            .collect();
        for expected in [
            "diagnostic_report",
            "intent_classification",
            "network_summary",
            "troubleshooting_guide",
            "wifi_optimization",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }
}
