//! Natural-language entry: maps free text to the best-matching workflow
//! via a keyword/regex rule table, extracts parameters through named
//! capture groups, then executes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{WorkflowError, WorkflowResultT};
use crate::workflow::{WorkflowEngine, WorkflowRun};

/// Keyword rules: hitting a keyword scores the workflows whose intent
/// carries the rule's intent tag.
struct KeywordRule {
    intent: &'static str,
    keywords: &'static [&'static str],
    weight: u32,
}

const KEYWORD_RULES: &[KeywordRule] = &[
    KeywordRule {
        intent: "coverage",
        keywords: &["coverage", "weak signal", "dead zone", "bad wifi", "no signal"],
        weight: 3,
    },
    KeywordRule {
        intent: "speed",
        keywords: &["slow", "speed", "bandwidth", "throughput", "download", "upload"],
        weight: 3,
    },
    KeywordRule {
        intent: "roaming",
        keywords: &["roaming", "dropping", "switching", "handover", "disconnect"],
        weight: 3,
    },
    KeywordRule {
        intent: "wan",
        keywords: &["internet", "wan", "outage", "offline", "dns"],
        weight: 3,
    },
    KeywordRule {
        intent: "topology",
        keywords: &["topology", "map", "connected devices", "network layout"],
        weight: 2,
    },
];

/// Parameter extractors: named groups become workflow parameters.
static PARAM_EXTRACTORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // "... in the living room", "... in bedroom 2."
        Regex::new(r"(?i)\bin (?:the )?(?P<location1>[a-z][a-z0-9 ]{2,40}?)(?:\.|,|!|\?|$)")
            .expect("location regex is valid"),
        // MAC addresses in any common form.
        Regex::new(r"(?i)(?P<device_id>(?:[0-9a-f]{2}[:\-]){5}[0-9a-f]{2})")
            .expect("mac regex is valid"),
        // "last 24 hours", "past 2 days"
        Regex::new(r"(?i)(?:last|past) (?P<window_hours>\d{1,3}) ?h(?:ours?)?")
            .expect("window regex is valid"),
    ]
});

/// Score one workflow against the text: keyword rules matching its intent
/// tags plus direct mentions of its intent words.
fn score_workflow(def: &config::WorkflowDef, text: &str) -> u32 {
    let mut score = 0;
    let mut intents: Vec<&str> = vec![def.intent.primary.as_str()];
    intents.extend(def.intent.secondary.iter().map(String::as_str));

    for rule in KEYWORD_RULES {
        if !intents.contains(&rule.intent) {
            continue;
        }
        for keyword in rule.keywords {
            if text.contains(keyword) {
                score += rule.weight;
            }
        }
    }
    for intent in &intents {
        if !intent.is_empty() && text.contains(intent) {
            score += 2;
        }
    }
    for tag in &def.metadata.tags {
        if text.contains(tag.as_str()) {
            score += 1;
        }
    }
    score
}

/// Extract named-group parameters from the text.
pub fn extract_params(text: &str) -> Value {
    let mut params = Map::new();
    for regex in PARAM_EXTRACTORS.iter() {
        let Some(captures) = regex.captures(text) else {
            continue;
        };
        for name in regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                params.insert(
                    name.to_string(),
                    Value::String(value.as_str().trim().to_string()),
                );
            }
        }
    }
    Value::Object(params)
}

/// Pick the highest-scoring workflow for the text; `None` when nothing
/// scores above zero.
pub async fn match_workflow(engine: &WorkflowEngine, text: &str) -> Option<(String, u32)> {
    let lowered = text.to_lowercase();
    let mut best: Option<(String, u32)> = None;
    for def in engine.list().await {
        let score = score_workflow(&def, &lowered);
        if score == 0 {
            continue;
        }
        let better = match &best {
            Some((_, best_score)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((def.id.clone(), score));
        }
    }
    best
}

/// Map free text to a workflow and execute it with extracted parameters.
/// `context` entries are merged under the extracted parameters.
pub async fn process_user_input(
    engine: &WorkflowEngine,
    text: &str,
    context: Value,
) -> WorkflowResultT<WorkflowRun> {
    let (workflow_id, score) = match_workflow(engine, text)
        .await
        .ok_or(WorkflowError::NoMatch)?;
    tracing::info!("input matched workflow {workflow_id} (score {score})");

    let mut params = extract_params(text);
    if let (Value::Object(target), Value::Object(extra)) = (&mut params, context) {
        for (k, v) in extra {
            target.entry(k).or_insert(v);
        }
    }
    engine.execute(&workflow_id, params).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_location_and_mac() {
        let params = extract_params("WiFi is terrible in the living room.");
        assert_eq!(params["location1"], "living room");
        let params = extract_params("client aa:bb:cc:dd:ee:ff keeps dropping");
        assert_eq!(params["device_id"], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn extracts_time_window() {
        let params = extract_params("show roaming for the last 24 hours");
        assert_eq!(params["window_hours"], "24");
    }

    #[tokio::test]
    async fn scores_prefer_matching_intent() {
        let def = config::WorkflowDef {
            id: "coverage_wf".into(),
            name: "Coverage".into(),
            description: String::new(),
            intent: config::IntentDef {
                primary: "coverage".into(),
                secondary: vec!["signal".into()],
            },
            metadata: config::WorkflowMetadata {
                tags: vec!["wifi".into()],
                ..config::WorkflowMetadata::default()
            },
            steps: vec![],
        };
        let speed = config::WorkflowDef {
            id: "speed_wf".into(),
            intent: config::IntentDef {
                primary: "speed".into(),
                secondary: vec![],
            },
            ..def.clone()
        };

        let text = "the wifi coverage is weak signal in the bedroom";
        assert!(score_workflow(&def, text) > score_workflow(&speed, text));
    }
}
