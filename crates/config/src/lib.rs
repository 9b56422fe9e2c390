pub mod error;
pub mod utils;
pub mod workflow;

pub use error::ConfigError;
pub use utils::ConfigFile;
pub use workflow::{
    ConditionDef, ConditionOperator, IntentDef, StepDef, StepType, WorkflowDef, WorkflowMetadata,
    WorkflowSet,
};

use std::collections::HashMap;
use std::path::Path;

use miette::Report;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_keepalive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            keepalive_s: default_keepalive(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamespaceConfig {
    pub tenant: String,
    pub site: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            tenant: "home".to_string(),
            site: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DevicesConfig {
    /// A device is flipped offline when `now - last_seen` exceeds this.
    /// Default is twice the MQTT keepalive.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_s: u64,
}

fn default_offline_threshold() -> u64 {
    60
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            offline_threshold_s: default_offline_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventsConfig {
    #[serde(default = "default_event_queue")]
    pub queue_capacity: usize,
}

fn default_event_queue() -> usize {
    1000
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_event_queue(),
        }
    }
}

/// Connection-inference tuning. The thresholds are deliberately explicit
/// configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_interval")]
    pub interval_s: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_direct_link_threshold")]
    pub direct_link_threshold: f64,
    #[serde(default = "InferenceWeights::default")]
    pub weights: InferenceWeights,
}

fn default_inference_interval() -> u64 {
    60
}
fn default_min_confidence() -> f64 {
    0.4
}
fn default_direct_link_threshold() -> f64 {
    0.75
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            interval_s: default_inference_interval(),
            min_confidence: default_min_confidence(),
            direct_link_threshold: default_direct_link_threshold(),
            weights: InferenceWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InferenceWeights {
    pub bridge: f64,
    pub wifi: f64,
    pub route: f64,
    pub dhcp: f64,
    pub scan: f64,
}

impl Default for InferenceWeights {
    fn default() -> Self {
        Self {
            bridge: 1.0,
            wifi: 0.9,
            route: 0.8,
            dhcp: 0.6,
            scan: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RoamingConfig {
    #[serde(default = "default_roaming_window")]
    pub roaming_window_s: u64,
    #[serde(default = "default_max_gap")]
    pub max_gap_between_events_s: u64,
    #[serde(default = "default_ping_pong_window")]
    pub ping_pong_window_s: u64,
}

fn default_roaming_window() -> u64 {
    30
}
fn default_max_gap() -> u64 {
    1800
}
fn default_ping_pong_window() -> u64 {
    120
}

impl Default for RoamingConfig {
    fn default() -> Self {
        Self {
            roaming_window_s: default_roaming_window(),
            max_gap_between_events_s: default_max_gap(),
            ping_pong_window_s: default_ping_pong_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoryConfig {
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default = "default_cache_retention")]
    pub cache_retention_s: u64,
}

fn default_max_cache_size() -> usize {
    128
}
fn default_cache_retention() -> u64 {
    300
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_cache_size: default_max_cache_size(),
            cache_retention_s: default_cache_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleConfig {
    pub name: String,
    pub interval_s: u64,
    /// Probe kind: `speed_test`, `wan_test` or `latency_test`.
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_site: usize,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_site: default_max_concurrent(),
            schedules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub roaming: RoamingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Directory of workflow YAML files; each file may define several
    /// workflows under a top-level `workflows` map.
    #[serde(default)]
    pub workflows_dir: Option<String>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_s: u64,
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            namespace: NamespaceConfig::default(),
            devices: DevicesConfig::default(),
            events: EventsConfig::default(),
            inference: InferenceConfig::default(),
            roaming: RoamingConfig::default(),
            history: HistoryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            workflows_dir: None,
            shutdown_grace_s: default_shutdown_grace(),
        }
    }
}

impl ConfigFile for Config {}

impl Config {
    /// Load configuration from a YAML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Config = <Self as ConfigFile>::load(path).await.map_err(|e| {
            error!("{}", Report::new(e.clone()));
            e
        })?;
        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Sanity checks that the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inf = &self.inference;
        for (field, value) in [
            ("inference.min_confidence", inf.min_confidence),
            ("inference.direct_link_threshold", inf.direct_link_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    details: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if inf.min_confidence > inf.direct_link_threshold {
            return Err(ConfigError::InvalidValue {
                field: "inference.direct_link_threshold".to_string(),
                details: "must be >= min_confidence".to_string(),
            });
        }
        let weights: HashMap<&str, f64> = HashMap::from([
            ("bridge", inf.weights.bridge),
            ("wifi", inf.weights.wifi),
            ("route", inf.weights.route),
            ("dhcp", inf.weights.dhcp),
            ("scan", inf.weights.scan),
        ]);
        for (name, w) in weights {
            if w < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("inference.weights.{name}"),
                    details: "weights must be non-negative".to_string(),
                });
            }
        }
        for sched in &self.diagnostics.schedules {
            if sched.interval_s == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("diagnostics.schedules.{}", sched.name),
                    details: "interval_s must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut cfg = Config::default();
        cfg.inference.min_confidence = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut cfg = Config::default();
        cfg.inference.min_confidence = 0.9;
        cfg.inference.direct_link_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = "mqtt:\n  host: broker.local\n  port: 1883\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.inference.min_confidence, 0.4);
        assert_eq!(cfg.inference.direct_link_threshold, 0.75);
    }
}
