use std::collections::HashSet;
use std::sync::Arc;

use commands::CommandManager;
use serde_json::Value;
use storage::{keys, Store};
use tokio::sync::{Mutex, Semaphore};
use tracing::info;
use types::{
    CommandStatus, DeviceId, DiagnosticRecord, Expectation, LatencyTestResult, ProbeKind,
    ProbeOutcome, SpeedTestResult, WanTestResult,
};

use crate::error::{DiagError, DiagResult};

/// Device-side probe commands take a while; give them a generous window.
const PROBE_TIMEOUT_MS: u64 = 120_000;

/// Runs active probes on devices through the command layer, with overlap
/// prevention per device/kind and a site-wide concurrency bound.
pub struct DiagnosticsEngine {
    commands: Arc<CommandManager>,
    store: Store,
    site_permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<(DeviceId, ProbeKind)>>,
}

impl DiagnosticsEngine {
    pub fn new(commands: Arc<CommandManager>, store: Store, max_concurrent_site: usize) -> Self {
        Self {
            commands,
            store,
            site_permits: Arc::new(Semaphore::new(max_concurrent_site.max(1))),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn speed_test(&self, device: DeviceId) -> DiagResult<DiagnosticRecord> {
        self.run_probe(device, ProbeKind::SpeedTest, Value::Null).await
    }

    pub async fn wan_test(&self, device: DeviceId) -> DiagResult<DiagnosticRecord> {
        self.run_probe(device, ProbeKind::WanTest, Value::Null).await
    }

    pub async fn latency_test(
        &self,
        device: DeviceId,
        targets: Vec<String>,
    ) -> DiagResult<DiagnosticRecord> {
        self.run_probe(
            device,
            ProbeKind::LatencyTest,
            serde_json::json!({ "targets": targets }),
        )
        .await
    }

    /// Last cached result for `(device, kind)`, if any.
    pub fn last_result(
        &self,
        device: &DeviceId,
        kind: ProbeKind,
    ) -> DiagResult<Option<DiagnosticRecord>> {
        Ok(self
            .store
            .get_json(&keys::diagnostic(&device.to_string(), &kind.to_string()))?)
    }

    /// Recent results across all devices, newest first.
    pub fn recent_results(&self, limit: usize) -> Vec<DiagnosticRecord> {
        let mut records: Vec<DiagnosticRecord> = self
            .store
            .iterate_prefix("diag:")
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.finished_at));
        records.truncate(limit);
        records
    }

    pub async fn run_probe(
        &self,
        device: DeviceId,
        kind: ProbeKind,
        args: Value,
    ) -> DiagResult<DiagnosticRecord> {
        // At most one probe of a kind per device at a time.
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert((device.clone(), kind)) {
                return Err(DiagError::ProbeInProgress { device, kind });
            }
        }
        let result = self.run_probe_inner(&device, kind, args).await;
        self.in_flight.lock().await.remove(&(device, kind));
        result
    }

    async fn run_probe_inner(
        &self,
        device: &DeviceId,
        kind: ProbeKind,
        args: Value,
    ) -> DiagResult<DiagnosticRecord> {
        let _permit = self
            .site_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DiagError::CommandFailed(e.to_string()))?;

        let started_at = types::now_ms();
        info!("running {kind} on {device}");
        let command = self
            .commands
            .send(
                device.clone(),
                &kind.to_string(),
                args,
                PROBE_TIMEOUT_MS,
                Expectation::Result,
            )
            .await
            .map_err(|e| DiagError::CommandFailed(e.to_string()))?;

        let (outcome, error) = if command.status == CommandStatus::Completed {
            let raw = command.result.unwrap_or(Value::Null);
            match parse_outcome(kind, raw) {
                Ok(outcome) => (Some(outcome), None),
                Err(e) => (None, Some(e.to_string())),
            }
        } else {
            let reason = command
                .error
                .unwrap_or_else(|| format!("probe ended in state {}", command.status));
            (None, Some(reason))
        };

        let record = DiagnosticRecord {
            device_id: device.clone(),
            kind,
            started_at,
            finished_at: types::now_ms(),
            outcome,
            error,
        };
        self.store.put_json(
            keys::diagnostic(&device.to_string(), &kind.to_string()),
            &record,
        )?;
        Ok(record)
    }
}

fn parse_outcome(kind: ProbeKind, raw: Value) -> DiagResult<ProbeOutcome> {
    let bad = |e: serde_json::Error| DiagError::BadResult(e.to_string());
    Ok(match kind {
        ProbeKind::SpeedTest => {
            ProbeOutcome::SpeedTest(serde_json::from_value::<SpeedTestResult>(raw).map_err(bad)?)
        }
        ProbeKind::WanTest => {
            ProbeOutcome::WanTest(serde_json::from_value::<WanTestResult>(raw).map_err(bad)?)
        }
        ProbeKind::LatencyTest => {
            ProbeOutcome::LatencyTest(serde_json::from_value::<LatencyTestResult>(raw).map_err(bad)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_speed_test_result() {
        let raw = serde_json::json!({
            "download_mbps": 85.2,
            "upload_mbps": 12.4,
            "jitter_ms": 3.5,
            "packet_loss": 0.1,
            "server_id": "fra-1"
        });
        let outcome = parse_outcome(ProbeKind::SpeedTest, raw).unwrap();
        match outcome {
            ProbeOutcome::SpeedTest(result) => {
                assert_eq!(result.download_mbps, 85.2);
                assert_eq!(result.server_id.as_deref(), Some("fra-1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_result() {
        let raw = serde_json::json!({"nope": true});
        assert!(parse_outcome(ProbeKind::SpeedTest, raw).is_err());
    }
}
