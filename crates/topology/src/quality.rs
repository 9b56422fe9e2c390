//! Per-connection quality monitors and anomaly classification.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use types::{AnomalyKind, Connection, Device, QualityAnomaly};

/// Rolling-window depth per edge.
const WINDOW: usize = 100;

const POOR_QUALITY_CONFIDENCE: f64 = 0.3;
const HIGH_LATENCY_P95_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    pub ts_ms: i64,
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EdgeQuality {
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub packet_loss_rate: Option<f64>,
    pub rssi_mean: Option<f64>,
    pub rssi_variance: Option<f64>,
}

/// Maintains rolling windows keyed by edge id and classifies anomalies
/// over the current topology.
pub struct QualityMonitor {
    windows: Mutex<HashMap<String, VecDeque<QualitySample>>>,
    /// Twice the inference interval: a device online longer than this with
    /// zero edges is isolated.
    isolation_threshold_ms: i64,
}

impl QualityMonitor {
    pub fn new(inference_interval_ms: i64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            isolation_threshold_ms: 2 * inference_interval_ms,
        }
    }

    pub async fn record(&self, edge_id: &str, sample: QualitySample) {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(edge_id.to_string()).or_default();
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    pub async fn edge_quality(&self, edge_id: &str) -> EdgeQuality {
        let windows = self.windows.lock().await;
        let Some(window) = windows.get(edge_id) else {
            return EdgeQuality::default();
        };
        Self::summarize(window)
    }

    fn summarize(window: &VecDeque<QualitySample>) -> EdgeQuality {
        let mut latencies: Vec<f64> = window.iter().filter_map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let losses: Vec<f64> = window.iter().filter_map(|s| s.packet_loss).collect();
        let rssis: Vec<f64> = window.iter().filter_map(|s| s.rssi.map(f64::from)).collect();

        let percentile = |sorted: &[f64], p: f64| -> Option<f64> {
            if sorted.is_empty() {
                return None;
            }
            let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted.get(rank).copied()
        };

        let rssi_mean = (!rssis.is_empty()).then(|| rssis.iter().sum::<f64>() / rssis.len() as f64);
        let rssi_variance = rssi_mean.map(|mean| {
            rssis.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rssis.len() as f64
        });

        EdgeQuality {
            latency_p50_ms: percentile(&latencies, 0.50),
            latency_p95_ms: percentile(&latencies, 0.95),
            packet_loss_rate: (!losses.is_empty())
                .then(|| losses.iter().sum::<f64>() / losses.len() as f64),
            rssi_mean,
            rssi_variance,
        }
    }

    /// Classify anomalies over the current device and edge sets.
    pub async fn evaluate(
        &self,
        devices: &[Device],
        connections: &[Connection],
        now_ms: i64,
    ) -> Vec<QualityAnomaly> {
        let mut anomalies = Vec::new();
        let windows = self.windows.lock().await;

        for edge in connections {
            let active = edge.last_seen >= now_ms - self.isolation_threshold_ms;
            if active && edge.metrics.confidence < POOR_QUALITY_CONFIDENCE {
                anomalies.push(QualityAnomaly {
                    kind: AnomalyKind::PoorQuality,
                    device_id: edge.from_device.clone(),
                    connection_id: Some(edge.id.clone()),
                    ts_ms: now_ms,
                    detail: format!(
                        "confidence {:.2} on active link {}",
                        edge.metrics.confidence, edge.id
                    ),
                });
            }
            if let Some(window) = windows.get(&edge.id) {
                let quality = Self::summarize(window);
                if quality.latency_p95_ms.is_some_and(|p95| p95 > HIGH_LATENCY_P95_MS) {
                    anomalies.push(QualityAnomaly {
                        kind: AnomalyKind::HighLatency,
                        device_id: edge.from_device.clone(),
                        connection_id: Some(edge.id.clone()),
                        ts_ms: now_ms,
                        detail: format!(
                            "p95 latency {:.1} ms on {}",
                            quality.latency_p95_ms.unwrap_or_default(),
                            edge.id
                        ),
                    });
                }
            }
        }

        for device in devices {
            if !device.online {
                continue;
            }
            let has_edge = connections
                .iter()
                .any(|e| e.from_device == device.id || e.to_device == device.id);
            // Earliest evidence of the device, whichever clock is sane.
            let first_seen = device.created.timestamp_millis().min(device.last_seen);
            let online_long_enough = now_ms - first_seen > self.isolation_threshold_ms;
            if !has_edge && online_long_enough {
                anomalies.push(QualityAnomaly {
                    kind: AnomalyKind::IsolatedNode,
                    device_id: device.id.clone(),
                    connection_id: None,
                    ts_ms: now_ms,
                    detail: "online device with no inferred connections".to_string(),
                });
            }
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ConnectionMetrics, ConnectionType, DeviceId};

    fn edge(id: &str, confidence: f64, last_seen: i64) -> Connection {
        Connection {
            id: id.into(),
            from_device: DeviceId::new("home", "main", "aabbccddee01"),
            to_device: DeviceId::new("home", "main", "aabbccddee02"),
            from_interface: None,
            to_interface: None,
            connection_type: ConnectionType::Wifi,
            is_direct_link: true,
            discovered_at: 0,
            last_seen,
            metrics: ConnectionMetrics {
                confidence,
                ..ConnectionMetrics::default()
            },
        }
    }

    #[tokio::test]
    async fn percentiles_over_window() {
        let monitor = QualityMonitor::new(60_000);
        for i in 1..=100 {
            monitor
                .record(
                    "e1",
                    QualitySample {
                        ts_ms: i,
                        latency_ms: Some(i as f64),
                        packet_loss: Some(0.0),
                        rssi: Some(-50),
                    },
                )
                .await;
        }
        let q = monitor.edge_quality("e1").await;
        assert_eq!(q.latency_p50_ms, Some(50.0));
        assert_eq!(q.latency_p95_ms, Some(95.0));
        assert_eq!(q.rssi_mean, Some(-50.0));
        assert_eq!(q.rssi_variance, Some(0.0));
    }

    #[tokio::test]
    async fn flags_poor_quality_and_high_latency() {
        let now = 1_700_000_000_000;
        let monitor = QualityMonitor::new(60_000);
        let edges = vec![edge("weak", 0.2, now), edge("slow", 0.9, now)];
        for _ in 0..10 {
            monitor
                .record(
                    "slow",
                    QualitySample {
                        ts_ms: now,
                        latency_ms: Some(150.0),
                        packet_loss: None,
                        rssi: None,
                    },
                )
                .await;
        }

        let anomalies = monitor.evaluate(&[], &edges, now).await;
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::PoorQuality && a.connection_id.as_deref() == Some("weak")));
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::HighLatency && a.connection_id.as_deref() == Some("slow")));
    }

    #[tokio::test]
    async fn flags_isolated_node() {
        let now = 1_700_000_000_000;
        let monitor = QualityMonitor::new(60_000);
        let mut device = types::Device::new(DeviceId::new("home", "main", "aabbccddee03"), "sensor");
        device.online = true;
        device.last_seen = now - 500_000;

        let anomalies = monitor.evaluate(&[device], &[], now).await;
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::IsolatedNode));
    }
}
