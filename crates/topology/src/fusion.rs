//! Fusion of per-algorithm candidates into emitted edges. The fusion
//! stage knows nothing about the algorithms except the weight attached to
//! each candidate type.

use std::collections::HashMap;

use config::{InferenceConfig, InferenceWeights};
use types::{Connection, ConnectionMetrics, ConnectionType, DeviceId};

use crate::algorithms::Candidate;

const RECENT_BONUS_WINDOW_MS: i64 = 60 * 1000;
const STALE_PENALTY_WINDOW_MS: i64 = 10 * 60 * 1000;

fn weight_for(weights: &InferenceWeights, kind: ConnectionType) -> f64 {
    match kind {
        ConnectionType::Bridge => weights.bridge,
        ConnectionType::Wifi => weights.wifi,
        ConnectionType::Route => weights.route,
        ConnectionType::Dhcp => weights.dhcp,
        ConnectionType::Scan => weights.scan,
        // Ethernet is only ever a primary type chosen downstream; treat
        // any candidate carrying it like a bridge observation.
        ConnectionType::Ethernet => weights.bridge,
    }
}

/// Per-candidate confidence adjustment: recency and metric strength,
/// clamped to [0, 1].
fn adjusted_confidence(candidate: &Candidate, now_ms: i64) -> f64 {
    let mut c = candidate.base_confidence;
    let age = now_ms - candidate.observed_at;
    if age <= RECENT_BONUS_WINDOW_MS {
        c += 0.1;
    } else if age > STALE_PENALTY_WINDOW_MS {
        c -= 0.2;
    }
    if candidate.rssi.is_some_and(|rssi| rssi > -50) {
        c += 0.1;
    }
    if candidate.link_speed.is_some_and(|speed| speed > 100) {
        c += 0.05;
    }
    c.clamp(0.0, 1.0)
}

/// Fuse candidates into edges. `previous` maps canonical pair to the
/// previously emitted edge so ids and `discovered_at` stay stable.
pub fn fuse(
    candidates: Vec<Candidate>,
    previous: &HashMap<(DeviceId, DeviceId), Connection>,
    cfg: &InferenceConfig,
    now_ms: i64,
) -> Vec<Connection> {
    let mut groups: HashMap<(DeviceId, DeviceId), Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        let (lo, hi, _) = Connection::canonical_pair(&candidate.from, &candidate.to);
        groups.entry((lo, hi)).or_default().push(candidate);
    }

    let mut edges = Vec::new();
    for ((lo, hi), group) in groups {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for candidate in &group {
            let w = weight_for(&cfg.weights, candidate.kind);
            weighted_sum += w * adjusted_confidence(candidate, now_ms);
            weight_total += w;
        }
        if weight_total <= 0.0 {
            continue;
        }
        let confidence = (weighted_sum / weight_total).clamp(0.0, 1.0);
        if confidence < cfg.min_confidence {
            continue;
        }

        // Primary type by fixed priority.
        let primary = group
            .iter()
            .min_by_key(|c| c.kind.priority())
            .map(|c| c.kind)
            .unwrap_or(ConnectionType::Scan);

        // Interfaces and metrics come from the highest-priority candidate
        // observed for the pair, oriented to the canonical order.
        let best = group
            .iter()
            .min_by_key(|c| c.kind.priority())
            .cloned()
            .expect("group is non-empty");
        let oriented_forward = best.from == lo;
        let (from_interface, to_interface) = if oriented_forward {
            (best.from_interface.clone(), best.to_interface.clone())
        } else {
            (best.to_interface.clone(), best.from_interface.clone())
        };

        let rssi = group.iter().find_map(|c| c.rssi);
        let link_speed = group.iter().find_map(|c| c.link_speed);
        let last_seen = group.iter().map(|c| c.observed_at).max().unwrap_or(now_ms);

        // Stable identity: an existing edge for this pair keeps its id and
        // discovery time, which also settles equal-confidence ties in
        // favor of the earlier-discovered edge.
        let prior = previous.get(&(lo.clone(), hi.clone()));
        let (id, discovered_at) = match prior {
            Some(edge) => (edge.id.clone(), edge.discovered_at),
            None => (Connection::edge_id(&lo, &hi, primary), now_ms),
        };

        edges.push(Connection {
            id,
            from_device: lo,
            to_device: hi,
            from_interface,
            to_interface,
            connection_type: primary,
            is_direct_link: confidence >= cfg.direct_link_threshold,
            discovered_at,
            last_seen,
            metrics: ConnectionMetrics {
                rssi,
                link_speed,
                latency_ms: None,
                packet_loss: None,
                bandwidth_mbps: None,
                confidence,
            },
        });
    }

    edges.sort_by(|a, b| a.id.cmp(&b.id));
    edges
}
