use std::collections::{HashMap, HashSet};

use types::{
    RoamingAnomaly, RoamingAnomalyKind, RoamingEvent, RoamingPattern, RoamingPatternKind,
    RoamingSession,
};

/// Quality below which a handover counts as a failure.
const FAILURE_QUALITY: f64 = 0.3;
/// Consecutive failures that constitute a repeated-failure anomaly.
const FAILURE_STREAK: usize = 3;
/// Dwell between consecutive roamings that reads as an isolated client.
const LONG_DWELL_MS: i64 = 6 * 60 * 60 * 1000;

/// Mine movement patterns per device from its event stream.
pub fn mine_patterns(events: &[RoamingEvent], ping_pong_window_ms: i64) -> Vec<RoamingPattern> {
    let mut by_device: HashMap<&str, Vec<&RoamingEvent>> = HashMap::new();
    for event in events {
        by_device.entry(&event.device_mac).or_default().push(event);
    }

    let mut patterns = Vec::new();
    for (mac, mut device_events) in by_device {
        device_events.sort_by_key(|e| e.ts_ms);
        if device_events.len() < 2 {
            continue;
        }

        let aps: Vec<&str> = {
            let mut seen = HashSet::new();
            let mut out = vec![device_events[0].from_ap.as_str()];
            seen.insert(device_events[0].from_ap.as_str());
            for e in &device_events {
                if seen.insert(e.to_ap.as_str()) {
                    out.push(e.to_ap.as_str());
                }
            }
            out
        };

        // Ping-pong: A -> B -> A within the window.
        let mut ping_pongs = 0u32;
        for pair in device_events.windows(2) {
            if pair[1].to_ap == pair[0].from_ap
                && pair[1].ts_ms - pair[0].ts_ms <= ping_pong_window_ms
            {
                ping_pongs += 1;
            }
        }
        if ping_pongs > 0 {
            patterns.push(RoamingPattern {
                kind: RoamingPatternKind::PingPong,
                device_mac: mac.to_string(),
                aps: aps.iter().map(|s| s.to_string()).collect(),
                occurrences: ping_pongs,
                confidence: (0.5 + 0.1 * f64::from(ping_pongs)).min(1.0),
            });
        }

        let kind = movement_kind(&device_events, &aps);
        let occurrences = device_events.len() as u32;
        patterns.push(RoamingPattern {
            kind,
            device_mac: mac.to_string(),
            aps: aps.iter().map(|s| s.to_string()).collect(),
            occurrences,
            confidence: movement_confidence(kind, occurrences),
        });
    }

    patterns.sort_by(|a, b| a.device_mac.cmp(&b.device_mac));
    patterns
}

/// Coarse movement classification over a device's transition sequence.
fn movement_kind(events: &[&RoamingEvent], aps: &[&str]) -> RoamingPatternKind {
    let transitions: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e.from_ap.as_str(), e.to_ap.as_str()))
        .collect();

    // Predictable: the whole transition sequence repeats.
    if transitions.len() >= 4 {
        let half = transitions.len() / 2;
        if transitions[..half] == transitions[half..half * 2] {
            return RoamingPatternKind::Predictable;
        }
    }

    // Cyclic: the path returns to its starting AP through >= 3 APs.
    let start = events[0].from_ap.as_str();
    let returns_to_start = events.last().map(|e| e.to_ap.as_str()) == Some(start);
    if returns_to_start && aps.len() >= 3 {
        return RoamingPatternKind::Cyclic;
    }

    // Radial: one hub AP is an endpoint of nearly every hop.
    if aps.len() >= 3 {
        let radial = aps.iter().any(|hub| {
            let participation = transitions
                .iter()
                .filter(|(from, to)| from == hub || to == hub)
                .count();
            participation * 4 >= transitions.len() * 3 && participation >= 3
        });
        if radial {
            return RoamingPatternKind::Radial;
        }
    }

    // Sequential: no AP revisited.
    let unique_targets: HashSet<&str> = transitions.iter().map(|(_, to)| *to).collect();
    if unique_targets.len() == transitions.len() {
        return RoamingPatternKind::Sequential;
    }

    RoamingPatternKind::Random
}

fn movement_confidence(kind: RoamingPatternKind, occurrences: u32) -> f64 {
    let base = match kind {
        RoamingPatternKind::Predictable => 0.9,
        RoamingPatternKind::Cyclic => 0.8,
        RoamingPatternKind::Radial => 0.7,
        RoamingPatternKind::Sequential => 0.6,
        RoamingPatternKind::PingPong => 0.7,
        RoamingPatternKind::Random => 0.4,
    };
    (base + f64::from(occurrences.min(10)) * 0.02).min(1.0)
}

/// Flag roaming anomalies over the event stream.
pub fn detect_anomalies(
    events: &[RoamingEvent],
    ping_pong_window_ms: i64,
) -> Vec<RoamingAnomaly> {
    let mut by_device: HashMap<&str, Vec<&RoamingEvent>> = HashMap::new();
    for event in events {
        by_device.entry(&event.device_mac).or_default().push(event);
    }

    let mut anomalies = Vec::new();
    for (mac, mut device_events) in by_device {
        device_events.sort_by_key(|e| e.ts_ms);

        for pair in device_events.windows(2) {
            if pair[1].to_ap == pair[0].from_ap
                && pair[1].ts_ms - pair[0].ts_ms <= ping_pong_window_ms
            {
                anomalies.push(RoamingAnomaly {
                    kind: RoamingAnomalyKind::PingPong,
                    device_mac: mac.to_string(),
                    ts_ms: pair[1].ts_ms,
                    detail: format!(
                        "{} -> {} -> {} within {} ms",
                        pair[0].from_ap,
                        pair[0].to_ap,
                        pair[1].to_ap,
                        pair[1].ts_ms - pair[0].ts_ms
                    ),
                });
            }
        }

        let mut streak = 0usize;
        for event in &device_events {
            if event.quality < FAILURE_QUALITY {
                streak += 1;
                if streak == FAILURE_STREAK {
                    anomalies.push(RoamingAnomaly {
                        kind: RoamingAnomalyKind::RepeatedFailure,
                        device_mac: mac.to_string(),
                        ts_ms: event.ts_ms,
                        detail: format!("{FAILURE_STREAK} consecutive poor handovers"),
                    });
                }
            } else {
                streak = 0;
            }
        }

        for pair in device_events.windows(2) {
            let dwell = pair[1].ts_ms - pair[0].ts_ms;
            if dwell > LONG_DWELL_MS {
                anomalies.push(RoamingAnomaly {
                    kind: RoamingAnomalyKind::LongDwellIsolated,
                    device_mac: mac.to_string(),
                    ts_ms: pair[1].ts_ms,
                    detail: format!("client dwelled {} s between roamings", dwell / 1000),
                });
            }
        }
    }

    anomalies.sort_by_key(|a| a.ts_ms);
    anomalies
}

/// Convenience: per-session anomaly overlay used by the history engine.
pub fn anomalies_for_sessions(
    sessions: &[RoamingSession],
    ping_pong_window_ms: i64,
) -> Vec<RoamingAnomaly> {
    let events: Vec<RoamingEvent> = sessions
        .iter()
        .flat_map(|s| s.events.iter().cloned())
        .collect();
    detect_anomalies(&events, ping_pong_window_ms)
}
