use std::collections::HashMap;

use types::{RoamingEvent, RoamingSession, SessionClass};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Group events into maximal per-device sessions within a day bucket,
/// splitting when consecutive events are farther apart than `max_gap_ms`.
pub fn build_sessions(events: &[RoamingEvent], max_gap_ms: i64) -> Vec<RoamingSession> {
    let mut by_device: HashMap<&str, Vec<&RoamingEvent>> = HashMap::new();
    for event in events {
        by_device.entry(&event.device_mac).or_default().push(event);
    }

    let mut sessions = Vec::new();
    for (_, mut device_events) in by_device {
        device_events.sort_by_key(|e| e.ts_ms);

        let mut current: Vec<&RoamingEvent> = Vec::new();
        for event in device_events {
            let split = current.last().is_some_and(|last| {
                event.ts_ms - last.ts_ms > max_gap_ms
                    || event.ts_ms / DAY_MS != last.ts_ms / DAY_MS
            });
            if split {
                sessions.push(finish_session(&current));
                current.clear();
            }
            current.push(event);
        }
        if !current.is_empty() {
            sessions.push(finish_session(&current));
        }
    }

    sessions.sort_by_key(|s| s.start_ms);
    sessions
}

fn finish_session(events: &[&RoamingEvent]) -> RoamingSession {
    let start_ms = events.first().map(|e| e.ts_ms).unwrap_or_default();
    let end_ms = events.last().map(|e| e.ts_ms).unwrap_or_default();
    let avg_quality = if events.is_empty() {
        0.0
    } else {
        events.iter().map(|e| e.quality).sum::<f64>() / events.len() as f64
    };

    let mut ap_sequence = Vec::new();
    if let Some(first) = events.first() {
        ap_sequence.push(first.from_ap.clone());
    }
    for event in events {
        ap_sequence.push(event.to_ap.clone());
    }

    // Deterministic id: the same event set always rebuilds the same
    // session identity.
    let device_mac_for_id = events
        .first()
        .map(|e| e.device_mac.clone())
        .unwrap_or_default();
    RoamingSession {
        id: format!("{device_mac_for_id}:{start_ms}"),
        device_mac: events
            .first()
            .map(|e| e.device_mac.clone())
            .unwrap_or_default(),
        start_ms,
        end_ms,
        duration_ms: end_ms - start_ms,
        ap_sequence,
        events: events.iter().map(|e| (*e).clone()).collect(),
        avg_quality,
        class: classify(events, avg_quality),
    }
}

/// Session classification thresholds: `optimal` is few, high-quality
/// roamings; `problematic` is poor quality or thrashing; a heavy
/// revisit ratio with otherwise fine quality reads as `unusual`.
fn classify(events: &[&RoamingEvent], avg_quality: f64) -> SessionClass {
    let count = events.len();
    if avg_quality < 0.5 || count > 10 {
        return SessionClass::Problematic;
    }
    if avg_quality > 0.8 && count <= 3 {
        return SessionClass::Optimal;
    }

    let revisits = events
        .iter()
        .filter(|e| {
            events
                .iter()
                .any(|prior| prior.ts_ms < e.ts_ms && prior.from_ap == e.to_ap)
        })
        .count();
    if count >= 2 && revisits * 2 > count {
        return SessionClass::Unusual;
    }
    SessionClass::Normal
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::RoamReason;

    fn event(ts: i64, mac: &str, from: &str, to: &str, quality: f64) -> RoamingEvent {
        RoamingEvent {
            ts_ms: ts,
            device_mac: mac.into(),
            from_ap: from.into(),
            to_ap: to.into(),
            from_ssid: None,
            to_ssid: None,
            reason: RoamReason::BssidChange,
            duration_ms: 500,
            signal_before: Some(-60),
            signal_after: Some(-50),
            quality,
        }
    }

    #[test]
    fn splits_on_gap_and_groups_per_device() {
        let events = vec![
            event(1_000, "m1", "a", "b", 0.9),
            event(2_000, "m1", "b", "c", 0.9),
            // Gap beyond max_gap splits the session.
            event(10_000_000, "m1", "c", "a", 0.9),
            event(1_500, "m2", "x", "y", 0.9),
        ];
        let sessions = build_sessions(&events, 60_000);
        assert_eq!(sessions.len(), 3);
        let m1_sessions: Vec<_> = sessions.iter().filter(|s| s.device_mac == "m1").collect();
        assert_eq!(m1_sessions.len(), 2);
        assert_eq!(m1_sessions[0].events.len(), 2);
        assert_eq!(m1_sessions[0].ap_sequence, vec!["a", "b", "c"]);
    }

    #[test]
    fn session_invariants_hold() {
        let events = vec![
            event(1_000, "m1", "a", "b", 0.9),
            event(4_000, "m1", "b", "c", 0.7),
        ];
        let sessions = build_sessions(&events, 60_000);
        let s = &sessions[0];
        assert!(s.end_ms >= s.start_ms);
        assert!(!s.events.is_empty());
        assert!(s.events.iter().all(|e| e.device_mac == s.device_mac));
        assert!((s.avg_quality - 0.8).abs() < 1e-9);
    }

    #[test]
    fn classification_thresholds() {
        // Optimal: short and clean.
        let optimal = build_sessions(&[event(1, "m", "a", "b", 0.95)], 60_000);
        assert_eq!(optimal[0].class, SessionClass::Optimal);

        // Problematic: poor average quality.
        let poor = build_sessions(
            &[
                event(1, "m", "a", "b", 0.2),
                event(2, "m", "b", "c", 0.3),
            ],
            60_000,
        );
        assert_eq!(poor[0].class, SessionClass::Problematic);

        // Problematic: too many roamings regardless of quality.
        let thrash: Vec<_> = (0..12)
            .map(|i| event(i * 100, "m", "a", "b", 0.9))
            .collect();
        assert_eq!(build_sessions(&thrash, 60_000)[0].class, SessionClass::Problematic);

        // Unusual: ping-pong revisits at decent quality.
        let pingpong = vec![
            event(1_000, "m", "a", "b", 0.75),
            event(2_000, "m", "b", "a", 0.75),
            event(3_000, "m", "a", "b", 0.75),
            event(4_000, "m", "b", "a", 0.75),
        ];
        assert_eq!(build_sessions(&pingpong, 60_000)[0].class, SessionClass::Unusual);
    }
}
