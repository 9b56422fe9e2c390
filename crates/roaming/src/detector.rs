use std::collections::HashMap;

use storage::Store;
use tokio::sync::Mutex;
use tracing::debug;
use types::{normalize_mac, RoamReason, RoamingEvent};

/// One WiFi client observation: the STA side of an association as seen in
/// a device's reported state.
#[derive(Debug, Clone)]
pub struct ClientObservation {
    pub ts_ms: i64,
    pub client_mac: String,
    /// `None` when the client is disconnected.
    pub bssid: Option<String>,
    pub ssid: Option<String>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone)]
struct ClientTrack {
    ts_ms: i64,
    bssid: Option<String>,
    ssid: Option<String>,
    rssi: Option<i32>,
    /// Set while the client is between APs: the association it left.
    disconnected_from: Option<(i64, String, Option<String>, Option<i32>)>,
}

/// Converts successive WiFi client observations into roaming events.
///
/// An event is emitted when the BSSID changes in place, or when a client
/// reconnects to a different BSSID within the roaming window after a
/// disconnect.
pub struct RoamingDetector {
    store: Store,
    tracks: Mutex<HashMap<String, ClientTrack>>,
    roaming_window_ms: i64,
}

impl RoamingDetector {
    pub fn new(store: Store, roaming_window_ms: i64) -> Self {
        Self {
            store,
            tracks: Mutex::new(HashMap::new()),
            roaming_window_ms,
        }
    }

    /// Feed one observation; returns the roaming event if one was detected.
    pub async fn observe(&self, obs: ClientObservation) -> Option<RoamingEvent> {
        let mac = normalize_mac(&obs.client_mac);
        let bssid = obs.bssid.as_deref().map(normalize_mac);
        let mut tracks = self.tracks.lock().await;

        let Some(track) = tracks.get_mut(&mac) else {
            tracks.insert(
                mac,
                ClientTrack {
                    ts_ms: obs.ts_ms,
                    bssid,
                    ssid: obs.ssid,
                    rssi: obs.rssi,
                    disconnected_from: None,
                },
            );
            return None;
        };

        let event = match (&track.bssid, &bssid) {
            // In-place handover: associated BSSID changed.
            (Some(old), Some(new)) if old != new => Some(self.make_event(
                &mac,
                obs.ts_ms,
                old.clone(),
                new.clone(),
                track.ssid.clone(),
                obs.ssid.clone(),
                track.rssi,
                obs.rssi,
                obs.ts_ms - track.ts_ms,
                RoamReason::BssidChange,
            )),
            // Reconnect after a disconnect: roaming iff the new BSSID
            // differs and the gap fits the roaming window.
            (None, Some(new)) => match track.disconnected_from.take() {
                Some((left_at, old, old_ssid, old_rssi))
                    if old != *new && obs.ts_ms - left_at <= self.roaming_window_ms =>
                {
                    Some(self.make_event(
                        &mac,
                        obs.ts_ms,
                        old,
                        new.clone(),
                        old_ssid,
                        obs.ssid.clone(),
                        old_rssi,
                        obs.rssi,
                        obs.ts_ms - left_at,
                        RoamReason::Reconnect,
                    ))
                }
                _ => None,
            },
            // Disconnect: remember what was left behind.
            (Some(old), None) => {
                track.disconnected_from =
                    Some((obs.ts_ms, old.clone(), track.ssid.clone(), track.rssi));
                None
            }
            _ => None,
        };

        track.ts_ms = obs.ts_ms;
        track.bssid = bssid;
        if obs.ssid.is_some() {
            track.ssid = obs.ssid;
        }
        if obs.rssi.is_some() {
            track.rssi = obs.rssi;
        }

        if let Some(event) = &event {
            if let Err(e) = self.store.put_json(event.storage_key(), event) {
                debug!("failed to persist roaming event: {e}");
            }
        }
        event
    }

    #[allow(clippy::too_many_arguments)]
    fn make_event(
        &self,
        mac: &str,
        ts_ms: i64,
        from_ap: String,
        to_ap: String,
        from_ssid: Option<String>,
        to_ssid: Option<String>,
        signal_before: Option<i32>,
        signal_after: Option<i32>,
        duration_ms: i64,
        reason: RoamReason,
    ) -> RoamingEvent {
        let quality = handover_quality(signal_before, signal_after, duration_ms);
        RoamingEvent {
            ts_ms,
            device_mac: mac.to_string(),
            from_ap,
            to_ap,
            from_ssid,
            to_ssid,
            reason,
            duration_ms,
            signal_before,
            signal_after,
            quality,
        }
    }

    /// Events in `[from_ms, to_ms)`, oldest first.
    pub fn events_in_range(&self, from_ms: i64, to_ms: i64) -> Vec<RoamingEvent> {
        let (start, end) = storage::keys::roaming_range(from_ms, to_ms);
        self.store
            .iterate_range(&start, &end)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }
}

/// Handover quality in [0, 1]. A quick handover to a stronger signal is
/// good; a slow handover to a weaker one is bad.
fn handover_quality(before: Option<i32>, after: Option<i32>, duration_ms: i64) -> f64 {
    let mut quality: f64 = 0.7;
    if let (Some(before), Some(after)) = (before, after) {
        let delta = f64::from(after - before);
        quality += (delta / 20.0).clamp(-0.3, 0.3);
    }
    let duration_penalty = (duration_ms as f64 / 10_000.0).clamp(0.0, 0.4);
    quality -= duration_penalty;
    quality.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(ts: i64, bssid: Option<&str>, rssi: i32) -> ClientObservation {
        ClientObservation {
            ts_ms: ts,
            client_mac: "11:22:33:44:55:66".into(),
            bssid: bssid.map(str::to_string),
            ssid: Some("lab".into()),
            rssi: Some(rssi),
        }
    }

    #[tokio::test]
    async fn bssid_change_emits_event() {
        let detector = RoamingDetector::new(Store::new(), 30_000);
        assert!(detector.observe(obs(1_000, Some("aa:aa:aa:aa:aa:01"), -70)).await.is_none());
        let event = detector
            .observe(obs(3_000, Some("aa:aa:aa:aa:aa:02"), -45))
            .await
            .expect("roaming event");
        assert_eq!(event.from_ap, "aaaaaaaaaa01");
        assert_eq!(event.to_ap, "aaaaaaaaaa02");
        assert_eq!(event.device_mac, "112233445566");
        assert!(event.quality > 0.7, "improving handover should score well");
    }

    #[tokio::test]
    async fn reconnect_within_window_is_roaming() {
        let detector = RoamingDetector::new(Store::new(), 30_000);
        detector.observe(obs(1_000, Some("aa:aa:aa:aa:aa:01"), -60)).await;
        assert!(detector.observe(obs(2_000, None, -60)).await.is_none());
        let event = detector
            .observe(obs(10_000, Some("aa:aa:aa:aa:aa:02"), -50))
            .await
            .expect("roaming event");
        assert_eq!(event.reason, RoamReason::Reconnect);
        assert_eq!(event.duration_ms, 8_000);
    }

    #[tokio::test]
    async fn reconnect_outside_window_is_not_roaming() {
        let detector = RoamingDetector::new(Store::new(), 30_000);
        detector.observe(obs(1_000, Some("aa:aa:aa:aa:aa:01"), -60)).await;
        detector.observe(obs(2_000, None, -60)).await;
        assert!(detector
            .observe(obs(40_000, Some("aa:aa:aa:aa:aa:02"), -50))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn reconnect_to_same_ap_is_not_roaming() {
        let detector = RoamingDetector::new(Store::new(), 30_000);
        detector.observe(obs(1_000, Some("aa:aa:aa:aa:aa:01"), -60)).await;
        detector.observe(obs(2_000, None, -60)).await;
        assert!(detector
            .observe(obs(3_000, Some("aa:aa:aa:aa:aa:01"), -55))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn events_persist_for_range_queries() {
        let detector = RoamingDetector::new(Store::new(), 30_000);
        detector.observe(obs(1_000, Some("aa:aa:aa:aa:aa:01"), -60)).await;
        detector.observe(obs(2_000, Some("aa:aa:aa:aa:aa:02"), -50)).await;
        detector.observe(obs(5_000, Some("aa:aa:aa:aa:aa:01"), -55)).await;

        let events = detector.events_in_range(0, 10_000);
        assert_eq!(events.len(), 2);
        assert!(events[0].ts_ms <= events[1].ts_ms);
    }

    #[test]
    fn quality_degrades_with_worse_signal_and_slow_handover() {
        let good = handover_quality(Some(-70), Some(-45), 500);
        let bad = handover_quality(Some(-45), Some(-75), 8_000);
        assert!(good > 0.8);
        assert!(bad < 0.3);
        assert!((0.0..=1.0).contains(&good) && (0.0..=1.0).contains(&bad));
    }
}
