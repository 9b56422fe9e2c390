//! Parameterized queries over roaming events, sessions, patterns and
//! anomalies, with an LRU+TTL result cache keyed by the canonical
//! parameter encoding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use types::{
    RoamReason, RoamingAnomaly, RoamingEvent, RoamingPattern, RoamingSession, SessionClass,
};

use crate::detector::RoamingDetector;
use crate::{patterns, sessions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    TimestampAsc,
    TimestampDesc,
    QualityAsc,
    QualityDesc,
    DurationAsc,
    DurationDesc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::TimestampAsc
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryQuery {
    pub from_ms: i64,
    pub to_ms: i64,
    pub device_macs: Vec<String>,
    pub aps: Vec<String>,
    pub reasons: Vec<RoamReason>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub min_quality: Option<f64>,
    pub sort: SortOrder,
    pub page: usize,
    pub page_size: usize,
    pub include_patterns: bool,
    pub include_anomalies: bool,
    pub include_visualization: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            from_ms: 0,
            to_ms: i64::MAX,
            device_macs: Vec::new(),
            aps: Vec::new(),
            reasons: Vec::new(),
            min_duration_ms: None,
            max_duration_ms: None,
            min_quality: None,
            sort: SortOrder::default(),
            page: 0,
            page_size: 100,
            include_patterns: false,
            include_anomalies: false,
            include_visualization: false,
        }
    }
}

impl HistoryQuery {
    /// Canonical cache key: the serialized parameter set. Field order is
    /// fixed by the struct, so equal parameters hash equally.
    fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStatistics {
    pub total_events: usize,
    pub total_sessions: usize,
    pub unique_devices: usize,
    pub unique_aps: usize,
    pub avg_quality: f64,
    pub sessions_by_class: HashMap<String, usize>,
    pub busiest_ap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub ts_ms: i64,
    pub device_mac: String,
    pub to_ap: String,
    pub quality: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub ap: String,
    pub hour: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDiagram {
    pub nodes: Vec<String>,
    pub edges: Vec<FlowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResult {
    pub events: Vec<RoamingEvent>,
    pub sessions: Vec<RoamingSession>,
    pub patterns: Vec<RoamingPattern>,
    pub anomalies: Vec<RoamingAnomaly>,
    pub statistics: HistoryStatistics,
    pub summary: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub timeline: Option<Vec<TimelinePoint>>,
    pub heatmap: Option<Vec<HeatmapCell>>,
    pub flow: Option<FlowDiagram>,
    pub is_cached: bool,
    /// Matching events before pagination.
    pub total_matched: usize,
}

struct CacheEntry {
    result: HistoryResult,
    inserted_at: Instant,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// LRU+TTL cache under a single mutex.
struct QueryCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    max_size: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl QueryCache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size,
            ttl,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<HistoryResult> {
        let fresh = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() <= self.ttl,
            None => false,
        };
        if !fresh {
            if self.entries.remove(key).is_some() {
                self.order.retain(|k| k != key);
            }
            self.misses += 1;
            return None;
        }
        self.hits += 1;
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
        self.entries.get(key).map(|e| e.result.clone())
    }

    fn insert(&mut self, key: String, result: HistoryResult) {
        while self.entries.len() >= self.max_size {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
        }
        self.order.retain(|k| k != &key);
        self.order.push_back(key.clone());
        self.entries.insert(key, CacheEntry {
            result,
            inserted_at: Instant::now(),
        });
    }

    fn prune_expired(&mut self) {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.order.retain(|k| k != &key);
            self.evictions += 1;
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
        }
    }
}

pub struct RoamingHistoryEngine {
    detector: Arc<RoamingDetector>,
    roaming_cfg: config::RoamingConfig,
    cache: Mutex<QueryCache>,
}

impl RoamingHistoryEngine {
    pub fn new(
        detector: Arc<RoamingDetector>,
        roaming_cfg: config::RoamingConfig,
        history_cfg: &config::HistoryConfig,
    ) -> Self {
        Self {
            detector,
            roaming_cfg,
            cache: Mutex::new(QueryCache::new(
                history_cfg.max_cache_size,
                Duration::from_secs(history_cfg.cache_retention_s),
            )),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().expect("cache lock poisoned").stats()
    }

    /// Drop expired cache entries; driven by the hourly prune task.
    pub fn prune_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").prune_expired();
    }

    pub fn execute(&self, query: &HistoryQuery) -> HistoryResult {
        let key = query.cache_key();
        if let Some(mut cached) = self.cache.lock().expect("cache lock poisoned").get(&key) {
            cached.is_cached = true;
            return cached;
        }

        let result = self.compute(query);
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(key, result.clone());
        result
    }

    fn compute(&self, query: &HistoryQuery) -> HistoryResult {
        // 1. Load from the detector's persisted stream.
        let mut events = self.detector.events_in_range(query.from_ms, query.to_ms);

        // 2. Filter.
        let device_macs: HashSet<String> = query
            .device_macs
            .iter()
            .map(|m| types::normalize_mac(m))
            .collect();
        let aps: HashSet<String> = query.aps.iter().map(|a| types::normalize_mac(a)).collect();
        events.retain(|e| {
            (device_macs.is_empty() || device_macs.contains(&e.device_mac))
                && (aps.is_empty() || aps.contains(&e.from_ap) || aps.contains(&e.to_ap))
                && (query.reasons.is_empty() || query.reasons.contains(&e.reason))
                && query.min_duration_ms.map_or(true, |min| e.duration_ms >= min)
                && query.max_duration_ms.map_or(true, |max| e.duration_ms <= max)
                && query.min_quality.map_or(true, |min| e.quality >= min)
        });

        // 2b. Sort.
        match query.sort {
            SortOrder::TimestampAsc => events.sort_by_key(|e| e.ts_ms),
            SortOrder::TimestampDesc => events.sort_by_key(|e| std::cmp::Reverse(e.ts_ms)),
            SortOrder::QualityAsc => {
                events.sort_by(|a, b| a.quality.total_cmp(&b.quality));
            }
            SortOrder::QualityDesc => {
                events.sort_by(|a, b| b.quality.total_cmp(&a.quality));
            }
            SortOrder::DurationAsc => events.sort_by_key(|e| e.duration_ms),
            SortOrder::DurationDesc => events.sort_by_key(|e| std::cmp::Reverse(e.duration_ms)),
        }

        // 3. Paginate.
        let total_matched = events.len();
        let page_size = query.page_size.max(1);
        let events: Vec<RoamingEvent> = events
            .into_iter()
            .skip(query.page * page_size)
            .take(page_size)
            .collect();

        // 4. Sessions over the page.
        let max_gap_ms = self.roaming_cfg.max_gap_between_events_s as i64 * 1000;
        let sessions = sessions::build_sessions(&events, max_gap_ms);

        // 5/6. Optional pattern and anomaly overlays.
        let ping_pong_ms = self.roaming_cfg.ping_pong_window_s as i64 * 1000;
        let patterns = if query.include_patterns {
            patterns::mine_patterns(&events, ping_pong_ms)
        } else {
            Vec::new()
        };
        let anomalies = if query.include_anomalies {
            patterns::detect_anomalies(&events, ping_pong_ms)
        } else {
            Vec::new()
        };

        // 7. Statistics, summary, recommendations.
        let statistics = compute_statistics(&events, &sessions);
        let (summary, insights, recommendations) =
            narrate(&statistics, &sessions, &anomalies, query);

        // 8. Optional visualization primitives.
        let (timeline, heatmap, flow) = if query.include_visualization {
            (
                Some(build_timeline(&events)),
                Some(build_heatmap(&events)),
                Some(build_flow(&events)),
            )
        } else {
            (None, None, None)
        };

        HistoryResult {
            events,
            sessions,
            patterns,
            anomalies,
            statistics,
            summary,
            insights,
            recommendations,
            timeline,
            heatmap,
            flow,
            is_cached: false,
            total_matched,
        }
    }
}

fn compute_statistics(events: &[RoamingEvent], sessions: &[RoamingSession]) -> HistoryStatistics {
    let unique_devices: HashSet<&str> = events.iter().map(|e| e.device_mac.as_str()).collect();
    let mut ap_counts: HashMap<&str, usize> = HashMap::new();
    for e in events {
        *ap_counts.entry(e.from_ap.as_str()).or_default() += 1;
        *ap_counts.entry(e.to_ap.as_str()).or_default() += 1;
    }
    let avg_quality = if events.is_empty() {
        0.0
    } else {
        events.iter().map(|e| e.quality).sum::<f64>() / events.len() as f64
    };
    let mut sessions_by_class: HashMap<String, usize> = HashMap::new();
    for s in sessions {
        *sessions_by_class.entry(s.class.to_string()).or_default() += 1;
    }

    HistoryStatistics {
        total_events: events.len(),
        total_sessions: sessions.len(),
        unique_devices: unique_devices.len(),
        unique_aps: ap_counts.len(),
        avg_quality,
        sessions_by_class,
        busiest_ap: ap_counts
            .into_iter()
            .max_by_key(|(_, c)| *c)
            .map(|(ap, _)| ap.to_string()),
    }
}

fn narrate(
    stats: &HistoryStatistics,
    sessions: &[RoamingSession],
    anomalies: &[RoamingAnomaly],
    query: &HistoryQuery,
) -> (String, Vec<String>, Vec<String>) {
    let summary = format!(
        "{} roaming events across {} clients and {} APs in the selected window; \
         {} sessions, average handover quality {:.2}.",
        stats.total_events,
        stats.unique_devices,
        stats.unique_aps,
        stats.total_sessions,
        stats.avg_quality
    );

    let mut insights = Vec::new();
    let mut recommendations = Vec::new();

    let problematic = sessions
        .iter()
        .filter(|s| s.class == SessionClass::Problematic)
        .count();
    if problematic > 0 {
        insights.push(format!(
            "{problematic} of {} sessions are problematic (poor quality or excessive roaming)",
            sessions.len()
        ));
        recommendations
            .push("Review AP placement and transmit power around the affected clients".to_string());
    }
    if stats.avg_quality < 0.5 && stats.total_events > 0 {
        insights.push("Average handover quality is poor across the window".to_string());
        recommendations
            .push("Check channel overlap and minimum-RSSI roaming thresholds".to_string());
    }
    if anomalies
        .iter()
        .any(|a| a.kind == types::RoamingAnomalyKind::PingPong)
    {
        insights.push("Ping-pong roaming detected between adjacent APs".to_string());
        recommendations.push(
            "Increase roaming hysteresis or rebalance power between the two APs".to_string(),
        );
    }
    if let Some(ap) = &stats.busiest_ap {
        insights.push(format!("AP {ap} participates in the most handovers"));
    }
    if stats.total_events == 0 {
        insights.push(format!(
            "No roaming events between {} and {}",
            query.from_ms, query.to_ms
        ));
    }

    (summary, insights, recommendations)
}

fn build_timeline(events: &[RoamingEvent]) -> Vec<TimelinePoint> {
    events
        .iter()
        .map(|e| TimelinePoint {
            ts_ms: e.ts_ms,
            device_mac: e.device_mac.clone(),
            to_ap: e.to_ap.clone(),
            quality: e.quality,
        })
        .collect()
}

fn build_heatmap(events: &[RoamingEvent]) -> Vec<HeatmapCell> {
    let mut cells: HashMap<(String, u32), usize> = HashMap::new();
    for e in events {
        let hour = ((e.ts_ms / 3_600_000) % 24) as u32;
        *cells.entry((e.to_ap.clone(), hour)).or_default() += 1;
    }
    let mut out: Vec<HeatmapCell> = cells
        .into_iter()
        .map(|((ap, hour), count)| HeatmapCell { ap, hour, count })
        .collect();
    out.sort_by(|a, b| (&a.ap, a.hour).cmp(&(&b.ap, b.hour)));
    out
}

fn build_flow(events: &[RoamingEvent]) -> FlowDiagram {
    let mut nodes: Vec<String> = Vec::new();
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    for e in events {
        for ap in [&e.from_ap, &e.to_ap] {
            if !nodes.contains(ap) {
                nodes.push(ap.clone());
            }
        }
        *counts
            .entry((e.from_ap.clone(), e.to_ap.clone()))
            .or_default() += 1;
    }
    let mut edges: Vec<FlowEdge> = counts
        .into_iter()
        .map(|((from, to), count)| FlowEdge { from, to, count })
        .collect();
    edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
    FlowDiagram { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ClientObservation;
    use storage::Store;

    async fn engine_with_pingpong() -> RoamingHistoryEngine {
        let detector = Arc::new(RoamingDetector::new(Store::new(), 30_000));
        let base = 1_700_000_000_000;
        // AP1 -> AP2 -> AP1 for one client.
        for (offset, bssid) in [
            (0, "aa:aa:aa:aa:aa:01"),
            (2_000, "aa:aa:aa:aa:aa:02"),
            (5_000, "aa:aa:aa:aa:aa:01"),
        ] {
            detector
                .observe(ClientObservation {
                    ts_ms: base + offset,
                    client_mac: "11:22:33:44:55:66".into(),
                    bssid: Some(bssid.into()),
                    ssid: Some("lab".into()),
                    rssi: Some(-50),
                })
                .await;
        }
        RoamingHistoryEngine::new(
            detector,
            config::RoamingConfig::default(),
            &config::HistoryConfig::default(),
        )
    }

    #[tokio::test]
    async fn ping_pong_scenario_builds_one_session_with_anomaly() {
        let engine = engine_with_pingpong().await;
        let query = HistoryQuery {
            from_ms: 1_700_000_000_000 - 1,
            to_ms: 1_700_000_100_000,
            include_patterns: true,
            include_anomalies: true,
            ..HistoryQuery::default()
        };
        let result = engine.execute(&query);

        assert_eq!(result.events.len(), 2);
        assert_eq!(result.sessions.len(), 1);
        assert!(result
            .patterns
            .iter()
            .any(|p| p.kind == types::RoamingPatternKind::PingPong));
        assert!(result
            .anomalies
            .iter()
            .any(|a| a.kind == types::RoamingAnomalyKind::PingPong));
        assert!(!result.is_cached);
    }

    #[tokio::test]
    async fn cache_hit_returns_equal_result() {
        let engine = engine_with_pingpong().await;
        let query = HistoryQuery {
            from_ms: 0,
            to_ms: i64::MAX,
            ..HistoryQuery::default()
        };

        let first = engine.execute(&query);
        let second = engine.execute(&query);
        assert!(!first.is_cached);
        assert!(second.is_cached);

        // Identical content apart from the cache marker.
        let mut second_plain = second.clone();
        second_plain.is_cached = false;
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second_plain).unwrap()
        );

        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn filters_and_pagination_apply() {
        let engine = engine_with_pingpong().await;
        let query = HistoryQuery {
            from_ms: 0,
            to_ms: i64::MAX,
            min_quality: Some(0.99),
            ..HistoryQuery::default()
        };
        let result = engine.execute(&query);
        assert_eq!(result.total_matched, 0);

        let paged = engine.execute(&HistoryQuery {
            from_ms: 0,
            to_ms: i64::MAX,
            page_size: 1,
            page: 1,
            ..HistoryQuery::default()
        });
        assert_eq!(paged.total_matched, 2);
        assert_eq!(paged.events.len(), 1);
    }

    #[tokio::test]
    async fn visualization_primitives_are_built_on_request() {
        let engine = engine_with_pingpong().await;
        let result = engine.execute(&HistoryQuery {
            from_ms: 0,
            to_ms: i64::MAX,
            include_visualization: true,
            ..HistoryQuery::default()
        });
        assert_eq!(result.timeline.as_ref().map(Vec::len), Some(2));
        assert!(result.heatmap.is_some());
        let flow = result.flow.unwrap();
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.edges.len(), 2);
    }
}
