//! Fusion of UWB ranging edges, surveyed anchors, and cached LoRa telemetry
//! into the network topology document.
//!
//! ## Precedence
//! Anchor positions always win: a node configured as an anchor gets its
//! surveyed coordinates and the anchor confidence even if fresher LoRa GPS is
//! cached for it. Non-anchor nodes fall back to a validated, non-stale cached
//! fix, and otherwise report an unknown position. Sensor readings attach
//! independently of position.
//!
//! Built fresh each ranging cycle from the current edge set; nothing here
//! persists between cycles except what the telemetry cache holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use uwb_proto::{Edge, NodeId};

use crate::confidence::ConfidenceScorer;
use crate::telemetry_cache::TelemetryCache;
use crate::validator::{DataValidator, ValidationFailure};

// ── Inputs ────────────────────────────────────────────────────────────────────

/// Statically surveyed anchor position from the anchor config file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Max age of a cached GPS fix before it is ignored, seconds.
    pub gps_max_age_s: f64,
    /// Max age of cached sensor readings before they are ignored, seconds.
    pub sensor_max_age_s: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gps_max_age_s: 300.0,
            sensor_max_age_s: 600.0,
        }
    }
}

// ── Output document ───────────────────────────────────────────────────────────

/// Local-frame coordinates. The gateway does not solve for positions, so
/// these are always zero; downstream solvers fill them in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub position: Position,
    pub lat_lon_alt: [f64; 3],
    pub position_known: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_source: Option<String>,
    /// Reported fix accuracy in meters; 0.0 when the source carries none.
    pub position_accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_position_update_time: Option<f64>,
    /// 0 means "no triage status reported".
    pub triage_status: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_counter: Option<u64>,
    /// All edges incident to this node, both directions included.
    pub edges: Vec<Edge>,
}

impl NodeRecord {
    fn unknown(id: NodeId) -> Self {
        Self {
            id,
            position: Position::default(),
            lat_lon_alt: [0.0; 3],
            position_known: false,
            position_source: None,
            position_accuracy: 0.0,
            position_confidence: None,
            last_position_update_time: None,
            triage_status: 0,
            battery: None,
            temperature: None,
            rssi: None,
            snr: None,
            frame_counter: None,
            edges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkDocument {
    pub uwbs: Vec<NodeRecord>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct FusionEngine {
    anchors: HashMap<NodeId, Anchor>,
    cache: Arc<TelemetryCache>,
    validator: Arc<DataValidator>,
    scorer: ConfidenceScorer,
    cfg: FusionConfig,
}

impl FusionEngine {
    pub fn new(
        anchors: HashMap<NodeId, Anchor>,
        cache: Arc<TelemetryCache>,
        validator: Arc<DataValidator>,
        scorer: ConfidenceScorer,
        cfg: FusionConfig,
    ) -> Self {
        Self {
            anchors,
            cache,
            validator,
            scorer,
            cfg,
        }
    }

    /// Build the topology document for one ranging cycle.
    ///
    /// The node set is exactly the deduplicated edge endpoints, in sorted id
    /// order; an anchor that took part in no measurement this cycle is not
    /// published. Invalid telemetry fields are dropped from the output and
    /// returned as validation failures.
    pub fn build(&self, edges: &[Edge], now: f64) -> (NetworkDocument, Vec<ValidationFailure>) {
        let mut ids = BTreeSet::new();
        for edge in edges {
            ids.insert(edge.end0);
            ids.insert(edge.end1);
        }

        let mut failures = Vec::new();
        let uwbs = ids
            .into_iter()
            .map(|id| self.build_node(id, edges, now, &mut failures))
            .collect();
        (NetworkDocument { uwbs }, failures)
    }

    fn build_node(
        &self,
        id: NodeId,
        edges: &[Edge],
        now: f64,
        failures: &mut Vec<ValidationFailure>,
    ) -> NodeRecord {
        let mut record = NodeRecord::unknown(id);
        record.edges = edges
            .iter()
            .filter(|e| e.end0 == id || e.end1 == id)
            .copied()
            .collect();

        let cached = self
            .cache
            .get_at(id, self.cfg.gps_max_age_s, self.cfg.sensor_max_age_s, now);

        if let Some(anchor) = self.anchors.get(&id) {
            record.position_known = true;
            record.lat_lon_alt = [anchor.lat, anchor.lon, anchor.alt];
            record.position_source = Some("anchor".to_string());
            record.position_confidence = Some(self.scorer.anchor_score());
            record.last_position_update_time = Some(now);
        } else if let Some(fix) = cached.as_ref().and_then(|c| c.gps.clone()) {
            match self.validator.check_gps(fix.lat, fix.lon) {
                Ok(()) => {
                    let signal = cached.as_ref().and_then(|c| c.signal.as_ref());
                    record.position_known = true;
                    record.lat_lon_alt = [fix.lat, fix.lon, fix.alt];
                    // Contractual value; the TTN-reported source string stays
                    // internal to the cache.
                    record.position_source = Some("lora_gps".to_string());
                    record.position_accuracy = fix.accuracy.unwrap_or(0.0);
                    record.position_confidence = Some(self.scorer.lora_gps_score(
                        now - fix.timestamp,
                        fix.accuracy,
                        signal,
                    ));
                    record.last_position_update_time = Some(fix.timestamp);
                }
                Err(rejection) => failures.push(rejection.into_failure(Some(id), now)),
            }
        }

        if let Some(cached) = cached {
            if let Some(sensor) = cached.sensor {
                record.triage_status = sensor.triage_status.unwrap_or(0);
                if let Some(battery) = sensor.battery {
                    match self.validator.check_battery(battery) {
                        Ok(()) => record.battery = Some(battery),
                        Err(rejection) => failures.push(rejection.into_failure(Some(id), now)),
                    }
                }
                if let Some(temperature) = sensor.temperature {
                    match self.validator.check_temperature(temperature) {
                        Ok(()) => record.temperature = Some(temperature),
                        Err(rejection) => failures.push(rejection.into_failure(Some(id), now)),
                    }
                }
            }
            if let Some(signal) = cached.signal {
                record.rssi = signal.best_rssi;
                record.snr = signal.best_snr;
                record.frame_counter = signal.frame_counter;
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry_cache::TagUpdate;
    use crate::validator::ValidatorConfig;

    const T0: f64 = 1_700_000_000.0;

    fn engine(anchors: &[(u16, f64, f64)]) -> (FusionEngine, Arc<TelemetryCache>) {
        let cache = Arc::new(TelemetryCache::new());
        let anchors = anchors
            .iter()
            .map(|&(id, lat, lon)| (NodeId(id), Anchor { lat, lon, alt: 0.0 }))
            .collect();
        let engine = FusionEngine::new(
            anchors,
            Arc::clone(&cache),
            Arc::new(DataValidator::new(ValidatorConfig::default())),
            ConfidenceScorer::default(),
            FusionConfig::default(),
        );
        (engine, cache)
    }

    fn edge(a: u16, b: u16, d: f64) -> Edge {
        Edge {
            end0: NodeId(a),
            end1: NodeId(b),
            distance_m: d,
        }
    }

    fn find<'a>(doc: &'a NetworkDocument, id: u16) -> &'a NodeRecord {
        doc.uwbs.iter().find(|n| n.id == NodeId(id)).unwrap()
    }

    #[test]
    fn anchor_wins_over_cached_gps() {
        let (engine, cache) = engine(&[(0xB4D3, 51.5, -0.12)]);
        // Fresh cached GPS for the anchor node must not override the survey.
        cache.put_at(
            NodeId(0xB4D3),
            TagUpdate {
                gps: Some((10.0, 20.0, 0.0, Some(5.0), None)),
                ..TagUpdate::default()
            },
            T0,
        );

        let (doc, failures) = engine.build(&[edge(0xB4D3, 0xB98A, 5.0)], T0 + 1.0);
        let anchor = find(&doc, 0xB4D3);
        assert!(anchor.position_known);
        assert_eq!(anchor.position_source.as_deref(), Some("anchor"));
        assert_eq!(anchor.lat_lon_alt[0], 51.5);
        assert_eq!(anchor.position_confidence, Some(1.0));
        assert!(failures.is_empty());
    }

    #[test]
    fn tag_uses_cached_gps_with_confidence() {
        let (engine, cache) = engine(&[]);
        cache.put_at(
            NodeId(0xB98A),
            TagUpdate {
                gps: Some((53.48, -2.19, 30.0, Some(8.0), Some("SOURCE_GPS".into()))),
                ..TagUpdate::default()
            },
            T0,
        );

        let (doc, _) = engine.build(&[edge(0xB4D3, 0xB98A, 5.0)], T0 + 10.0);
        let tag = find(&doc, 0xB98A);
        assert!(tag.position_known);
        // Always the contractual value, never the network server's enum string.
        assert_eq!(tag.position_source.as_deref(), Some("lora_gps"));
        assert_eq!(tag.position_accuracy, 8.0);
        assert_eq!(tag.last_position_update_time, Some(T0));
        let confidence = tag.position_confidence.unwrap();
        assert!((0.3..=0.7).contains(&confidence));

        // The other endpoint has nothing cached: unknown position.
        let bare = find(&doc, 0xB4D3);
        assert!(!bare.position_known);
        assert!(bare.position_confidence.is_none());
    }

    #[test]
    fn stale_gps_leaves_position_unknown() {
        let (engine, cache) = engine(&[]);
        cache.put_at(
            NodeId(0xB98A),
            TagUpdate {
                gps: Some((53.48, -2.19, 0.0, None, None)),
                ..TagUpdate::default()
            },
            T0,
        );
        let (doc, failures) = engine.build(&[edge(0xB4D3, 0xB98A, 5.0)], T0 + 400.0);
        assert!(!find(&doc, 0xB98A).position_known);
        assert!(failures.is_empty());
    }

    #[test]
    fn invalid_gps_is_dropped_and_reported() {
        let (engine, cache) = engine(&[]);
        cache.put_at(
            NodeId(0xB98A),
            TagUpdate {
                gps: Some((0.0, 0.0, 0.0, None, None)),
                battery: Some(150.0),
                temperature: Some(22.0),
                ..TagUpdate::default()
            },
            T0,
        );
        let (doc, failures) = engine.build(&[edge(0xB4D3, 0xB98A, 5.0)], T0 + 1.0);
        let tag = find(&doc, 0xB98A);
        assert!(!tag.position_known);
        assert!(tag.battery.is_none());
        assert_eq!(tag.temperature, Some(22.0));
        let fields: Vec<_> = failures.iter().map(|f| f.field).collect();
        assert_eq!(fields, vec!["gps", "battery"]);
        assert_eq!(failures[0].node_id.as_deref(), Some("B98A"));
    }

    #[test]
    fn edges_attach_to_both_endpoints() {
        let (engine, _) = engine(&[]);
        let edges = [edge(1, 2, 3.0), edge(1, 3, 4.0), edge(2, 3, 5.0)];
        let (doc, _) = engine.build(&edges, T0);
        assert_eq!(doc.uwbs.len(), 3);
        for node in &doc.uwbs {
            assert_eq!(node.edges.len(), 2, "node {} edge count", node.id);
        }
    }

    #[test]
    fn only_edge_endpoints_are_published() {
        // Anchor 00A1 is configured but ranged with nobody this cycle.
        let (engine, _) = engine(&[(0x00A1, 1.0, 2.0)]);
        let (doc, _) = engine.build(&[edge(0x0001, 0x0002, 3.0)], T0);
        let ids: Vec<String> = doc.uwbs.iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["0001", "0002"]);

        let (doc, _) = engine.build(&[], T0);
        assert!(doc.uwbs.is_empty());
    }

    #[test]
    fn document_serializes_camel_case() {
        let (engine, cache) = engine(&[(0xB4D3, 51.5, -0.12)]);
        cache.put_at(
            NodeId(0xB4D3),
            TagUpdate {
                battery: Some(90.0),
                triage_status: Some(1),
                ..TagUpdate::default()
            },
            T0,
        );
        let (doc, _) = engine.build(&[edge(0xB4D3, 0xB98A, 5.0)], T0 + 1.0);
        let json = serde_json::to_value(&doc).unwrap();
        let node = &json["uwbs"][0];
        assert_eq!(node["id"], "B4D3");
        assert_eq!(node["positionKnown"], true);
        assert_eq!(node["positionSource"], "anchor");
        assert_eq!(node["latLonAlt"][0], 51.5);
        assert_eq!(node["battery"], 90.0);
        assert_eq!(node["triageStatus"], 1);
        // Absent optionals are omitted entirely.
        assert!(node.get("rssi").is_none());
        // ...but triage status and accuracy always appear, defaulted.
        let bare = &json["uwbs"][1];
        assert_eq!(bare["id"], "B98A");
        assert_eq!(bare["triageStatus"], 0);
        assert_eq!(bare["positionAccuracy"], 0.0);
    }
}
