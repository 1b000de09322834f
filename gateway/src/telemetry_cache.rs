//! Time-bounded cache of LoRa tag telemetry.
//!
//! ## Architecture
//! A background task subscribes to the LoRa network server's MQTT uplink
//! stream and writes into the cache; the fusion engine reads from it with
//! per-sub-record staleness bounds; a second background task evicts entries
//! that have gone quiet for longer than the retention TTL. All mutation and
//! iteration happens under one mutex, and reads are copy-out — a caller never
//! holds a reference into a live entry.
//!
//! GPS and sensor sub-records age independently: a stale GPS fix does not
//! hide a fresh battery reading, and vice versa. Reads *filter* stale
//! sub-records; only eviction *deletes*.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tracing::{debug, info, warn};

use uwb_proto::NodeId;

use crate::health::{unix_now, HealthMonitor};

// ── Ingestion-time field synonyms ─────────────────────────────────────────────

/// Ordered synonym keys for the battery field in decoded uplink payloads.
/// Checked in declaration order; the first present key wins.
const BATTERY_KEYS: &[&str] = &["battery", "battery_percentage", "battery_level", "bat"];

/// Ordered synonym keys for the triage status field.
const TRIAGE_KEYS: &[&str] = &["triage_status", "triage", "status"];

const TEMPERATURE_KEYS: &[&str] = &["temperature", "temp"];

/// Location-source priority within the uplink's `locations` map:
/// payload-embedded fix first, then user-supplied, then generic GPS, then
/// whatever location-shaped field remains.
const LOCATION_PRIORITY: &[&str] = &["frm-payload", "user", "gps"];

// ── Cached records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub accuracy: Option<f64>,
    pub source: Option<String>,
    /// Unix seconds at ingestion.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub battery: Option<f64>,
    pub temperature: Option<f64>,
    pub triage_status: Option<i64>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalQuality {
    pub gateway_count: u32,
    pub best_rssi: Option<f64>,
    pub best_snr: Option<f64>,
    pub frame_counter: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct TagEntry {
    gps: Option<GpsFix>,
    sensor: Option<SensorReading>,
    signal: Option<SignalQuality>,
    last_update: f64,
}

/// Copy-out view returned by [`TelemetryCache::get`]. Sub-records that were
/// too old for the caller's bounds are omitted.
#[derive(Debug, Clone, Default)]
pub struct TagSnapshot {
    pub gps: Option<GpsFix>,
    pub sensor: Option<SensorReading>,
    pub signal: Option<SignalQuality>,
}

/// Partial update extracted from one uplink message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagUpdate {
    pub gps: Option<(f64, f64, f64, Option<f64>, Option<String>)>,
    pub battery: Option<f64>,
    pub temperature: Option<f64>,
    pub triage_status: Option<i64>,
    pub signal: Option<SignalQuality>,
}

impl TagUpdate {
    pub fn is_empty(&self) -> bool {
        self.gps.is_none()
            && self.battery.is_none()
            && self.temperature.is_none()
            && self.triage_status.is_none()
            && self.signal.is_none()
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Seconds between eviction sweeps.
    pub eviction_period_s: f64,
    /// Entries untouched for longer than this are removed entirely.
    /// Much larger than the read-time staleness bounds by design intent.
    pub retention_ttl_s: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_period_s: 60.0,
            retention_ttl_s: 3600.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct TelemetryCache {
    entries: Mutex<HashMap<NodeId, TagEntry>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a partial update into the node's entry, stamping the updated
    /// sub-records with `now`.
    pub fn put_at(&self, node: NodeId, update: TagUpdate, now: f64) {
        let mut entries = self.entries.lock().expect("telemetry cache lock poisoned");
        let entry = entries.entry(node).or_default();

        if let Some((lat, lon, alt, accuracy, source)) = update.gps {
            entry.gps = Some(GpsFix {
                lat,
                lon,
                alt,
                accuracy,
                source,
                timestamp: now,
            });
        }
        if update.battery.is_some() || update.temperature.is_some() || update.triage_status.is_some()
        {
            let mut sensor = entry.sensor.clone().unwrap_or_default();
            if update.battery.is_some() {
                sensor.battery = update.battery;
            }
            if update.temperature.is_some() {
                sensor.temperature = update.temperature;
            }
            if update.triage_status.is_some() {
                sensor.triage_status = update.triage_status;
            }
            sensor.timestamp = now;
            entry.sensor = Some(sensor);
        }
        if update.signal.is_some() {
            entry.signal = update.signal;
        }
        entry.last_update = now;
    }

    pub fn put(&self, node: NodeId, update: TagUpdate) {
        self.put_at(node, update, unix_now());
    }

    /// Snapshot the node's telemetry, omitting sub-records older than the
    /// supplied bounds. Stale sub-records stay in the cache — deletion is
    /// eviction's job.
    pub fn get_at(
        &self,
        node: NodeId,
        gps_max_age_s: f64,
        sensor_max_age_s: f64,
        now: f64,
    ) -> Option<TagSnapshot> {
        let entries = self.entries.lock().expect("telemetry cache lock poisoned");
        let entry = entries.get(&node)?;
        Some(TagSnapshot {
            gps: entry
                .gps
                .clone()
                .filter(|g| now - g.timestamp <= gps_max_age_s),
            sensor: entry
                .sensor
                .clone()
                .filter(|s| now - s.timestamp <= sensor_max_age_s),
            signal: entry.signal.clone(),
        })
    }

    pub fn get(&self, node: NodeId, gps_max_age_s: f64, sensor_max_age_s: f64) -> Option<TagSnapshot> {
        self.get_at(node, gps_max_age_s, sensor_max_age_s, unix_now())
    }

    /// Remove entries whose sub-records have all aged beyond the retention
    /// TTL. Returns the number of evicted entries.
    pub fn evict_at(&self, retention_ttl_s: f64, now: f64) -> usize {
        let mut entries = self.entries.lock().expect("telemetry cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| {
            let gps_fresh = e.gps.as_ref().is_some_and(|g| now - g.timestamp <= retention_ttl_s);
            let sensor_fresh = e
                .sensor
                .as_ref()
                .is_some_and(|s| now - s.timestamp <= retention_ttl_s);
            // last_update keeps signal-only entries alive until they go quiet
            gps_fresh || sensor_fresh || now - e.last_update <= retention_ttl_s
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("telemetry cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Uplink ingestion ──────────────────────────────────────────────────────────

fn first_number(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_f64))
}

fn first_integer(obj: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = obj.get(*k)?;
        v.as_i64().or_else(|| v.as_str()?.parse().ok())
    })
}

fn location_from(loc: &Value) -> Option<(f64, f64, f64, Option<f64>, Option<String>)> {
    let lat = loc.get("latitude")?.as_f64()?;
    let lon = loc.get("longitude")?.as_f64()?;
    let alt = loc.get("altitude").and_then(Value::as_f64).unwrap_or(0.0);
    let accuracy = loc.get("accuracy").and_then(Value::as_f64);
    let source = loc.get("source").and_then(Value::as_str).map(str::to_owned);
    Some((lat, lon, alt, accuracy, source))
}

/// Parse a network-server uplink message into `(dev_eui, update)`.
///
/// Tolerant by design: missing sections simply produce an emptier update.
/// Field-name normalization (battery/triage synonyms, location-source
/// priority) happens here, once, so the stored schema stays canonical.
pub fn parse_uplink(payload: &[u8]) -> Option<(String, TagUpdate)> {
    let msg: Value = serde_json::from_slice(payload).ok()?;
    let dev_eui = msg
        .pointer("/end_device_ids/dev_eui")?
        .as_str()?
        .to_uppercase();
    if dev_eui.is_empty() {
        return None;
    }

    let uplink = msg.get("uplink_message").cloned().unwrap_or(Value::Null);
    let mut update = TagUpdate::default();

    if let Some(decoded) = uplink.get("decoded_payload") {
        update.battery = first_number(decoded, BATTERY_KEYS);
        update.temperature = first_number(decoded, TEMPERATURE_KEYS);
        update.triage_status = first_integer(decoded, TRIAGE_KEYS);
    }

    if let Some(locations) = uplink.get("locations").and_then(Value::as_object) {
        let prioritized = LOCATION_PRIORITY
            .iter()
            .filter_map(|k| locations.get(*k))
            .chain(locations.values())
            .find_map(location_from);
        update.gps = prioritized;
    }

    if let Some(rx) = uplink.get("rx_metadata").and_then(Value::as_array) {
        if !rx.is_empty() {
            let mut quality = SignalQuality {
                gateway_count: rx.len() as u32,
                frame_counter: uplink.get("f_cnt").and_then(Value::as_u64),
                ..SignalQuality::default()
            };
            for gw in rx {
                if let Some(rssi) = gw.get("rssi").and_then(Value::as_f64) {
                    quality.best_rssi = Some(quality.best_rssi.map_or(rssi, |b: f64| b.max(rssi)));
                }
                if let Some(snr) = gw.get("snr").and_then(Value::as_f64) {
                    quality.best_snr = Some(quality.best_snr.map_or(snr, |b: f64| b.max(snr)));
                }
            }
            update.signal = Some(quality);
        }
    }

    Some((dev_eui, update))
}

// ── Background tasks ──────────────────────────────────────────────────────────

pub struct TelemetryBrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
}

/// Subscribe to the LoRa network server and feed the cache. Runs until the
/// process shuts down; broker errors are logged and retried, never fatal.
pub async fn run_subscriber(
    cfg: TelemetryBrokerConfig,
    cache: Arc<TelemetryCache>,
    dev_eui_map: Arc<HashMap<String, NodeId>>,
    health: Arc<HealthMonitor>,
) {
    let mut options = MqttOptions::new("uwb-gateway-telemetry", &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    info!("📶 Telemetry subscriber connecting to {}:{}", cfg.host, cfg.port);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                health.set_telemetry_broker(true);
                info!("Telemetry broker connected, subscribing to '{}'", cfg.topic);
                if let Err(e) = client.subscribe(&cfg.topic, QoS::AtMostOnce).await {
                    warn!("Telemetry subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some((dev_eui, update)) = parse_uplink(&publish.payload) else {
                    debug!("Uplink on '{}' had no usable dev_eui", publish.topic);
                    continue;
                };
                if update.is_empty() {
                    continue;
                }
                match dev_eui_map.get(&dev_eui) {
                    Some(&node) => {
                        debug!("Cached telemetry for dev_eui={dev_eui} → {node}");
                        cache.put(node, update);
                    }
                    None => debug!("No UWB mapping for dev_eui={dev_eui}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                health.set_telemetry_broker(false);
                warn!("Telemetry broker error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Periodic eviction sweep bounding cache memory for long deployments.
pub async fn run_eviction(cfg: CacheConfig, cache: Arc<TelemetryCache>) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(cfg.eviction_period_s));
    loop {
        ticker.tick().await;
        let evicted = cache.evict_at(cfg.retention_ttl_s, unix_now());
        if evicted > 0 {
            debug!("Evicted {evicted} stale telemetry entries ({} remain)", cache.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1_700_000_000.0;

    fn gps_update(lat: f64, lon: f64) -> TagUpdate {
        TagUpdate {
            gps: Some((lat, lon, 12.0, Some(8.0), Some("gps".into()))),
            ..TagUpdate::default()
        }
    }

    #[test]
    fn staleness_bounds_filter_sub_records_independently() {
        let cache = TelemetryCache::new();
        let node = NodeId(0x8FA4);
        cache.put_at(node, gps_update(51.5, -0.1), T0);
        cache.put_at(
            node,
            TagUpdate { battery: Some(80.0), ..TagUpdate::default() },
            T0 + 350.0,
        );

        // GPS is 400s old: excluded at gpsMaxAge=300; sensor (50s) included.
        let snap = cache.get_at(node, 300.0, 600.0, T0 + 400.0).unwrap();
        assert!(snap.gps.is_none());
        assert_eq!(snap.sensor.unwrap().battery, Some(80.0));

        // At 200s of GPS age the fix is included.
        let snap = cache.get_at(node, 300.0, 600.0, T0 + 200.0).unwrap();
        assert_eq!(snap.gps.unwrap().lat, 51.5);
    }

    #[test]
    fn expired_read_does_not_delete() {
        let cache = TelemetryCache::new();
        let node = NodeId(1);
        cache.put_at(node, gps_update(10.0, 20.0), T0);
        assert!(cache.get_at(node, 1.0, 1.0, T0 + 100.0).unwrap().gps.is_none());
        // Entry still present; a generous bound sees it again.
        assert!(cache.get_at(node, 200.0, 200.0, T0 + 100.0).unwrap().gps.is_some());
    }

    #[test]
    fn eviction_removes_long_quiet_entries() {
        let cache = TelemetryCache::new();
        let old = NodeId(1);
        let fresh = NodeId(2);
        cache.put_at(old, gps_update(1.0, 2.0), T0);
        cache.put_at(fresh, gps_update(3.0, 4.0), T0 + 3900.0);

        let evicted = cache.evict_at(3600.0, T0 + 4000.0);
        assert_eq!(evicted, 1);
        assert!(cache.get_at(old, f64::MAX, f64::MAX, T0 + 4000.0).is_none());
        assert!(cache.get_at(fresh, f64::MAX, f64::MAX, T0 + 4000.0).is_some());
    }

    #[test]
    fn sensor_merge_is_partial() {
        let cache = TelemetryCache::new();
        let node = NodeId(7);
        cache.put_at(
            node,
            TagUpdate {
                battery: Some(90.0),
                temperature: Some(21.0),
                ..TagUpdate::default()
            },
            T0,
        );
        cache.put_at(
            node,
            TagUpdate { battery: Some(85.0), ..TagUpdate::default() },
            T0 + 10.0,
        );
        let sensor = cache
            .get_at(node, 60.0, 60.0, T0 + 11.0)
            .unwrap()
            .sensor
            .unwrap();
        assert_eq!(sensor.battery, Some(85.0));
        assert_eq!(sensor.temperature, Some(21.0));
        assert_eq!(sensor.timestamp, T0 + 10.0);
    }

    fn ttn_uplink(decoded: Value, locations: Value) -> Vec<u8> {
        serde_json::json!({
            "end_device_ids": { "dev_eui": "f4ce36e6cd722e97", "device_id": "tag-1" },
            "uplink_message": {
                "f_cnt": 42,
                "decoded_payload": decoded,
                "locations": locations,
                "rx_metadata": [
                    { "gateway_ids": { "gateway_id": "gw1" }, "rssi": -92, "snr": 4.5 },
                    { "gateway_ids": { "gateway_id": "gw2" }, "rssi": -78, "snr": 7.25 }
                ]
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn uplink_parsing_normalizes_synonyms() {
        let payload = ttn_uplink(
            serde_json::json!({ "battery_percentage": 76, "temp": 18.5, "triage": "2" }),
            serde_json::json!({}),
        );
        let (dev_eui, update) = parse_uplink(&payload).unwrap();
        assert_eq!(dev_eui, "F4CE36E6CD722E97");
        assert_eq!(update.battery, Some(76.0));
        assert_eq!(update.temperature, Some(18.5));
        assert_eq!(update.triage_status, Some(2));
        let signal = update.signal.unwrap();
        assert_eq!(signal.gateway_count, 2);
        assert_eq!(signal.best_rssi, Some(-78.0));
        assert_eq!(signal.best_snr, Some(7.25));
        assert_eq!(signal.frame_counter, Some(42));
    }

    #[test]
    fn location_priority_prefers_payload_fix() {
        let payload = ttn_uplink(
            serde_json::json!({}),
            serde_json::json!({
                "user": { "latitude": 1.0, "longitude": 1.0 },
                "frm-payload": { "latitude": 53.48, "longitude": -2.19, "accuracy": 15 }
            }),
        );
        let (_, update) = parse_uplink(&payload).unwrap();
        let (lat, lon, _, accuracy, _) = update.gps.unwrap();
        assert_eq!((lat, lon), (53.48, -2.19));
        assert_eq!(accuracy, Some(15.0));
    }

    #[test]
    fn location_falls_back_to_any_available_field() {
        let payload = ttn_uplink(
            serde_json::json!({}),
            serde_json::json!({
                "solver-x": { "latitude": 40.0, "longitude": -3.0 }
            }),
        );
        let (_, update) = parse_uplink(&payload).unwrap();
        assert_eq!(update.gps.unwrap().0, 40.0);
    }

    #[test]
    fn uplink_without_dev_eui_is_dropped() {
        assert!(parse_uplink(b"{\"uplink_message\":{}}").is_none());
        assert!(parse_uplink(b"not json").is_none());
    }
}
