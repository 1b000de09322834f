//! Gateway health aggregation.
//!
//! A single locked metrics block fed by every pipeline stage: packet and
//! publish counters, error counters, connection flags. Snapshots derive an
//! overall status from failure rates and connectivity and are published
//! periodically on the health topic.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const DEGRADED_FAILURE_RATE: f64 = 0.2;
const UNHEALTHY_FAILURE_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Default)]
struct Metrics {
    packets_total: u64,
    packets_ok: u64,
    parsing_errors: u64,
    connection_errors: u64,
    device_resets: u64,
    publishes_ok: u64,
    publishes_failed: u64,
    serial_connected: bool,
    publish_broker_connected: bool,
    telemetry_broker_connected: bool,
    telemetry_broker_enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub serial: bool,
    pub publish_broker: bool,
    /// Absent when the LoRa cache is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_broker: Option<bool>,
}

/// JSON document published on `<topic>/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub timestamp: String,
    pub uptime_seconds: f64,
    pub packets_total: u64,
    pub packets_ok: u64,
    pub packet_failure_rate: f64,
    pub parsing_errors: u64,
    pub connection_errors: u64,
    pub device_resets: u64,
    pub publishes_ok: u64,
    pub publishes_failed: u64,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug)]
pub struct HealthMonitor {
    started_at: f64,
    metrics: Mutex<Metrics>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::started_at(unix_now())
    }

    pub fn started_at(start: f64) -> Self {
        Self {
            started_at: start,
            metrics: Mutex::new(Metrics::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Metrics) -> R) -> R {
        f(&mut self.metrics.lock().expect("health metrics lock poisoned"))
    }

    /// One frame fully decoded (or not).
    pub fn record_packet(&self, ok: bool) {
        self.with(|m| {
            m.packets_total += 1;
            if ok {
                m.packets_ok += 1;
            }
        });
    }

    pub fn record_parsing_error(&self) {
        self.with(|m| m.parsing_errors += 1);
    }

    pub fn record_connection_error(&self) {
        self.with(|m| m.connection_errors += 1);
    }

    pub fn record_device_reset(&self) {
        self.with(|m| m.device_resets += 1);
    }

    pub fn record_publish(&self, ok: bool) {
        self.with(|m| {
            if ok {
                m.publishes_ok += 1;
            } else {
                m.publishes_failed += 1;
            }
        });
    }

    pub fn set_serial(&self, connected: bool) {
        self.with(|m| m.serial_connected = connected);
    }

    pub fn set_publish_broker(&self, connected: bool) {
        self.with(|m| m.publish_broker_connected = connected);
    }

    pub fn set_telemetry_broker(&self, connected: bool) {
        self.with(|m| {
            m.telemetry_broker_enabled = true;
            m.telemetry_broker_connected = connected;
        });
    }

    pub fn snapshot(&self, now: f64) -> HealthSnapshot {
        let m = self.with(|m| *m);
        let failure_rate = if m.packets_total > 0 {
            (m.packets_total - m.packets_ok) as f64 / m.packets_total as f64
        } else {
            0.0
        };

        let connections_ok = m.serial_connected
            && m.publish_broker_connected
            && (!m.telemetry_broker_enabled || m.telemetry_broker_connected);
        let status = if !connections_ok || failure_rate >= UNHEALTHY_FAILURE_RATE {
            HealthStatus::Unhealthy
        } else if failure_rate >= DEGRADED_FAILURE_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            timestamp: chrono::DateTime::from_timestamp(now as i64, 0)
                .unwrap_or_default()
                .to_rfc3339(),
            uptime_seconds: (now - self.started_at).max(0.0),
            packets_total: m.packets_total,
            packets_ok: m.packets_ok,
            packet_failure_rate: (failure_rate * 1000.0).round() / 1000.0,
            parsing_errors: m.parsing_errors,
            connection_errors: m.connection_errors,
            device_resets: m.device_resets,
            publishes_ok: m.publishes_ok,
            publishes_failed: m.publishes_failed,
            connection_status: ConnectionStatus {
                serial: m.serial_connected,
                publish_broker: m.publish_broker_connected,
                telemetry_broker: m
                    .telemetry_broker_enabled
                    .then_some(m.telemetry_broker_connected),
            },
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish a health snapshot every `period`.
pub async fn run_reporter(
    period: Duration,
    health: Arc<HealthMonitor>,
    publisher: Arc<crate::mqtt::Publisher>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // skip the immediate first tick
    loop {
        ticker.tick().await;
        let snapshot = health.snapshot(unix_now());
        if snapshot.status != HealthStatus::Healthy {
            warn!("Gateway health: {:?}", snapshot.status);
        }
        if let Err(e) = publisher.publish_health(&snapshot).await {
            warn!("Health publish failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_monitor() -> HealthMonitor {
        let h = HealthMonitor::started_at(1_700_000_000.0);
        h.set_serial(true);
        h.set_publish_broker(true);
        h
    }

    #[test]
    fn all_good_is_healthy() {
        let h = connected_monitor();
        for _ in 0..10 {
            h.record_packet(true);
        }
        let snap = h.snapshot(1_700_000_060.0);
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.uptime_seconds, 60.0);
        assert_eq!(snap.packets_ok, 10);
    }

    #[test]
    fn failure_rate_degrades_then_fails() {
        let h = connected_monitor();
        for i in 0..10 {
            h.record_packet(i >= 3);
        }
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Degraded);

        for _ in 0..10 {
            h.record_packet(false);
        }
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn lost_connection_is_unhealthy_regardless_of_rates() {
        let h = connected_monitor();
        h.record_packet(true);
        h.set_serial(false);
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn telemetry_broker_only_counts_when_enabled() {
        let h = connected_monitor();
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Healthy);
        let json = serde_json::to_value(h.snapshot(0.0)).unwrap();
        assert!(json["connectionStatus"].get("telemetryBroker").is_none());

        h.set_telemetry_broker(false);
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Unhealthy);
        h.set_telemetry_broker(true);
        assert_eq!(h.snapshot(0.0).status, HealthStatus::Healthy);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let h = connected_monitor();
        h.record_packet(true);
        h.record_device_reset();
        let json = serde_json::to_value(h.snapshot(1_700_000_030.0)).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["packetsTotal"], 1);
        assert_eq!(json["deviceResets"], 1);
        assert_eq!(json["connectionStatus"]["serial"], true);
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-"));
    }
}
