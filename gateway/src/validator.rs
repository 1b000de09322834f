//! Sanity validation for distances, GPS fixes, and sensor readings.
//!
//! Validation is advisory: a failing field is dropped from the fused output
//! (and optionally reported on the failures topic) but never stops the
//! pipeline. Rejections are counted per reason for health/debug stats.

use std::sync::Mutex;

use serde::Serialize;

use uwb_proto::NodeId;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_distance_m: f64,
    pub max_distance_m: f64,
    pub min_battery_pct: f64,
    pub max_battery_pct: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    /// Reject the common (0,0) bogus fix. On by default.
    pub reject_zero_gps: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_distance_m: 0.0,
            max_distance_m: uwb_proto::MAX_DISTANCE_METERS,
            min_battery_pct: 0.0,
            max_battery_pct: 100.0,
            min_temperature_c: -40.0,
            max_temperature_c: 85.0,
            reject_zero_gps: true,
        }
    }
}

// ── Rejections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Distance,
    Gps,
    Battery,
    Temperature,
}

/// One rejected field, with enough context for the failures topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub field: &'static str,
    pub value: f64,
    pub detail: String,
}

/// Document published to the validation-failures topic when enabled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFailure {
    pub field: &'static str,
    pub value: f64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: f64,
}

impl Rejection {
    pub fn into_failure(self, node: Option<NodeId>, timestamp: f64) -> ValidationFailure {
        ValidationFailure {
            field: self.field,
            value: self.value,
            reason: self.detail,
            node_id: node.map(|n| n.to_string()),
            timestamp,
        }
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ValidationStats {
    pub total_validated: u64,
    pub distance_rejected: u64,
    pub gps_rejected: u64,
    pub battery_rejected: u64,
    pub temperature_rejected: u64,
}

impl ValidationStats {
    pub fn total_rejected(&self) -> u64 {
        self.distance_rejected + self.gps_rejected + self.battery_rejected + self.temperature_rejected
    }
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Stateless range predicates plus a locked rejection-counter block.
#[derive(Debug, Default)]
pub struct DataValidator {
    cfg: ValidatorConfig,
    stats: Mutex<ValidationStats>,
}

impl DataValidator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self {
            cfg,
            stats: Mutex::new(ValidationStats::default()),
        }
    }

    pub fn stats(&self) -> ValidationStats {
        *self.stats.lock().expect("validator stats lock poisoned")
    }

    fn count(&self, reason: Option<RejectReason>) {
        let mut stats = self.stats.lock().expect("validator stats lock poisoned");
        stats.total_validated += 1;
        match reason {
            Some(RejectReason::Distance) => stats.distance_rejected += 1,
            Some(RejectReason::Gps) => stats.gps_rejected += 1,
            Some(RejectReason::Battery) => stats.battery_rejected += 1,
            Some(RejectReason::Temperature) => stats.temperature_rejected += 1,
            None => {}
        }
    }

    pub fn check_distance(&self, distance_m: f64) -> Result<(), Rejection> {
        let ok = distance_m >= self.cfg.min_distance_m && distance_m <= self.cfg.max_distance_m;
        self.count((!ok).then_some(RejectReason::Distance));
        if ok {
            Ok(())
        } else {
            Err(Rejection {
                reason: RejectReason::Distance,
                field: "distance",
                value: distance_m,
                detail: format!(
                    "distance {distance_m:.3}m outside [{}, {}]",
                    self.cfg.min_distance_m, self.cfg.max_distance_m
                ),
            })
        }
    }

    pub fn check_gps(&self, lat: f64, lon: f64) -> Result<(), Rejection> {
        let rejection = if self.cfg.reject_zero_gps && lat == 0.0 && lon == 0.0 {
            Some("GPS coordinates are 0,0".to_string())
        } else if !(-90.0..=90.0).contains(&lat) {
            Some(format!("latitude {lat:.6} outside [-90, 90]"))
        } else if !(-180.0..=180.0).contains(&lon) {
            Some(format!("longitude {lon:.6} outside [-180, 180]"))
        } else {
            None
        };
        self.count(rejection.as_ref().map(|_| RejectReason::Gps));
        match rejection {
            None => Ok(()),
            Some(detail) => Err(Rejection {
                reason: RejectReason::Gps,
                field: "gps",
                value: lat,
                detail,
            }),
        }
    }

    pub fn check_battery(&self, battery_pct: f64) -> Result<(), Rejection> {
        let ok = battery_pct >= self.cfg.min_battery_pct && battery_pct <= self.cfg.max_battery_pct;
        self.count((!ok).then_some(RejectReason::Battery));
        if ok {
            Ok(())
        } else {
            Err(Rejection {
                reason: RejectReason::Battery,
                field: "battery",
                value: battery_pct,
                detail: format!(
                    "battery {battery_pct:.1}% outside [{}, {}]",
                    self.cfg.min_battery_pct, self.cfg.max_battery_pct
                ),
            })
        }
    }

    pub fn check_temperature(&self, temperature_c: f64) -> Result<(), Rejection> {
        let ok = temperature_c >= self.cfg.min_temperature_c
            && temperature_c <= self.cfg.max_temperature_c;
        self.count((!ok).then_some(RejectReason::Temperature));
        if ok {
            Ok(())
        } else {
            Err(Rejection {
                reason: RejectReason::Temperature,
                field: "temperature",
                value: temperature_c,
                detail: format!(
                    "temperature {temperature_c:.1}C outside [{}, {}]",
                    self.cfg.min_temperature_c, self.cfg.max_temperature_c
                ),
            })
        }
    }
}
