//! Position confidence scoring.
//!
//! Anchors carry a fixed configured confidence. LoRa GPS fixes start from a
//! base value, decay with age relative to the GPS TTL, and pick up banded
//! bonuses/penalties from fix accuracy, gateway diversity, and RSSI/SNR.
//! The result is always clamped to `[min, base]` no matter how extreme the
//! inputs are.

use crate::telemetry_cache::SignalQuality;

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub anchor_confidence: f64,
    pub base_confidence: f64,
    pub min_confidence: f64,
    /// Confidence lost per full TTL period of age.
    pub decay_rate: f64,
    pub accuracy_weight: f64,
    pub gateway_weight: f64,
    pub rssi_weight: f64,
    /// TTL the age decay is normalized against, in seconds.
    pub gps_ttl_s: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            anchor_confidence: 1.0,
            base_confidence: 0.7,
            min_confidence: 0.3,
            decay_rate: 0.1,
            accuracy_weight: 0.2,
            gateway_weight: 0.1,
            rssi_weight: 0.1,
            gps_ttl_s: 300.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    cfg: ScorerConfig,
}

impl ConfidenceScorer {
    pub fn new(cfg: ScorerConfig) -> Self {
        Self { cfg }
    }

    /// Confidence for a statically surveyed anchor, independent of age.
    pub fn anchor_score(&self) -> f64 {
        self.cfg.anchor_confidence
    }

    /// Confidence for a LoRa GPS fix of the given age.
    ///
    /// `accuracy` is the reported fix accuracy in meters (lower is better);
    /// `quality` carries gateway count and best RSSI/SNR across gateways.
    pub fn lora_gps_score(
        &self,
        age_s: f64,
        accuracy: Option<f64>,
        quality: Option<&SignalQuality>,
    ) -> f64 {
        let cfg = &self.cfg;
        let mut confidence = cfg.base_confidence;

        // Age decay, proportional to how much of the TTL has elapsed.
        let ttl_ratio = if cfg.gps_ttl_s > 0.0 {
            age_s.max(0.0) / cfg.gps_ttl_s
        } else {
            1.0
        };
        confidence -= cfg.decay_rate * ttl_ratio;

        if let Some(accuracy) = accuracy {
            confidence += if accuracy <= 10.0 {
                cfg.accuracy_weight * 0.5
            } else if accuracy <= 50.0 {
                cfg.accuracy_weight * 0.2
            } else if accuracy <= 100.0 {
                0.0
            } else {
                -cfg.accuracy_weight * 0.3
            };
        }

        if let Some(q) = quality {
            confidence += if q.gateway_count >= 3 {
                cfg.gateway_weight * 0.5
            } else if q.gateway_count >= 2 {
                cfg.gateway_weight * 0.2
            } else {
                0.0
            };

            if let Some(rssi) = q.best_rssi {
                confidence += if rssi >= -80.0 {
                    cfg.rssi_weight * 0.3
                } else if rssi >= -100.0 {
                    0.0
                } else {
                    -cfg.rssi_weight * 0.2
                };
            }
            if let Some(snr) = q.best_snr {
                confidence += if snr >= 5.0 {
                    cfg.rssi_weight * 0.2
                } else if snr >= 0.0 {
                    0.0
                } else {
                    -cfg.rssi_weight * 0.1
                };
            }
        }

        let clamped = confidence.clamp(cfg.min_confidence, cfg.base_confidence);
        (clamped * 1000.0).round() / 1000.0
    }
}
