//! Command-line surface and config-file loading.
//!
//! Two optional JSON files feed the pipeline: the anchor config (surveyed
//! anchor positions plus an embedded dev-EUI mapping) and a standalone
//! dev-EUI mapping file that overrides embedded entries. A missing file
//! means the feature stays off; a present-but-malformed file is fatal at
//! startup rather than silently running without anchors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use uwb_proto::NodeId;

use crate::fusion::Anchor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkFormat {
    /// Bare edge list: `[["B4D3","B98A",5.0], ...]`
    Simple,
    /// Fused topology document with positions, confidence, and telemetry.
    Network,
}

#[derive(Debug, Parser)]
#[command(name = "uwb-gateway", version, about = "UWB ranging to MQTT gateway")]
pub struct Args {
    /// Serial device of the UWB bridge node
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub uart: String,

    #[arg(long, default_value_t = 115_200)]
    pub baud_rate: u32,

    // ── Publish broker ────────────────────────────────────────────────────
    #[arg(long, default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Base topic; health, command, and failure topics hang off it
    #[arg(long, default_value = "uwb/network")]
    pub mqtt_topic: String,

    /// Minimum seconds between topology publishes
    #[arg(long, default_value_t = 10.0)]
    pub mqtt_rate_limit: f64,

    #[arg(long)]
    pub mqtt_username: Option<String>,

    #[arg(long)]
    pub mqtt_password: Option<String>,

    /// Log payloads instead of publishing (dry run)
    #[arg(long)]
    pub disable_mqtt: bool,

    #[arg(long, value_enum, default_value_t = NetworkFormat::Simple)]
    pub network_format: NetworkFormat,

    /// Publish dropped-field reports on `<topic>/validation_failures`
    #[arg(long)]
    pub report_validation_failures: bool,

    // ── Anchors and dev-EUI mapping ───────────────────────────────────────
    /// JSON file with surveyed anchors and dev-EUI mapping
    #[arg(long)]
    pub anchor_config: Option<PathBuf>,

    /// JSON file mapping dev-EUIs to UWB node ids; overrides entries
    /// embedded in the anchor config
    #[arg(long)]
    pub dev_eui_mapping: Option<PathBuf>,

    // ── LoRa telemetry broker ─────────────────────────────────────────────
    #[arg(long)]
    pub enable_lora_cache: bool,

    #[arg(long, default_value = "localhost")]
    pub lora_broker: String,

    #[arg(long, default_value_t = 1883)]
    pub lora_port: u16,

    #[arg(long)]
    pub lora_username: Option<String>,

    #[arg(long)]
    pub lora_password: Option<String>,

    /// Subscription pattern on the LoRa network server
    #[arg(long, default_value = "#")]
    pub lora_topic: String,

    /// Max cached GPS age used during fusion, seconds
    #[arg(long, default_value_t = 300.0)]
    pub gps_max_age: f64,

    /// Max cached sensor-reading age used during fusion, seconds
    #[arg(long, default_value_t = 600.0)]
    pub sensor_max_age: f64,
}

// ── Config files ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnchorEntry {
    id: NodeId,
    lat: f64,
    lon: f64,
    #[serde(default)]
    alt: f64,
}

#[derive(Debug, Default, Deserialize)]
struct AnchorConfigFile {
    #[serde(default)]
    anchors: Vec<AnchorEntry>,
    #[serde(default)]
    dev_eui_to_uwb_id: HashMap<String, NodeId>,
}

/// Anchor positions and dev-EUI mapping after file loading and merging.
#[derive(Debug, Default)]
pub struct StaticConfig {
    pub anchors: HashMap<NodeId, Anchor>,
    pub dev_eui_map: HashMap<String, NodeId>,
}

fn parse_anchor_config(json: &str) -> anyhow::Result<StaticConfig> {
    let file: AnchorConfigFile = serde_json::from_str(json)?;
    let anchors = file
        .anchors
        .into_iter()
        .map(|a| {
            (
                a.id,
                Anchor {
                    lat: a.lat,
                    lon: a.lon,
                    alt: a.alt,
                },
            )
        })
        .collect();
    let dev_eui_map = file
        .dev_eui_to_uwb_id
        .into_iter()
        .map(|(eui, id)| (eui.to_uppercase(), id))
        .collect();
    Ok(StaticConfig {
        anchors,
        dev_eui_map,
    })
}

fn parse_dev_eui_mapping(json: &str) -> anyhow::Result<HashMap<String, NodeId>> {
    let map: HashMap<String, NodeId> = serde_json::from_str(json)?;
    Ok(map
        .into_iter()
        .map(|(eui, id)| (eui.to_uppercase(), id))
        .collect())
}

/// Load both optional config files. Paths that are `None` simply contribute
/// nothing; paths that exist but fail to parse abort startup.
pub fn load_static_config(
    anchor_path: Option<&Path>,
    dev_eui_path: Option<&Path>,
) -> anyhow::Result<StaticConfig> {
    let mut config = match anchor_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read anchor config {}", path.display()))?;
            parse_anchor_config(&json)
                .with_context(|| format!("invalid anchor config {}", path.display()))?
        }
        None => StaticConfig::default(),
    };

    if let Some(path) = dev_eui_path {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dev-EUI mapping {}", path.display()))?;
        let overrides = parse_dev_eui_mapping(&json)
            .with_context(|| format!("invalid dev-EUI mapping {}", path.display()))?;
        config.dev_eui_map.extend(overrides);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_config_parses_ids_and_uppercases_euis() {
        let config = parse_anchor_config(
            r#"{
                "anchors": [
                    {"id": "B4D3", "lat": 51.5, "lon": -0.12, "alt": 30.0},
                    {"id": "b98a", "lat": 53.48, "lon": -2.19}
                ],
                "dev_eui_to_uwb_id": {"f4ce36e6cd722e97": "B4F1"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.anchors.len(), 2);
        assert_eq!(config.anchors[&NodeId(0xB4D3)].alt, 30.0);
        // missing alt defaults to 0
        assert_eq!(config.anchors[&NodeId(0xB98A)].alt, 0.0);
        assert_eq!(config.dev_eui_map["F4CE36E6CD722E97"], NodeId(0xB4F1));
    }

    #[test]
    fn malformed_anchor_config_is_an_error() {
        assert!(parse_anchor_config("{ not json").is_err());
        assert!(parse_anchor_config(r#"{"anchors": [{"id": "ZZZZ", "lat": 0, "lon": 0}]}"#).is_err());
    }

    #[test]
    fn empty_anchor_config_is_valid() {
        let config = parse_anchor_config("{}").unwrap();
        assert!(config.anchors.is_empty());
        assert!(config.dev_eui_map.is_empty());
    }

    #[test]
    fn dev_eui_mapping_file_overrides_embedded() {
        let mut config = parse_anchor_config(
            r#"{"dev_eui_to_uwb_id": {"AA00": "0001", "BB00": "0002"}}"#,
        )
        .unwrap();
        let overrides = parse_dev_eui_mapping(r#"{"aa00": "0009"}"#).unwrap();
        config.dev_eui_map.extend(overrides);
        assert_eq!(config.dev_eui_map["AA00"], NodeId(9));
        assert_eq!(config.dev_eui_map["BB00"], NodeId(2));
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["uwb-gateway"]).unwrap();
        assert_eq!(args.uart, "/dev/ttyUSB0");
        assert_eq!(args.mqtt_rate_limit, 10.0);
        assert_eq!(args.network_format, NetworkFormat::Simple);
        assert_eq!(args.lora_topic, "#");
        assert!(!args.enable_lora_cache);
    }

    #[test]
    fn args_accept_full_surface() {
        let args = Args::try_parse_from([
            "uwb-gateway",
            "--uart", "/dev/ttyACM0",
            "--mqtt-broker", "broker.local",
            "--mqtt-topic", "site7/uwb",
            "--network-format", "network",
            "--enable-lora-cache",
            "--lora-broker", "eu1.cloud.thethings.network",
            "--lora-username", "app@ttn",
            "--lora-password", "NNSXS.secret",
            "--report-validation-failures",
            "--gps-max-age", "120",
        ])
        .unwrap();
        assert_eq!(args.network_format, NetworkFormat::Network);
        assert!(args.enable_lora_cache);
        assert_eq!(args.gps_max_age, 120.0);
    }
}
