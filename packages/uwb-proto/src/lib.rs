//! # uwb-proto
//!
//! Wire protocol for the UWB bridge node's proprietary ranging stream.
//!
//! These types are used by:
//! - `uwb-gateway`: framing and decoding the serial byte stream
//! - test harnesses: synthesizing well-formed and corrupted packets
//!
//! ## Wire format
//!
//! Every frame is `[0xDC 0xAC][len:u16-LE][payload:len bytes]`. A ranging
//! payload starts with a fixed 8-byte header (see [`ranging::RangingHeader`]),
//! followed by the three group member lists as `u16-LE` node ids, followed —
//! for Final records only — by `u16-LE` time-of-flight distance values.
//!
//! ## Invariants
//! - Framing never panics and never fails fatally: a bad sentinel or an
//!   implausible length discards one byte and rescans (resynchronization).
//! - Final records are self-contained: group counts always come from the
//!   record being decoded, never from an earlier Assignment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod frame;
pub mod ranging;

pub use frame::{Frame, FrameDecoder};
pub use ranging::{ActType, DecodeError, RangingRecord};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Two-byte frame sentinel sent by the bridge node before every packet.
pub const FRAME_SENTINEL: [u8; 2] = [0xDC, 0xAC];

/// Linear scale from device-native TWR units to meters.
pub const TWR_TO_METERS: f64 = 0.004690384;

/// Distances at or beyond this are treated as TWR noise and dropped.
pub const MAX_DISTANCE_METERS: f64 = 300.0;

/// Declared payload lengths beyond this mark a false sentinel match.
pub const MAX_FRAME_PAYLOAD: usize = 2048;

/// Command written to the device to (re)start the ranging stream.
pub const START_RANGING_CMD: [u8; 5] = [0xDC, 0xAC, 0x01, 0x00, b's'];

/// A raw TWR value is plausible iff it is non-zero (zero = no measurement)
/// and converts to a distance below [`MAX_DISTANCE_METERS`].
pub fn twr_value_ok(value: u16) -> bool {
    value > 0 && (value as f64) * TWR_TO_METERS < MAX_DISTANCE_METERS
}

// ── Node identifier ───────────────────────────────────────────────────────────

/// 16-bit UWB node identifier. Rendered everywhere (logs, JSON, config files)
/// as a 4-hex-digit uppercase string, e.g. `"B4D3"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u16);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s, 16).map(NodeId)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid hex node id: {s:?}")))
    }
}

// ── Topology edge ─────────────────────────────────────────────────────────────

/// One measured pairwise distance. Produced per Final ranging record and
/// discarded after publishing — edges carry no cross-cycle identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Edge {
    pub end0: NodeId,
    pub end1: NodeId,
    /// Measured distance in meters (already scaled from TWR units).
    #[serde(rename = "distance")]
    pub distance_m: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId(0xB4D3);
        assert_eq!(id.to_string(), "B4D3");
        assert_eq!("B4D3".parse::<NodeId>().unwrap(), id);
        // lowercase input is accepted, output stays uppercase
        assert_eq!("b4d3".parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn node_id_serde_as_string() {
        let json = serde_json::to_string(&NodeId(0x00AF)).unwrap();
        assert_eq!(json, "\"00AF\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(0x00AF));
        assert!(serde_json::from_str::<NodeId>("\"XYZ\"").is_err());
    }

    #[test]
    fn twr_plausibility_bounds() {
        assert!(!twr_value_ok(0));
        assert!(twr_value_ok(1));
        assert!(twr_value_ok(1066));
        // 65535 * 0.004690384 ≈ 307 m, beyond the plausible range
        assert!(!twr_value_ok(u16::MAX));
    }

    #[test]
    fn edge_serializes_with_distance_key() {
        let edge = Edge {
            end0: NodeId(0xB4D3),
            end1: NodeId(0xB98A),
            distance_m: 5.0,
        };
        let v = serde_json::to_value(edge).unwrap();
        assert_eq!(v["end0"], "B4D3");
        assert_eq!(v["end1"], "B98A");
        assert_eq!(v["distance"], 5.0);
    }
}
