//! Ranging payload decoding: group assignment and Final distance records.
//!
//! Payload layout (all little-endian):
//!
//! ```text
//! [actType:u8][slot:i8][timeframe:u16][txPower:u8][mode:u8][g1:u8][g2:u8][g3:u8]
//! [g1+g2+g3 × nodeId:u16]
//! [tof × distance:u16]        -- Final records only
//! ```
//!
//! The expected distance count is derived from the group counts *of this
//! payload* — group membership can change between cycles, so cached counts
//! from an earlier packet must never be used.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::{twr_value_ok, Edge, Frame, NodeId, TWR_TO_METERS};

/// Header size shared by Assignment and Final records.
pub const HEADER_LEN: usize = 8;

/// Mode bit 0: Group A ranges internally (unordered intra-group pairs).
pub const MODE_GROUP_A_INTERNAL: u8 = 0x01;
/// Mode bit 1: Group B ranges internally.
pub const MODE_GROUP_B_INTERNAL: u8 = 0x02;

// ── Errors ────────────────────────────────────────────────────────────────────

/// A payload that does not decode as a ranging record. Always recoverable:
/// the record is dropped, the parsing-error counter ticks, and decoding
/// resumes at the next frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short for ranging header ({0} bytes)")]
    TruncatedHeader(usize),
    #[error("unknown act type {0:#04x}")]
    UnknownActType(u8),
    #[error("payload length {actual} does not match expected {expected} bytes")]
    LengthMismatch { expected: usize, actual: usize },
}

// ── Wire header ───────────────────────────────────────────────────────────────

/// Fixed 8-byte record header, matching the bridge node's C struct layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RangingHeader {
    pub act_type: u8,
    pub slot: i8,
    pub timeframe: [u8; 2],
    pub tx_power: u8,
    pub mode: u8,
    pub g1: u8,
    pub g2: u8,
    pub g3: u8,
}

impl RangingHeader {
    pub fn timeframe(&self) -> u16 {
        u16::from_le_bytes(self.timeframe)
    }
}

/// Record kind carried in `act_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActType {
    /// Group membership announcement; carries no distances.
    Assignment = 2,
    /// Completed ranging cycle; carries the full distance array.
    Final = 4,
}

impl ActType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            2 => Some(Self::Assignment),
            4 => Some(Self::Final),
            _ => None,
        }
    }
}

// ── Decoded record ────────────────────────────────────────────────────────────

/// One decoded ranging record. Constructed per frame, consumed for its
/// edges/groups, then dropped — there is no cross-frame identity.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingRecord {
    pub act_type: ActType,
    pub slot: i8,
    pub timeframe: u16,
    pub tx_power: u8,
    pub mode: u8,
    /// Group member lists A/B/C, in wire order. Empty groups are valid.
    pub groups: [Vec<NodeId>; 3],
    /// Raw TWR distance values (Final records only, zipped against
    /// [`RangingRecord::edges`] pair order).
    pub distances: Vec<u16>,
}

/// Number of distance slots a Final record carries for the given group
/// counts: all cross-group pairs, plus intra-A / intra-B pairs when the
/// corresponding mode bit is set.
pub fn expected_tof_count(g1: usize, g2: usize, g3: usize, mode: u8) -> usize {
    let mut tof = g1 * g2 + g1 * g3 + g2 * g3;
    if mode & MODE_GROUP_A_INTERNAL != 0 {
        tof += g1 * (g1.saturating_sub(1)) / 2;
    }
    if mode & MODE_GROUP_B_INTERNAL != 0 {
        tof += g2 * (g2.saturating_sub(1)) / 2;
    }
    tof
}

impl RangingRecord {
    /// Decode a frame payload into a ranging record.
    pub fn parse(frame: &Frame) -> Result<Self, DecodeError> {
        let payload = &frame.payload;
        if payload.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader(payload.len()));
        }

        let header: RangingHeader = bytemuck::pod_read_unaligned(&payload[..HEADER_LEN]);
        let act_type =
            ActType::from_u8(header.act_type).ok_or(DecodeError::UnknownActType(header.act_type))?;

        let (g1, g2, g3) = (header.g1 as usize, header.g2 as usize, header.g3 as usize);
        let ids = g1 + g2 + g3;
        let tof = match act_type {
            ActType::Assignment => 0,
            ActType::Final => expected_tof_count(g1, g2, g3, header.mode),
        };
        let expected = HEADER_LEN + 2 * ids + 2 * tof;
        if payload.len() != expected {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: payload.len(),
            });
        }

        let mut at = HEADER_LEN;
        let mut read_u16 = |at: &mut usize| {
            let v = u16::from_le_bytes([payload[*at], payload[*at + 1]]);
            *at += 2;
            v
        };

        let mut groups: [Vec<NodeId>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for (group, count) in groups.iter_mut().zip([g1, g2, g3]) {
            group.extend((0..count).map(|_| NodeId(read_u16(&mut at))));
        }
        let distances = (0..tof).map(|_| read_u16(&mut at)).collect();

        Ok(Self {
            act_type,
            slot: header.slot,
            timeframe: header.timeframe(),
            tx_power: header.tx_power,
            mode: header.mode,
            groups,
            distances,
        })
    }

    /// Member counts of groups A/B/C.
    pub fn group_sizes(&self) -> [usize; 3] {
        [self.groups[0].len(), self.groups[1].len(), self.groups[2].len()]
    }

    /// Extract the topology edge list from a Final record.
    ///
    /// Pair order must mirror the device's distance array exactly:
    /// A×B, then A×C, then B×C, then intra-A (mode bit 0), then intra-B
    /// (mode bit 1). Slots with an implausible TWR value are skipped.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        if self.act_type != ActType::Final {
            return edges;
        }

        let [a, b, c] = &self.groups;
        let mut slot = 0usize;
        let mut push = |end0: NodeId, end1: NodeId, edges: &mut Vec<Edge>| {
            let value = self.distances[slot];
            slot += 1;
            if twr_value_ok(value) {
                edges.push(Edge {
                    end0,
                    end1,
                    distance_m: value as f64 * TWR_TO_METERS,
                });
            }
        };

        for &i in a {
            for &j in b {
                push(i, j, &mut edges);
            }
        }
        for &i in a {
            for &j in c {
                push(i, j, &mut edges);
            }
        }
        for &i in b {
            for &j in c {
                push(i, j, &mut edges);
            }
        }
        if self.mode & MODE_GROUP_A_INTERNAL != 0 {
            for i in 0..a.len() {
                for j in (i + 1)..a.len() {
                    push(a[i], a[j], &mut edges);
                }
            }
        }
        if self.mode & MODE_GROUP_B_INTERNAL != 0 {
            for i in 0..b.len() {
                for j in (i + 1)..b.len() {
                    push(b[i], b[j], &mut edges);
                }
            }
        }

        edges
    }
}
