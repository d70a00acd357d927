//! Data model shared across the pipeline
//!
//! [`TagPacket`] is the quantum that flows from a receiver through the
//! scheduler to the sender: one complete TAG packet (the AF payload) plus
//! everything needed to schedule, deduplicate and re-emit it.

use std::time::Instant;

use crate::timestamp::FrameTimestamp;

/// AF and PFT sequence numbers as observed on the wire.
///
/// Preserved end-to-end so the output reproduces the source's numbering
/// (multi-homing requirement).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqInfo {
    pub seq: u16,
    pub seq_valid: bool,
    pub pseq: u16,
    pub pseq_valid: bool,
}

/// Frame characterisation carried by the `deti` tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FcData {
    /// Frame counter, 0..4999.
    pub dlfc: u16,
    /// Low eight bits of the frame counter (ETI FCT field).
    pub fct: u8,
    /// Frame phase, three bits.
    pub fp: u8,
    /// Mode identity, two bits.
    pub mid: u8,
    /// Whether the frame carries FIC data.
    pub ficf: bool,
    /// Raw TSTA word.
    pub tsta: u32,
}

/// One sub-channel stream from an `est<n>` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubchannelData {
    /// Sub-channel identifier, six bits.
    pub scid: u8,
    /// Sub-channel start address, ten bits.
    pub sad: u16,
    /// Type and protection level, six bits.
    pub tpl: u8,
    /// Stream payload; STL is `mst.len() / 8`.
    pub mst: Vec<u8>,
}

/// A complete TAG packet handed out of the decoder.
#[derive(Debug, Clone)]
pub struct ReceivedTagPacket {
    pub tagpacket: Vec<u8>,
    pub timestamp: FrameTimestamp,
    pub seq: SeqInfo,
}

/// The scheduling quantum: one ensemble frame on its way to the output.
#[derive(Debug, Clone)]
pub struct TagPacket {
    /// Labels of the sources that contributed this frame. Starts as a
    /// singleton and grows when mirrored arrivals are merged.
    pub origins: Vec<String>,
    pub seq: SeqInfo,
    pub dlfc: u16,
    pub timestamp: FrameTimestamp,
    /// Raw TAG packet bytes, re-wrapped into AF by the sender.
    pub afpacket: Vec<u8>,
    /// When the frame entered the pipeline (monotonic).
    pub received_at: Instant,
}

impl TagPacket {
    /// Merge the origin labels of a duplicate arrival into this entry.
    pub fn merge_origins(&mut self, other: &TagPacket) {
        for origin in &other.origins {
            if !self.origins.contains(origin) {
                self.origins.push(origin.clone());
            }
        }
    }
}
