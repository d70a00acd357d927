//! TAG packet construction
//!
//! The bridge mostly forwards TAG packets verbatim, but the sender pads
//! them to the configured alignment with `*dmy` tags, and tests need to
//! synthesise complete DETI frames.

use crate::tag::{FcData, SubchannelData};
use crate::timestamp::FrameTimestamp;

/// Builds a TAG packet tag by tag.
#[derive(Debug, Default)]
pub struct TagPacketBuilder {
    out: Vec<u8>,
}

/// Everything the `deti` tag carries.
#[derive(Debug, Clone, Default)]
pub struct DetiFields {
    pub fc: FcData,
    pub stat: u8,
    pub mnsc: u16,
    /// UTC offset and timestamp; when None the frame has no ATST block
    /// and downstream scheduling sees an invalid timestamp.
    pub time: Option<(u8, FrameTimestamp)>,
    pub fic: Option<Vec<u8>>,
    pub rfu: Option<u16>,
}

impl TagPacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_tag(&mut self, name: &[u8; 4], value: &[u8]) {
        self.out.extend_from_slice(name);
        self.out
            .extend_from_slice(&((value.len() * 8) as u32).to_be_bytes());
        self.out.extend_from_slice(value);
    }

    /// `*ptr` protocol announcement.
    pub fn ptr(mut self, proto: &str, major: u16, minor: u16) -> Self {
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&proto.as_bytes()[..4]);
        value[4..6].copy_from_slice(&major.to_be_bytes());
        value[6..8].copy_from_slice(&minor.to_be_bytes());
        self.push_tag(b"*ptr", &value);
        self
    }

    /// `deti` frame characterisation.
    pub fn deti(mut self, fields: &DetiFields) -> Self {
        let fc = &fields.fc;
        let mut value = Vec::with_capacity(16 + fields.fic.as_ref().map_or(0, |f| f.len()));

        let fcth = fc.dlfc / 250;
        let fct = fc.dlfc % 250;
        let mut flags: u16 = (fcth << 8) | fct;
        if fields.time.is_some() {
            flags |= 0x8000;
        }
        if fields.fic.is_some() {
            flags |= 0x4000;
        }
        if fields.rfu.is_some() {
            flags |= 0x2000;
        }
        value.extend_from_slice(&flags.to_be_bytes());

        let eti_header: u32 = (u32::from(fields.stat) << 24)
            | (u32::from(fc.mid & 0x03) << 22)
            | (u32::from(fc.fp & 0x07) << 19)
            | u32::from(fields.mnsc);
        value.extend_from_slice(&eti_header.to_be_bytes());

        if let Some((utco, ts)) = fields.time {
            value.push(utco);
            value.extend_from_slice(&ts.seconds.to_be_bytes());
            value.extend_from_slice(&ts.tsta.to_be_bytes()[1..4]);
        }
        if let Some(fic) = &fields.fic {
            value.extend_from_slice(fic);
        }
        if let Some(rfu) = fields.rfu {
            value.push(0);
            value.extend_from_slice(&rfu.to_be_bytes());
        }

        self.push_tag(b"deti", &value);
        self
    }

    /// `est<n>` sub-channel stream.
    pub fn est(mut self, index: u8, stc: &SubchannelData) -> Self {
        let sstc: u32 = (u32::from(stc.scid & 0x3f) << 18)
            | (u32::from(stc.sad & 0x3ff) << 8)
            | (u32::from(stc.tpl & 0x3f) << 2);
        let mut value = Vec::with_capacity(3 + stc.mst.len());
        value.extend_from_slice(&sstc.to_be_bytes()[1..4]);
        value.extend_from_slice(&stc.mst);
        self.push_tag(&[b'e', b's', b't', index], &value);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}

/// Pad a TAG packet to a multiple of `alignment` bytes by appending a
/// `*dmy` tag. A dummy tag needs at least eight bytes of room.
pub fn pad_to_alignment(tagpacket: &mut Vec<u8>, alignment: usize) {
    if alignment < 2 || tagpacket.len() % alignment == 0 {
        return;
    }
    let mut needed = alignment - tagpacket.len() % alignment;
    while needed < 8 {
        needed += alignment;
    }
    let value_len = needed - 8;
    tagpacket.extend_from_slice(b"*dmy");
    tagpacket.extend_from_slice(&((value_len * 8) as u32).to_be_bytes());
    tagpacket.resize(tagpacket.len() + value_len, 0);
}
