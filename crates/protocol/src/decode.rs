//! TAG-packet decoding and the stream decoder
//!
//! A TAG packet is a sequence of `(name: 4 bytes, length: u32 bits, value)`
//! records. The decoder understands the DETI/0.0 profile: `*ptr` announces
//! the protocol, `deti` carries the frame characterisation (DLFC, TIST,
//! FIC, MNSC), `est<n>` carries one sub-channel each, `*dmy` is padding.
//!
//! Framing and content are split: [`AfPacketExtractor`] turns a byte
//! stream or datagram sequence into validated AF packets (reassembling PF
//! fragments on the way); [`StreamDecoder`] feeds their payloads through
//! the TAG-packet decoder, delivering events through [`DataCollector`],
//! one callback per event, with [`DataCollector::assemble`] closing each
//! frame. An error fails only the frame being assembled.

use bytes::{Buf, BytesMut};

use crate::af;
use crate::error::ProtocolError;
use crate::pft::PftReassembler;
use crate::tag::{FcData, ReceivedTagPacket, SeqInfo, SubchannelData};
use crate::timestamp::FrameTimestamp;
use crate::Result;

/// Upper bound on sub-channels per ensemble.
pub const MAX_SUBCHANNELS: usize = 64;

/// Receives decoder events for one source.
///
/// Implementations accumulate per-frame state and reset it when a frame
/// fails. Returning an error from an update fails the current frame.
pub trait DataCollector {
    /// The `*ptr` tag announced the EDI protocol revision.
    fn update_protocol(&mut self, proto: &str, major: u16, minor: u16) -> Result<()>;

    /// Frame characterisation from the `deti` tag.
    fn update_fc_data(&mut self, fc: FcData) -> Result<()>;

    /// FIC bytes shared by all sub-channels.
    fn update_fic(&mut self, fic: Vec<u8>) -> Result<()>;

    /// ETI error/status indicator.
    fn update_err(&mut self, err: u8);

    /// Time fields from the `deti` ATST block.
    fn update_edi_time(&mut self, utco: u8, seconds: u32);

    /// Multiplex network signalling channel word.
    fn update_mnsc(&mut self, mnsc: u16);

    /// Reserved-for-future-use word from the `deti` tag.
    fn update_rfu(&mut self, rfu: u16);

    /// One sub-channel stream.
    fn add_subchannel(&mut self, stc: SubchannelData) -> Result<()>;

    /// The TAG packet is complete.
    fn assemble(&mut self, tag: ReceivedTagPacket);

    /// The current frame failed to decode; per-frame state should reset.
    fn frame_failed(&mut self, _error: &ProtocolError) {}
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Decode one complete TAG packet, dispatching events to `collector`.
pub fn decode_tagpacket(payload: &[u8], seq: SeqInfo, collector: &mut dyn DataCollector) -> Result<()> {
    let mut pos = 0usize;
    let mut timestamp = FrameTimestamp::default();
    let mut have_deti = false;
    let mut num_subchannels = 0usize;

    while payload.len() - pos >= 8 {
        let name = &payload[pos..pos + 4];
        if name == [0, 0, 0, 0] {
            break; // alignment padding
        }
        let len_bits = read_u32(&payload[pos + 4..pos + 8]) as usize;
        let len = len_bits.div_ceil(8);
        pos += 8;
        if payload.len() - pos < len {
            return Err(ProtocolError::TagMalformed("tag value past end of packet"));
        }
        let value = &payload[pos..pos + len];
        pos += len;

        match name {
            b"*ptr" => {
                if value.len() < 8 {
                    return Err(ProtocolError::TagMalformed("short *ptr tag"));
                }
                let proto = std::str::from_utf8(&value[0..4])
                    .map_err(|_| ProtocolError::TagMalformed("non-ASCII protocol name"))?;
                let major = read_u16(&value[4..6]);
                let minor = read_u16(&value[6..8]);
                collector.update_protocol(proto, major, minor)?;
            }
            b"deti" => {
                timestamp = decode_deti(value, collector)?;
                have_deti = true;
            }
            b"*dmy" => {}
            _ if name.starts_with(b"est") => {
                num_subchannels += 1;
                if num_subchannels > MAX_SUBCHANNELS {
                    return Err(ProtocolError::TooManySubchannels(num_subchannels));
                }
                collector.add_subchannel(decode_estn(value)?)?;
            }
            _ => {
                tracing::trace!(tag = %String::from_utf8_lossy(name), "ignoring unknown tag");
            }
        }
    }

    if have_deti {
        collector.assemble(ReceivedTagPacket {
            tagpacket: payload.to_vec(),
            timestamp,
            seq,
        });
    } else {
        tracing::trace!("TAG packet without deti, nothing to assemble");
    }
    Ok(())
}

/// Decode the `deti` tag value; returns the frame timestamp.
fn decode_deti(value: &[u8], collector: &mut dyn DataCollector) -> Result<FrameTimestamp> {
    if value.len() < 6 {
        return Err(ProtocolError::TagMalformed("short deti tag"));
    }

    let flags = read_u16(&value[0..2]);
    let atstf = flags & 0x8000 != 0;
    let ficf = flags & 0x4000 != 0;
    let rfudf = flags & 0x2000 != 0;
    let fcth = (flags >> 8) & 0x1f;
    let fct = (flags & 0xff) as u8;
    let dlfc = fcth * 250 + u16::from(fct);

    let eti_header = read_u32(&value[2..6]);
    let stat = (eti_header >> 24) as u8;
    let mid = ((eti_header >> 22) & 0x03) as u8;
    let fp = ((eti_header >> 19) & 0x07) as u8;
    let mnsc = (eti_header & 0xffff) as u16;

    let mut pos = 6usize;
    let mut timestamp = FrameTimestamp::default();
    if atstf {
        if value.len() < pos + 8 {
            return Err(ProtocolError::TagMalformed("truncated ATST block"));
        }
        let utco = value[pos];
        let seconds = read_u32(&value[pos + 1..pos + 5]);
        let tsta = u32::from_be_bytes([0, value[pos + 5], value[pos + 6], value[pos + 7]]);
        timestamp = FrameTimestamp::new(seconds, tsta);
        collector.update_edi_time(utco, seconds);
        pos += 8;
    }

    collector.update_err(stat);
    collector.update_fc_data(FcData {
        dlfc,
        fct,
        fp,
        mid,
        ficf,
        tsta: timestamp.tsta,
    })?;
    collector.update_mnsc(mnsc);

    if ficf {
        let fic_len = if mid == 3 { 128 } else { 96 };
        if value.len() < pos + fic_len {
            return Err(ProtocolError::FicLength {
                len: value.len() - pos,
                mid,
            });
        }
        collector.update_fic(value[pos..pos + fic_len].to_vec())?;
        pos += fic_len;
    }

    if rfudf {
        if value.len() < pos + 3 {
            return Err(ProtocolError::TagMalformed("truncated RFUD block"));
        }
        let rfu = read_u16(&value[pos + 1..pos + 3]);
        collector.update_rfu(rfu);
    }

    Ok(timestamp)
}

/// Decode an `est<n>` tag value into a sub-channel record.
fn decode_estn(value: &[u8]) -> Result<SubchannelData> {
    if value.len() < 3 {
        return Err(ProtocolError::TagMalformed("short est tag"));
    }
    let sstc = u32::from_be_bytes([0, value[0], value[1], value[2]]);
    Ok(SubchannelData {
        scid: ((sstc >> 18) & 0x3f) as u8,
        sad: ((sstc >> 8) & 0x3ff) as u16,
        tpl: ((sstc >> 2) & 0x3f) as u8,
        mst: value[3..].to_vec(),
    })
}

/// A validated AF packet recovered from the wire.
#[derive(Debug, Clone)]
pub struct ExtractedAf {
    /// The complete AF packet, CRC checked.
    pub afpacket: Vec<u8>,
    /// Payload range within `afpacket`.
    pub payload_len: usize,
    pub seq: SeqInfo,
}

impl ExtractedAf {
    pub fn payload(&self) -> &[u8] {
        &self.afpacket[af::AF_HEADER_LEN..af::AF_HEADER_LEN + self.payload_len]
    }
}

/// Recovers AF packets from a byte stream or datagram sequence,
/// reassembling PF fragments on the way. Synchronisation losses skip
/// forward to the next plausible sync word.
#[derive(Debug, Default)]
pub struct AfPacketExtractor {
    buf: BytesMut,
    pft: PftReassembler,
    skipped: u64,
}

impl AfPacketExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; collects every completed packet (or per-frame error)
    /// into `out`.
    pub fn push_bytes(&mut self, data: &[u8], out: &mut Vec<Result<ExtractedAf>>) {
        self.buf.extend_from_slice(data);
        loop {
            if self.buf.len() < 2 {
                return;
            }
            match [self.buf[0], self.buf[1]] {
                af::AF_SYNC => {
                    if !self.try_af(out) {
                        return;
                    }
                }
                [b'P', b'F'] => {
                    if !self.try_pf(out) {
                        return;
                    }
                }
                _ => {
                    self.buf.advance(1);
                    self.skipped += 1;
                    if self.skipped % 1024 == 0 {
                        tracing::debug!(skipped = self.skipped, "searching for EDI sync");
                    }
                }
            }
        }
    }

    /// Returns false when more bytes are needed.
    fn try_af(&mut self, out: &mut Vec<Result<ExtractedAf>>) -> bool {
        if self.buf.len() < af::AF_HEADER_LEN {
            return false;
        }
        let header = match af::parse_header(&self.buf) {
            Ok(header) => header,
            Err(e) => {
                out.push(Err(e));
                self.buf.advance(1);
                return true;
            }
        };
        let total = header.packet_len();
        if self.buf.len() < total {
            return false;
        }

        match af::decode(&self.buf[..total]) {
            Ok((header, _payload)) => {
                out.push(Ok(ExtractedAf {
                    afpacket: self.buf[..total].to_vec(),
                    payload_len: header.payload_len,
                    seq: SeqInfo {
                        seq: header.seq,
                        seq_valid: true,
                        pseq: 0,
                        pseq_valid: false,
                    },
                }));
                self.buf.advance(total);
            }
            Err(e) => {
                tracing::debug!(error = %e, "AF packet rejected, resyncing");
                out.push(Err(e));
                self.buf.advance(1);
            }
        }
        true
    }

    /// Returns false when more bytes are needed.
    fn try_pf(&mut self, out: &mut Vec<Result<ExtractedAf>>) -> bool {
        let Some(total) = self.peek_pf_len() else {
            return false;
        };

        match self.pft.push_fragment(&self.buf[..total]) {
            Ok(Some((pseq, afpacket))) => match af::decode(&afpacket) {
                Ok((header, _payload)) => out.push(Ok(ExtractedAf {
                    payload_len: header.payload_len,
                    seq: SeqInfo {
                        seq: header.seq,
                        seq_valid: true,
                        pseq,
                        pseq_valid: true,
                    },
                    afpacket,
                })),
                Err(e) => {
                    tracing::debug!(error = %e, "reassembled AF packet rejected");
                    out.push(Err(e));
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "PF fragment rejected, resyncing");
                out.push(Err(e));
                self.buf.advance(1);
                return true;
            }
        }
        self.buf.advance(total);
        true
    }

    /// Total wire length of the PF fragment at the head of the buffer, or
    /// None if not enough bytes arrived yet to know.
    fn peek_pf_len(&self) -> Option<usize> {
        if self.buf.len() < 12 {
            return None;
        }
        let flags = u16::from_be_bytes([self.buf[10], self.buf[11]]);
        let fec = flags & 0x8000 != 0;
        let addr = flags & 0x4000 != 0;
        let plen = (flags & 0x3fff) as usize;
        let header_len = 12 + if fec { 2 } else { 0 } + if addr { 4 } else { 0 } + 2;
        let total = header_len + plen;
        (self.buf.len() >= total).then_some(total)
    }
}

/// Incremental decoder over a byte stream or datagram sequence: AF
/// extraction plus TAG-packet decoding.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    extractor: AfPacketExtractor,
    events: Vec<Result<ExtractedAf>>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from a TCP stream.
    pub fn push_bytes(&mut self, data: &[u8], collector: &mut dyn DataCollector) {
        self.extractor.push_bytes(data, &mut self.events);
        for event in self.events.drain(..) {
            match event {
                Ok(extracted) => {
                    if let Err(e) = decode_tagpacket(extracted.payload(), extracted.seq, collector)
                    {
                        tracing::debug!(error = %e, "TAG packet decode failed");
                        collector.frame_failed(&e);
                    }
                }
                Err(e) => collector.frame_failed(&e),
            }
        }
    }

    /// Feed one datagram (UDP); packets never straddle datagrams but a
    /// datagram may hold several PF packets.
    pub fn push_packet(&mut self, data: &[u8], collector: &mut dyn DataCollector) {
        self.push_bytes(data, collector);
    }
}

#[cfg(test)]
#[path = "decode_test.rs"]
mod tests;
