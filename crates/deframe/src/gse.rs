//! GSE deframer: RTP → MPEG-TS → BBFrames → GSE → IPv4/UDP → EDI
//!
//! The uplink wraps BBFrames into MPEG2 private sections on PID 0x010e,
//! one section per TS packet, and the whole TS into RTP (see the Digital
//! Devices BBFrame packetisation). GSE packets inside a BBFrame are
//! reassembled by fragment id across start/continuation/end labels
//! (ETSI TS 102 606-1), and completed IPv4/UDP PDUs yield EDI payload.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use crate::error::DeframeError;
use crate::TS_PACKET_SIZE;

/// BBFrames travel on this fixed PID.
const BBFRAME_PID: u16 = 0x010e;

/// L3 sync byte opening a BBFrame.
const L3_SYNC: u8 = 0xb8;

/// BBHeader length (DVB-S2, EN 302 307).
const BBHEADER_LEN: usize = 10;

const RTP_HEADER_LEN: usize = 12;

/// GSE PDUs end with a CRC32 on the last fragment.
const GSE_CRC_LEN: usize = 4;

/// The first four bytes of every UDP payload on these links are an
/// additional header of unknown meaning (first byte always 0x05, second
/// 0x17 or 0x19). It is stripped together with the UDP header fields for
/// compatibility with the existing deployments.
const UDP_HEADER_PREFIX: usize = 4;
const VENDOR_HEADER_LEN: usize = 4;

/// MIS selector plus optional IPv4/UDP flow filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GseConfig {
    /// Expected MaType2; BBFrames for other input streams are discarded.
    pub mis: u8,
    /// Only PDUs towards this destination are extracted when set.
    pub filter: Option<(Ipv4Addr, u16)>,
}

impl GseConfig {
    /// Parse the `-G MIS` or `-G MIS:IP:PORT` argument.
    pub fn from_spec(spec: &str) -> Result<Self, DeframeError> {
        let invalid = |reason: &str| DeframeError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        match parts.len() {
            1 => Ok(Self {
                mis: parts[0].parse().map_err(|_| invalid("bad MIS"))?,
                filter: None,
            }),
            3 => Ok(Self {
                mis: parts[0].parse().map_err(|_| invalid("bad MIS"))?,
                filter: Some((
                    parts[1].parse().map_err(|_| invalid("bad IP"))?,
                    parts[2].parse().map_err(|_| invalid("bad port"))?,
                )),
            }),
            _ => Err(invalid("expected MIS or MIS:IP:PORT")),
        }
    }
}

#[derive(Debug, Default)]
struct PduFragment {
    data: Vec<u8>,
    total_length: u16,
    protocol_type: u16,
}

/// BBFrame and GSE reassembly state plus recovered EDI payloads.
#[derive(Debug)]
pub struct GseDeframer {
    config: GseConfig,
    bbframe: VecDeque<u8>,
    fragments: HashMap<u8, PduFragment>,
    extracted: Vec<Vec<u8>>,
}

impl GseDeframer {
    pub fn new(config: GseConfig) -> Self {
        Self {
            config,
            bbframe: VecDeque::new(),
            fragments: HashMap::new(),
            extracted: Vec::new(),
        }
    }

    pub fn config(&self) -> GseConfig {
        self.config
    }

    /// Feed one received datagram: an RTP header followed by TS packets.
    pub fn process_packet(&mut self, datagram: &[u8]) {
        if datagram.len() <= RTP_HEADER_LEN || datagram[0] != 0x80 || datagram[1] != 0x21 {
            tracing::debug!("datagram without RTP header, skipped");
            return;
        }
        let payload = &datagram[RTP_HEADER_LEN..];
        if payload.len() % TS_PACKET_SIZE != 0 {
            tracing::debug!(len = payload.len(), "RTP payload not a multiple of 188, skipped");
            return;
        }
        for ts in payload.chunks_exact(TS_PACKET_SIZE) {
            self.process_ts(ts);
        }
    }

    /// Recovered EDI payloads since the last call.
    pub fn take_deframed(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.extracted)
    }

    /// One section per TS packet: byte 7 is the section length, byte 8 is
    /// either the L3 sync (header packet) or a running counter.
    fn process_ts(&mut self, ts: &[u8]) {
        let pid = (u16::from(ts[1] & 0x1f) << 8) | u16::from(ts[2]);
        if pid != BBFRAME_PID {
            return;
        }

        let (start, len) = if ts[8] == L3_SYNC {
            (8, usize::from(ts[7]))
        } else {
            (9, usize::from(ts[7]).saturating_sub(1))
        };
        let end = (start + len).min(TS_PACKET_SIZE);
        self.feed_bbframe(&ts[start..end]);
    }

    fn feed_bbframe(&mut self, chunk: &[u8]) {
        if self.bbframe.is_empty() && chunk.first() != Some(&L3_SYNC) {
            return;
        }
        self.bbframe.extend(chunk);

        while let Some(&head) = self.bbframe.front() {
            if head == L3_SYNC {
                break;
            }
            self.bbframe.pop_front();
        }

        // l3sync + bbheader before the length is known
        if self.bbframe.len() < 1 + BBHEADER_LEN {
            return;
        }

        let ma_type2 = self.bbframe[2];
        let dfl_bits = (usize::from(self.bbframe[5]) << 8) | usize::from(self.bbframe[6]);
        let data_len = dfl_bits / 8;

        if self.bbframe.len() < 1 + BBHEADER_LEN + data_len {
            return;
        }

        if ma_type2 != self.config.mis {
            tracing::trace!(got = ma_type2, want = self.config.mis, "BBFrame for foreign MIS");
            self.bbframe.drain(..1 + BBHEADER_LEN + data_len);
            return;
        }

        let data: Vec<u8> = self
            .bbframe
            .iter()
            .skip(1 + BBHEADER_LEN)
            .take(data_len)
            .copied()
            .collect();
        self.process_data_field(&data);
        self.bbframe.drain(..1 + BBHEADER_LEN + data_len);
    }

    /// Walk the GSE packets inside one BBFrame data field.
    fn process_data_field(&mut self, data: &[u8]) {
        let mut pos = 0usize;
        while pos + 2 <= data.len().saturating_sub(GSE_CRC_LEN) {
            if data[pos] & 0xf0 == 0 {
                // start=0, end=0, LT=0: padding, see TS 102 606-1 table 2
                break;
            }
            let gse_length =
                (usize::from(data[pos] & 0x0f) << 8) | usize::from(data[pos + 1]);
            if pos + 2 + gse_length > data.len() {
                tracing::debug!(pos, gse_length, "GSE packet past data field end");
                break;
            }
            if !self.process_gse(&data[pos..pos + 2 + gse_length]) {
                break;
            }
            pos += 2 + gse_length;
        }
    }

    /// One GSE packet; returns false for padding.
    fn process_gse(&mut self, packet: &[u8]) -> bool {
        let start = packet[0] & 0x80 != 0;
        let end = packet[0] & 0x40 != 0;
        let label_type = (packet[0] >> 4) & 0x03;
        if !start && !end && label_type == 0 {
            return false;
        }

        let label_len = match label_type {
            0x00 => 6,
            0x01 => 3,
            _ => 0,
        };

        match (start, end) {
            (true, true) => {
                if packet.len() < 4 + label_len {
                    return true;
                }
                let protocol_type = u16::from_be_bytes([packet[2], packet[3]]);
                let pdu = packet[4 + label_len..].to_vec();
                if protocol_type == 0x0800 {
                    self.process_ipv4_pdu(&pdu);
                }
            }
            (true, false) => {
                if packet.len() < 7 + label_len {
                    return true;
                }
                let frag_id = packet[2];
                let total_length = u16::from_be_bytes([packet[3], packet[4]]);
                let protocol_type = u16::from_be_bytes([packet[5], packet[6]]);
                let fragment = self.fragments.entry(frag_id).or_default();
                fragment.total_length = total_length;
                fragment.protocol_type = protocol_type;
                fragment.data.extend_from_slice(&packet[7 + label_len..]);
            }
            (false, false) => {
                if packet.len() < 3 {
                    return true;
                }
                let frag_id = packet[2];
                if let Some(fragment) = self.fragments.get_mut(&frag_id) {
                    fragment.data.extend_from_slice(&packet[3..]);
                }
            }
            (false, true) => {
                if packet.len() < 3 {
                    return true;
                }
                let frag_id = packet[2];
                if let Some(mut fragment) = self.fragments.remove(&frag_id) {
                    let tail = &packet[3..];
                    if tail.len() >= GSE_CRC_LEN {
                        fragment.data.extend_from_slice(&tail[..tail.len() - GSE_CRC_LEN]);
                    }
                    if fragment.data.len() != usize::from(fragment.total_length) {
                        tracing::debug!(
                            frag_id,
                            got = fragment.data.len(),
                            announced = fragment.total_length,
                            "reassembled PDU length differs from total length"
                        );
                    }
                    if fragment.protocol_type == 0x0800 {
                        self.process_ipv4_pdu(&fragment.data);
                    }
                }
            }
        }
        true
    }

    /// Filter a completed PDU and strip it down to the EDI payload.
    fn process_ipv4_pdu(&mut self, pdu: &[u8]) {
        if pdu.len() < 20 {
            return;
        }
        let version = pdu[0] >> 4;
        let ihl = usize::from(pdu[0] & 0x0f);
        if version != 4 || pdu[9] != 17 {
            return;
        }

        let udp_offset = ihl * 4;
        if pdu.len() < udp_offset + UDP_HEADER_PREFIX + VENDOR_HEADER_LEN {
            return;
        }

        if let Some((ip, port)) = self.config.filter {
            let dst_ip = Ipv4Addr::new(pdu[16], pdu[17], pdu[18], pdu[19]);
            if dst_ip != ip {
                return;
            }
            let dst_port = u16::from_be_bytes([pdu[udp_offset + 2], pdu[udp_offset + 3]]);
            if dst_port != port {
                return;
            }
        }

        self.extracted
            .push(pdu[udp_offset + UDP_HEADER_PREFIX + VENDOR_HEADER_LEN..].to_vec());
    }
}

#[cfg(test)]
#[path = "gse_test.rs"]
mod tests;
