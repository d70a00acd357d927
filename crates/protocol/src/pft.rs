//! PFT layer (ETSI TS 102 821 §7): protection, fragmentation, transport
//!
//! On the way out an AF packet is optionally Reed-Solomon protected, then
//! cut into PF fragments:
//!
//! ```text
//! "PF" | Pseq u16 | Findex u24 | Fcount u24 | FEC,Addr,Plen u16
//!      | [RSk u8, RSz u8] | [Source u16, Dest u16] | HCRC u16 | payload
//! ```
//!
//! With FEC enabled the AF packet is zero-padded to 207-byte chunks, each
//! chunk gains 48 parity bytes (an RS(255,207)-shaped code over GF(2⁸)),
//! and the protected block is byte-interleaved across the fragments so
//! that a lost fragment costs every codeword only a few bytes.
//!
//! The inbound [`PftReassembler`] collects fragments per Pseq and
//! reassembles the AF packet once all fragments arrived. It strips parity
//! but does not attempt erasure recovery; an incomplete Pseq is abandoned
//! once it falls out of a small window.

use std::collections::HashMap;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::af;
use crate::crc16::crc16;
use crate::error::ProtocolError;
use crate::Result;

pub const PF_SYNC: [u8; 2] = [b'P', b'F'];

/// RS chunk geometry: 207 data bytes, 48 parity bytes per chunk.
pub const RS_CHUNK_DATA: usize = 207;
pub const RS_CHUNK_PARITY: usize = 48;
const RS_CHUNK_TOTAL: usize = RS_CHUNK_DATA + RS_CHUNK_PARITY;

/// Fragment payload ceiling leaving room for IP/UDP and the PF header.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1400;

/// Incomplete Pseq entries older than this many packets are dropped.
const PSEQ_WINDOW: usize = 8;

/// Plen is a 14-bit field.
const MAX_PLEN: usize = (1 << 14) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PfHeader {
    pseq: u16,
    findex: u32,
    fcount: u32,
    fec: bool,
    plen: usize,
    header_len: usize,
}

fn write_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes()[1..4]);
}

fn read_u24(buf: &[u8]) -> u32 {
    u32::from_be_bytes([0, buf[0], buf[1], buf[2]])
}

fn encode_header(pseq: u16, findex: u32, fcount: u32, fec: bool, plen: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&PF_SYNC);
    out.extend_from_slice(&pseq.to_be_bytes());
    write_u24(&mut out, findex);
    write_u24(&mut out, fcount);
    let flags = ((fec as u16) << 15) | (plen as u16 & 0x3fff);
    out.extend_from_slice(&flags.to_be_bytes());
    if fec {
        out.push(RS_CHUNK_DATA as u8);
        out.push(RS_CHUNK_PARITY as u8);
    }
    let hcrc = crc16(&out);
    out.extend_from_slice(&hcrc.to_be_bytes());
    out
}

fn parse_header(buf: &[u8]) -> Result<PfHeader> {
    if buf.len() < 12 || buf[0..2] != PF_SYNC {
        return Err(ProtocolError::PftMalformed("short fragment or bad sync"));
    }
    let pseq = u16::from_be_bytes([buf[2], buf[3]]);
    let findex = read_u24(&buf[4..7]);
    let fcount = read_u24(&buf[7..10]);
    let flags = u16::from_be_bytes([buf[10], buf[11]]);
    let fec = flags & 0x8000 != 0;
    let addr = flags & 0x4000 != 0;
    let plen = (flags & 0x3fff) as usize;

    let mut pos = 12;
    if fec {
        if buf.len() < pos + 2 {
            return Err(ProtocolError::PftMalformed("truncated FEC fields"));
        }
        pos += 2;
    }
    if addr {
        if buf.len() < pos + 4 {
            return Err(ProtocolError::PftMalformed("truncated address fields"));
        }
        pos += 4;
    }
    if buf.len() < pos + 2 {
        return Err(ProtocolError::PftMalformed("truncated header CRC"));
    }
    let expected = crc16(&buf[..pos]);
    let found = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    if expected != found {
        return Err(ProtocolError::PftHeaderCrc);
    }
    pos += 2;

    if fcount == 0 || findex >= fcount {
        return Err(ProtocolError::PftMalformed("Findex/Fcount inconsistent"));
    }
    if buf.len() < pos + plen {
        return Err(ProtocolError::PftMalformed("payload shorter than Plen"));
    }

    Ok(PfHeader {
        pseq,
        findex,
        fcount,
        fec,
        plen,
        header_len: pos,
    })
}

/// Append per-chunk RS parity: each 207-byte chunk of `data` gains 48
/// parity bytes. `data.len()` must be a multiple of [`RS_CHUNK_DATA`].
fn protect(data: &[u8]) -> Result<Vec<u8>> {
    let chunks = data.len() / RS_CHUNK_DATA;
    debug_assert_eq!(data.len() % RS_CHUNK_DATA, 0);

    // Column-major shards: shard i holds byte i of every chunk, so one
    // encode call computes all chunk codewords at once.
    let rs = ReedSolomon::new(RS_CHUNK_DATA, RS_CHUNK_PARITY)
        .map_err(|e| ProtocolError::Fec(e.to_string()))?;
    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(RS_CHUNK_TOTAL);
    for i in 0..RS_CHUNK_DATA {
        let mut shard = Vec::with_capacity(chunks);
        for c in 0..chunks {
            shard.push(data[c * RS_CHUNK_DATA + i]);
        }
        shards.push(shard);
    }
    shards.resize(RS_CHUNK_TOTAL, vec![0u8; chunks]);
    rs.encode(&mut shards)
        .map_err(|e| ProtocolError::Fec(e.to_string()))?;

    let mut out = Vec::with_capacity(chunks * RS_CHUNK_TOTAL);
    for c in 0..chunks {
        for shard in shards.iter().take(RS_CHUNK_DATA) {
            out.push(shard[c]);
        }
        for shard in shards.iter().skip(RS_CHUNK_DATA) {
            out.push(shard[c]);
        }
    }
    Ok(out)
}

/// Cut an AF packet into PF fragments.
///
/// `fec == 0` splits the packet sequentially. `fec > 0` enables RS
/// protection and byte interleaving; the fragment count gains `fec` extra
/// fragments so that as many can be lost before any codeword misses more
/// bytes than its parity covers.
pub fn fragment(
    afpacket: &[u8],
    pseq: u16,
    fec: u8,
    max_fragment_size: usize,
) -> Result<Vec<Vec<u8>>> {
    let max_fragment_size = max_fragment_size.min(MAX_PLEN).max(1);

    if fec == 0 {
        let fcount = afpacket.len().div_ceil(max_fragment_size).max(1);
        let mut fragments = Vec::with_capacity(fcount);
        for (findex, chunk) in afpacket.chunks(max_fragment_size).enumerate() {
            let mut frag = encode_header(pseq, findex as u32, fcount as u32, false, chunk.len());
            frag.extend_from_slice(chunk);
            fragments.push(frag);
        }
        if fragments.is_empty() {
            fragments.push(encode_header(pseq, 0, 1, false, 0));
        }
        return Ok(fragments);
    }

    let mut padded = afpacket.to_vec();
    let rem = padded.len() % RS_CHUNK_DATA;
    if rem != 0 {
        padded.resize(padded.len() + RS_CHUNK_DATA - rem, 0);
    }
    let protected = protect(&padded)?;

    let fcount = protected.len().div_ceil(max_fragment_size) + usize::from(fec);
    let mut fragments = Vec::with_capacity(fcount);
    for j in 0..fcount {
        // fragment j takes protected bytes j, j+fcount, j+2*fcount, ...
        let payload: Vec<u8> = protected
            .iter()
            .skip(j)
            .step_by(fcount)
            .copied()
            .collect();
        let mut frag = encode_header(pseq, j as u32, fcount as u32, true, payload.len());
        frag.extend_from_slice(&payload);
        fragments.push(frag);
    }
    Ok(fragments)
}

#[derive(Debug)]
struct PendingPacket {
    fcount: u32,
    fec: bool,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Collects PF fragments and yields complete AF packets.
#[derive(Debug, Default)]
pub struct PftReassembler {
    pending: HashMap<u16, PendingPacket>,
    order: Vec<u16>,
}

impl PftReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one PF fragment. Returns the reassembled AF packet and its
    /// Pseq once the last fragment of a packet arrives.
    pub fn push_fragment(&mut self, buf: &[u8]) -> Result<Option<(u16, Vec<u8>)>> {
        let header = parse_header(buf)?;
        let payload = &buf[header.header_len..header.header_len + header.plen];

        let entry = self.pending.entry(header.pseq).or_insert_with(|| {
            self.order.push(header.pseq);
            PendingPacket {
                fcount: header.fcount,
                fec: header.fec,
                fragments: vec![None; header.fcount as usize],
                received: 0,
            }
        });
        if entry.fcount != header.fcount || entry.fec != header.fec {
            return Err(ProtocolError::PftMalformed("fragment set changed shape"));
        }
        let slot = &mut entry.fragments[header.findex as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            entry.received += 1;
        }

        if entry.received == entry.fcount as usize {
            let entry = self.pending.remove(&header.pseq).unwrap();
            self.order.retain(|p| *p != header.pseq);
            let af = assemble(entry)?;
            return Ok(Some((header.pseq, af)));
        }

        // Abandon Pseqs that fell out of the window; without erasure
        // recovery they can never complete.
        while self.order.len() > PSEQ_WINDOW {
            let stale = self.order.remove(0);
            if self.pending.remove(&stale).is_some() {
                tracing::debug!(pseq = stale, "abandoning incomplete PFT packet");
            }
        }

        Ok(None)
    }

    /// Number of packets currently awaiting fragments.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn assemble(entry: PendingPacket) -> Result<Vec<u8>> {
    let fragments: Vec<Vec<u8>> = entry.fragments.into_iter().map(|f| f.unwrap()).collect();

    if !entry.fec {
        let mut out = Vec::new();
        for frag in &fragments {
            out.extend_from_slice(frag);
        }
        return Ok(out);
    }

    // Inverse of the byte interleave, then strip per-chunk parity.
    let fcount = fragments.len();
    let total: usize = fragments.iter().map(|f| f.len()).sum();
    let mut protected = vec![0u8; total];
    for (j, frag) in fragments.iter().enumerate() {
        for (i, byte) in frag.iter().enumerate() {
            let pos = j + i * fcount;
            if pos < total {
                protected[pos] = *byte;
            }
        }
    }
    if protected.len() % RS_CHUNK_TOTAL != 0 {
        return Err(ProtocolError::PftMalformed(
            "protected block not chunk aligned",
        ));
    }

    let mut padded = Vec::with_capacity(protected.len() / RS_CHUNK_TOTAL * RS_CHUNK_DATA);
    for chunk in protected.chunks(RS_CHUNK_TOTAL) {
        padded.extend_from_slice(&chunk[..RS_CHUNK_DATA]);
    }

    // The AF header knows the real length; drop the chunk padding.
    if padded.len() < af::AF_HEADER_LEN {
        return Err(ProtocolError::PftMalformed("reassembly shorter than AF header"));
    }
    let af_header = af::parse_header(&padded)?;
    let wire_len = af_header.packet_len();
    if wire_len > padded.len() {
        return Err(ProtocolError::PftMalformed("AF length exceeds reassembly"));
    }
    padded.truncate(wire_len);
    Ok(padded)
}

#[cfg(test)]
#[path = "pft_test.rs"]
mod tests;
