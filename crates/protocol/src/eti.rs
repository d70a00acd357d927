//! ETI(NI) frame reconstruction (ETSI EN 300 799)
//!
//! The legacy ZMQ output speaks ETI, not EDI. This module rebuilds an ETI
//! frame from the decoder state of one EDI frame: frame characterisation,
//! FIC, sub-channel streams, MNSC, RFU and TIST.

use crate::crc16::crc16;
use crate::error::ProtocolError;
use crate::tag::{FcData, SubchannelData};
use crate::timestamp::FrameTimestamp;
use crate::{Result, MAX_ETI_FRAME};

/// FSYNC alternates between these by FCT parity.
const FSYNC_ODD: [u8; 3] = [0xf8, 0xc5, 0x49];
const FSYNC_EVEN: [u8; 3] = [0x07, 0x3a, 0xb6];

/// Decoder state of one frame, as collected from the `deti` and `est<n>`
/// tags.
#[derive(Debug, Clone, Default)]
pub struct EtiParts {
    pub fc: FcData,
    pub err: u8,
    pub fic: Vec<u8>,
    pub subchannels: Vec<SubchannelData>,
    pub mnsc: u16,
    pub rfu: u16,
    pub timestamp: FrameTimestamp,
}

/// A reconstructed ETI frame on its way to the ZMQ output.
#[derive(Debug, Clone)]
pub struct EtiFrame {
    pub frame: Vec<u8>,
    pub timestamp: FrameTimestamp,
    pub fc: FcData,
}

/// Expected FIC length for a mode.
pub fn fic_length(mid: u8) -> usize {
    if mid == 3 {
        128
    } else {
        96
    }
}

/// Rebuild one ETI frame. Fails on impossible FIC lengths; a frame that
/// would exceed 6144 bytes is a logic error and surfaces as
/// [`ProtocolError::EtiOverflow`].
pub fn reconstruct(parts: &EtiParts) -> Result<EtiFrame> {
    let fc = parts.fc;

    if fc.ficf && parts.fic.len() != fic_length(fc.mid) {
        return Err(ProtocolError::FicLength {
            len: parts.fic.len(),
            mid: fc.mid,
        });
    }
    if parts.subchannels.len() > 64 {
        return Err(ProtocolError::TooManySubchannels(parts.subchannels.len()));
    }

    let nst = parts.subchannels.len();
    let mst_len: usize =
        parts.fic.len() + parts.subchannels.iter().map(|s| s.mst.len()).sum::<usize>();

    // FL counts 32-bit words of STC + EOH + MST.
    let fl = (4 * nst + 4 + mst_len) / 4;
    if fl > 0x7ff {
        return Err(ProtocolError::EtiOverflow(4 + 4 + 4 * nst + 4 + mst_len + 8));
    }

    let mut frame = Vec::with_capacity(16 + 4 * nst + mst_len + 8);

    frame.push(parts.err);
    frame.extend_from_slice(if fc.fct % 2 == 1 {
        &FSYNC_ODD
    } else {
        &FSYNC_EVEN
    });

    // FC
    let header_start = frame.len();
    frame.push(fc.fct);
    frame.push((u8::from(fc.ficf) << 7) | (nst as u8 & 0x7f));
    let fp_mid_fl: u16 =
        (u16::from(fc.fp & 0x07) << 13) | (u16::from(fc.mid & 0x03) << 11) | (fl as u16 & 0x7ff);
    frame.extend_from_slice(&fp_mid_fl.to_be_bytes());

    // STC
    for sub in &parts.subchannels {
        let stl = (sub.mst.len() / 8) as u16;
        let stc: u32 = (u32::from(sub.scid & 0x3f) << 26)
            | (u32::from(sub.sad & 0x3ff) << 16)
            | (u32::from(sub.tpl & 0x3f) << 10)
            | u32::from(stl & 0x3ff);
        frame.extend_from_slice(&stc.to_be_bytes());
    }

    // EOH: MNSC + CRC over FC, STC and MNSC
    frame.extend_from_slice(&parts.mnsc.to_be_bytes());
    let header_crc = crc16(&frame[header_start..]);
    frame.extend_from_slice(&header_crc.to_be_bytes());

    // MST
    let mst_start = frame.len();
    frame.extend_from_slice(&parts.fic);
    for sub in &parts.subchannels {
        frame.extend_from_slice(&sub.mst);
    }

    // EOF: CRC over MST, then RFU
    let mst_crc = crc16(&frame[mst_start..]);
    frame.extend_from_slice(&mst_crc.to_be_bytes());
    frame.extend_from_slice(&parts.rfu.to_be_bytes());

    // TIST
    frame.extend_from_slice(&parts.timestamp.tsta.to_be_bytes());

    if frame.len() > MAX_ETI_FRAME {
        return Err(ProtocolError::EtiOverflow(frame.len()));
    }

    Ok(EtiFrame {
        frame,
        timestamp: parts.timestamp,
        fc,
    })
}

#[cfg(test)]
#[path = "eti_test.rs"]
mod tests;
