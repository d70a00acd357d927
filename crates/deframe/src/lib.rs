//! Deframers for EDI tunnelled in satellite feeds
//!
//! Some contribution links carry EDI inside DVB transport streams. Two
//! encapsulations are supported ahead of the EDI decoder:
//!
//! - **MPE** (ETSI EN 301 192): datagrams are concatenations of 188-byte
//!   MPEG-TS packets; PSI sections of table 0x3E on a configured PID hold
//!   IPv4/UDP packets whose payload is EDI.
//! - **GSE** (ETSI TS 102 606): RTP-wrapped TS packets on PID 0x010e carry
//!   BBFrames; GSE packets inside them reassemble into IPv4/UDP PDUs.
//!
//! Both deframers are push/drain: feed each received datagram with
//! `process_packet`, collect recovered EDI payloads with
//! `take_deframed`.

mod error;
mod gse;
mod mpe;

pub use error::DeframeError;
pub use gse::{GseConfig, GseDeframer};
pub use mpe::{MpeConfig, MpeDeframer};

/// MPEG-TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// MPEG-TS sync byte.
pub const TS_SYNC: u8 = 0x47;
