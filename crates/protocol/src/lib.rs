//! EDI wire codecs
//!
//! Everything that understands bytes on the wire lives here: the AF and PFT
//! framing layers of ETSI TS 102 821, the TAG-packet layer carrying the
//! DETI/0.0 profile, and the ETI(NI) frame reconstruction needed by the
//! legacy ZMQ output.
//!
//! # Layering
//!
//! ```text
//! TCP byte stream ──┐
//!                   ├──► AF packet ──► TAG packet ──► DataCollector events
//! UDP datagram ──► PFT fragment(s) ─┘
//! ```
//!
//! Decoding is event-driven: [`StreamDecoder`] feeds complete TAG packets
//! through the [`DataCollector`] trait, one callback per decoder event, and
//! finishes each frame with [`DataCollector::assemble`]. Protocol errors
//! fail the current frame only; the caller decides whether to keep the
//! connection.
//!
//! Encoding is pure: [`af::encode`] wraps a TAG packet into an AF packet,
//! [`pft::fragment`] cuts an AF packet into FEC-protected PF fragments.

mod crc16;
mod error;
mod timestamp;

pub mod af;
pub mod decode;
pub mod eti;
pub mod pft;
pub mod tag;
pub mod tagbuild;

pub use crc16::crc16;
pub use decode::{AfPacketExtractor, DataCollector, ExtractedAf, StreamDecoder};
pub use error::ProtocolError;
pub use tag::{FcData, ReceivedTagPacket, SeqInfo, SubchannelData, TagPacket};
pub use timestamp::FrameTimestamp;

/// DLFC wraps at this value.
pub const DLFC_MODULO: u16 = 5000;

/// Nominal DAB ensemble frame period.
pub const FRAME_PERIOD_MS: u64 = 24;

/// Hard upper bound for a reconstructed ETI frame.
pub const MAX_ETI_FRAME: usize = 6144;

pub type Result<T> = std::result::Result<T, ProtocolError>;
