//! Protocol error type
//!
//! A [`ProtocolError`] fails the current frame assembly; it never implies
//! the transport itself is broken. Receivers log it and keep reading.

/// Errors produced while decoding or encoding EDI framing layers
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// AF packet failed its CRC check
    #[error("AF packet CRC mismatch (expected {expected:#06x}, got {found:#06x})")]
    AfCrc { expected: u16, found: u16 },

    /// AF header carried an unknown protocol type byte
    #[error("AF packet with unsupported protocol type {0:#04x}")]
    AfProtocolType(u8),

    /// AF packet truncated or sync word missing
    #[error("malformed AF packet: {0}")]
    AfMalformed(&'static str),

    /// PF fragment header failed its CRC check
    #[error("PFT header CRC mismatch")]
    PftHeaderCrc,

    /// PF fragment header fields are inconsistent
    #[error("malformed PFT fragment: {0}")]
    PftMalformed(&'static str),

    /// TAG packet truncated or a tag length points past the end
    #[error("malformed TAG packet: {0}")]
    TagMalformed(&'static str),

    /// The `*ptr` tag announced a protocol we do not transcode
    #[error("unsupported EDI protocol {proto} {major}.{minor}, expected DETI 0.0")]
    UnsupportedProtocol {
        proto: String,
        major: u16,
        minor: u16,
    },

    /// Frame-characterisation or sub-channel update before `*ptr` was seen
    #[error("tag {0} received before protocol announcement")]
    MissingProtocol(&'static str),

    /// FIC length must be 96 bytes (MID 1,2,4) or 128 bytes (MID 3)
    #[error("impossible FIC length {len} for MID {mid}")]
    FicLength { len: usize, mid: u8 },

    /// MID outside 0..=3 or FP outside 0..=7
    #[error("frame characterisation field out of range: {0}")]
    FcOutOfRange(&'static str),

    /// More sub-channels than an ensemble can carry
    #[error("too many sub-channels: {0} (maximum 64)")]
    TooManySubchannels(usize),

    /// Reconstructed ETI frame would exceed 6144 bytes; a logic error
    #[error("reconstructed ETI frame of {0} bytes exceeds 6144")]
    EtiOverflow(usize),

    /// Reed-Solomon parity computation failed
    #[error("FEC parity generation failed: {0}")]
    Fec(String),
}
