//! EDI inputs
//!
//! One [`Receiver`] task per configured source owns that source's
//! connect/retry state machine and feeds decoded tag packets into the
//! scheduler. The [`UdpReceiver`] listens for datagram EDI, optionally
//! joined to a multicast group.
//!
//! Receivers never abort on protocol errors: a bad frame resets the
//! per-frame decoder state and the connection keeps running. Transport
//! errors tear the connection down and schedule a reconnect.

mod error;
mod margin;
mod receiver;
mod source;
mod udp;

pub use error::SourceError;
pub use margin::{MarginStats, MarginWindow};
pub use receiver::{Receiver, KEEPALIVE_IDLE, RECONNECT_DELAY};
pub use source::{ConnectError, SourceConfig, SourceShared, SourceSnapshot};
pub use udp::{UdpReceiver, UdpReceiverConfig};

/// Process-wide bound on configured inputs.
pub const MAX_SOURCES: usize = 16;
