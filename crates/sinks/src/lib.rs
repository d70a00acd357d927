//! EDI outputs
//!
//! The [`Sender`] consumes released frames from the scheduler, wraps each
//! TAG packet into exactly one AF packet (sequence numbers overridden
//! from the source), optionally cuts it into PFT fragments with FEC, and
//! emits to every configured destination: UDP, TCP listener fan-out, or
//! both. The legacy [`zmq`] output speaks ETI instead and runs on its own
//! channel.

mod error;
mod sender;
mod tcp_server;
mod udp;

pub mod zmq;

pub use error::SinkError;
pub use sender::{
    DestinationConfig, Sender, SenderConfig, SenderStatsHandle, TcpListenerStats,
    UdpDestinationConfig,
};
pub use tcp_server::{TcpServerDestination, TcpServerShared};
pub use udp::UdpDestination;

/// Default AF-packet alignment for the TAG packet padding.
pub const DEFAULT_TAGPACKET_ALIGNMENT: usize = 8;

/// Default fragment spreading factor (95% of the frame period).
pub const DEFAULT_SPREADING_FACTOR: f64 = 0.95;
