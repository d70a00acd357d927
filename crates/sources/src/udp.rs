//! EDI/UDP receiver with multicast join

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::SourceError;

/// Receive timeout per poll.
pub const UDP_RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 8192;

/// Where and how to listen.
#[derive(Debug, Clone)]
pub struct UdpReceiverConfig {
    pub port: u16,
    pub bind: IpAddr,
    /// Multicast group to join, if any.
    pub mcast: Option<Ipv4Addr>,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mcast: None,
        }
    }
}

/// Datagram receiver; each datagram holds one or more complete EDI
/// packets.
pub struct UdpReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpReceiver {
    pub fn bind(config: &UdpReceiverConfig) -> Result<Self, SourceError> {
        let address = SocketAddr::new(config.bind, config.port);
        let map_err = |e: std::io::Error| SourceError::Bind {
            address: address.to_string(),
            source: e,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.bind(&address.into()).map_err(map_err)?;

        if let Some(group) = config.mcast {
            let interface = match config.bind {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &interface).map_err(map_err)?;
            tracing::info!(group = %group, interface = %interface, "joined multicast group");
        }

        socket.set_nonblocking(true).map_err(map_err)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(map_err)?;

        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Local address, useful when bound to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram; `Ok(None)` after the 100 ms timeout.
    pub async fn recv(&mut self) -> Result<Option<&[u8]>, SourceError> {
        match tokio::time::timeout(UDP_RECV_TIMEOUT, self.socket.recv(&mut self.buf)).await {
            Ok(Ok(len)) => Ok(Some(&self.buf[..len])),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }
}
