//! One EDI/UDP destination

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::SinkError;
use crate::sender::UdpDestinationConfig;

/// A bound UDP destination socket.
pub struct UdpDestination {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpDestination {
    /// Bind according to the destination block: optional source address
    /// and port, TTL, and multicast egress interface.
    pub fn open(config: &UdpDestinationConfig) -> Result<Self, SinkError> {
        let target = SocketAddr::new(IpAddr::V4(config.dest_addr), config.dest_port);
        let map_err = |e: std::io::Error| SinkError::Open {
            destination: target.to_string(),
            source: e,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;

        let bind_addr = SocketAddr::new(
            IpAddr::V4(config.source_addr.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            config.source_port.unwrap_or(0),
        );
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.bind(&bind_addr.into()).map_err(map_err)?;

        if let Some(ttl) = config.ttl {
            socket.set_ttl(ttl).map_err(map_err)?;
            socket.set_multicast_ttl_v4(ttl).map_err(map_err)?;
        }
        if config.dest_addr.is_multicast() {
            if let Some(interface) = config.source_addr {
                socket.set_multicast_if_v4(&interface).map_err(map_err)?;
            }
        }

        socket.set_nonblocking(true).map_err(map_err)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(map_err)?;

        Ok(Self { socket, target })
    }

    pub async fn write(&self, packet: &[u8]) -> Result<(), SinkError> {
        self.socket.send_to(packet, self.target).await?;
        Ok(())
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}
