//! The Sender: released frames → AF (+ PFT) → destinations

use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use edibridge_protocol::{af, pft, tagbuild, TagPacket, FRAME_PERIOD_MS};

use crate::error::SinkError;
use crate::tcp_server::{TcpServerDestination, TcpServerShared};
use crate::udp::UdpDestination;
use crate::{DEFAULT_SPREADING_FACTOR, DEFAULT_TAGPACKET_ALIGNMENT};

/// One `-d/-p/-s/-S/-t` destination block.
#[derive(Debug, Clone)]
pub struct UdpDestinationConfig {
    pub dest_addr: Ipv4Addr,
    pub dest_port: u16,
    pub source_addr: Option<Ipv4Addr>,
    pub source_port: Option<u16>,
    pub ttl: Option<u32>,
}

/// A configured output.
#[derive(Debug, Clone)]
pub enum DestinationConfig {
    Udp(UdpDestinationConfig),
    TcpServer { listen_port: u16 },
}

/// Output-side configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub destinations: Vec<DestinationConfig>,
    /// Emit PF packets instead of plain AF packets.
    pub enable_pft: bool,
    /// FEC level for PFT, 0 disables protection.
    pub fec: u8,
    /// Fraction of the 24 ms frame period over which fragments of one AF
    /// packet are spread; 0 sends them back to back.
    pub fragment_spreading_factor: f64,
    /// TAG packets are padded to this many bytes.
    pub tagpacket_alignment: usize,
    /// Append the emitted AF stream to `edi.debug`.
    pub dump: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            enable_pft: false,
            fec: 0,
            fragment_spreading_factor: DEFAULT_SPREADING_FACTOR,
            tagpacket_alignment: DEFAULT_TAGPACKET_ALIGNMENT,
            dump: false,
        }
    }
}

/// Per-listener connection count for the stats document.
#[derive(Debug, Clone, Copy)]
pub struct TcpListenerStats {
    pub listen_port: u16,
    pub num_connections: usize,
}

/// Remains valid after `run()` consumes the sender.
#[derive(Clone, Default)]
pub struct SenderStatsHandle {
    tcp: Vec<Arc<TcpServerShared>>,
    frames_sent: Arc<AtomicU64>,
}

impl SenderStatsHandle {
    pub fn tcp_stats(&self) -> Vec<TcpListenerStats> {
        self.tcp
            .iter()
            .map(|shared| TcpListenerStats {
                listen_port: shared.listen_port,
                num_connections: shared.num_connections(),
            })
            .collect()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

enum Destination {
    Udp(UdpDestination),
    Tcp(TcpServerDestination),
}

/// Emits every released frame to all destinations.
pub struct Sender {
    config: SenderConfig,
    destinations: Vec<Destination>,
    stats: SenderStatsHandle,
    /// Fallback sequence counters for frames whose source numbering was
    /// not preserved.
    af_seq: u16,
    pseq: u16,
    dump: Option<std::fs::File>,
}

impl Sender {
    /// Open all destinations. TCP listeners start accepting immediately.
    pub async fn open(config: SenderConfig, cancel: CancellationToken) -> Result<Self, SinkError> {
        let mut destinations = Vec::with_capacity(config.destinations.len());
        let mut stats = SenderStatsHandle::default();

        for dest in &config.destinations {
            match dest {
                DestinationConfig::Udp(udp) => {
                    let dest = UdpDestination::open(udp)?;
                    tracing::info!(target = %dest.target(), "EDI/UDP destination ready");
                    destinations.push(Destination::Udp(dest));
                }
                DestinationConfig::TcpServer { listen_port } => {
                    let server = TcpServerDestination::open(*listen_port, cancel.clone()).await?;
                    stats.tcp.push(server.shared());
                    destinations.push(Destination::Tcp(server));
                }
            }
        }

        let dump = if config.dump {
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open("edi.debug")?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            destinations,
            stats,
            af_seq: 0,
            pseq: 0,
            dump,
        })
    }

    pub fn stats_handle(&self) -> SenderStatsHandle {
        self.stats.clone()
    }

    pub fn print_configuration(&self) {
        for dest in &self.destinations {
            match dest {
                Destination::Udp(udp) => {
                    tracing::info!(target = %udp.target(), pft = self.config.enable_pft, fec = self.config.fec, "output: EDI/UDP")
                }
                Destination::Tcp(tcp) => {
                    tracing::info!(port = tcp.listen_port(), pft = self.config.enable_pft, "output: EDI/TCP server")
                }
            }
        }
    }

    /// Consume released frames until the channel closes or cancellation.
    pub async fn run(mut self, mut rx: mpsc::Receiver<TagPacket>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(tp) => {
                        if let Err(e) = self.send_frame(tp).await {
                            tracing::warn!(error = %e, "frame emission failed");
                        }
                    }
                    None => break,
                }
            }
        }
        tracing::info!("sender stopped");
    }

    /// Emit one frame: exactly one AF packet, optionally as PFT
    /// fragments, to each destination.
    pub async fn send_frame(&mut self, tp: TagPacket) -> Result<(), SinkError> {
        let mut tagpacket = tp.afpacket;
        tagbuild::pad_to_alignment(&mut tagpacket, self.config.tagpacket_alignment);

        // Preserve the source's AF sequence end to end.
        let seq = if tp.seq.seq_valid {
            tp.seq.seq
        } else {
            self.af_seq
        };
        self.af_seq = seq.wrapping_add(1);

        let afpacket = af::encode(seq, &tagpacket);

        if let Some(dump) = &mut self.dump {
            if let Err(e) = dump.write_all(&afpacket) {
                tracing::warn!(error = %e, "EDI dump write failed");
            }
        }

        if self.config.enable_pft {
            // Reuse the AF sequence as PSEQ when the source had no PFT,
            // so downstream multihoming still lines up.
            let pseq = if tp.seq.pseq_valid {
                tp.seq.pseq
            } else if tp.seq.seq_valid {
                tp.seq.seq
            } else {
                self.pseq
            };
            self.pseq = pseq.wrapping_add(1);

            let fragments = pft::fragment(
                &afpacket,
                pseq,
                self.config.fec,
                pft::DEFAULT_FRAGMENT_SIZE,
            )?;

            let gap = spreading_gap(self.config.fragment_spreading_factor, fragments.len());
            let last = fragments.len() - 1;
            for (i, fragment) in fragments.into_iter().enumerate() {
                self.emit(Bytes::from(fragment)).await;
                if i != last && !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
            }
        } else {
            self.emit(Bytes::from(afpacket)).await;
        }

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn emit(&mut self, packet: Bytes) {
        for dest in &mut self.destinations {
            match dest {
                Destination::Udp(udp) => {
                    if let Err(e) = udp.write(&packet).await {
                        tracing::warn!(target = %udp.target(), error = %e, "UDP send failed");
                    }
                }
                Destination::Tcp(tcp) => tcp.write(&packet),
            }
        }
    }
}

/// Pause between fragments so one AF packet's fragments cover
/// `factor × 24 ms`.
fn spreading_gap(factor: f64, num_fragments: usize) -> Duration {
    if factor <= 0.0 || num_fragments < 2 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(factor * FRAME_PERIOD_MS as f64 / 1000.0 / num_fragments as f64)
}

#[cfg(test)]
#[path = "sender_test.rs"]
mod tests;
