//! edi-udp-bridge: receive EDI over (multicast) UDP, optionally deframe
//! MPE or GSE satellite payloads, strip the PFT layer and serve the AF
//! stream as an EDI/TCP server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use edibridge::web::{self, StatsSource};
use edibridge::{logging, signals};
use edibridge_deframe::{GseConfig, GseDeframer, MpeConfig, MpeDeframer};
use edibridge_protocol::AfPacketExtractor;
use edibridge_sinks::{TcpServerDestination, TcpServerShared};
use edibridge_sources::{UdpReceiver, UdpReceiverConfig};

/// Serve a multicast EDI feed as an EDI/TCP server.
#[derive(Parser, Debug)]
#[command(name = "edi-udp-bridge", version)]
struct Cli {
    /// Receive UDP on this port
    #[arg(short = 'p', value_name = "port")]
    port: u16,

    /// Bind the receive socket to this address
    #[arg(short = 'b', value_name = "address", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Receive from this multicast group
    #[arg(short = 'm', value_name = "address")]
    mcast: Option<Ipv4Addr>,

    /// Decode MPE with the given PID:IP:PORT filter
    #[arg(short = 'F', value_name = "PID:IP:PORT", conflicts_with = "gse")]
    mpe: Option<String>,

    /// Decode GSE for the given MIS, optionally filtered to IP:PORT
    #[arg(short = 'G', value_name = "MIS[:IP:PORT]")]
    gse: Option<String>,

    /// Listen on this TCP port (repeatable)
    #[arg(short = 'T', value_name = "port")]
    tcp_listen: Vec<u16>,

    /// Serve statistics over HTTP at host:port
    #[arg(long = "http", value_name = "host:port")]
    http: Option<String>,

    /// Increase verbosity (can be given more than once)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

enum Deframer {
    None,
    Mpe(MpeDeframer),
    Gse(GseDeframer),
}

impl Deframer {
    /// Deframed EDI packets for one received datagram.
    fn process(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Deframer::None => vec![datagram.to_vec()],
            Deframer::Mpe(mpe) => {
                mpe.process_packet(datagram);
                mpe.take_deframed()
            }
            Deframer::Gse(gse) => {
                gse.process_packet(datagram);
                gse.take_deframed()
            }
        }
    }
}

struct BridgeStats {
    command_line: String,
    startup: Instant,
    num_frames: Arc<AtomicU64>,
    servers: Vec<Arc<TcpServerShared>>,
}

impl StatsSource for BridgeStats {
    fn index(&self) -> String {
        self.command_line.clone()
    }

    fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "main": {
                "process_uptime": self.startup.elapsed().as_millis() as u64,
            },
            "output": {
                "num_frames": self.num_frames.load(Ordering::Relaxed),
                "tcp_stats": self.servers.iter().map(|s| serde_json::json!({
                    "listen_port": s.listen_port,
                    "num_connections": s.num_connections(),
                })).collect::<Vec<_>>(),
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    eprintln!(
        "edi-udp-bridge {} starting up",
        env!("CARGO_PKG_VERSION")
    );

    if cli.tcp_listen.is_empty() {
        bail!("no EDI destinations set");
    }

    let mut deframer = match (&cli.mpe, &cli.gse) {
        (Some(spec), _) => {
            let config = MpeConfig::from_spec(spec)?;
            info!(pid = config.pid, ip = %config.ip, port = config.port, "MPE deframer enabled");
            Deframer::Mpe(MpeDeframer::new(config))
        }
        (None, Some(spec)) => {
            let config = GseConfig::from_spec(spec)?;
            info!(mis = config.mis, filter = ?config.filter, "GSE deframer enabled");
            Deframer::Gse(GseDeframer::new(config))
        }
        (None, None) => Deframer::None,
    };

    let cancel = CancellationToken::new();
    signals::install(cancel.clone());

    let mut servers = Vec::new();
    for port in &cli.tcp_listen {
        servers.push(TcpServerDestination::open(*port, cancel.clone()).await?);
    }

    let num_frames = Arc::new(AtomicU64::new(0));

    if let Some(http) = &cli.http {
        let address: SocketAddr = http
            .parse()
            .with_context(|| format!("invalid --http address {http:?}"))?;
        let stats = Arc::new(BridgeStats {
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            startup: Instant::now(),
            num_frames: Arc::clone(&num_frames),
            servers: servers.iter().map(|s| s.shared()).collect(),
        });
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(address, stats, cancel).await {
                tracing::error!(error = %e, "webserver failed");
            }
        });
    }

    let mut receiver = UdpReceiver::bind(&UdpReceiverConfig {
        port: cli.port,
        bind: cli.bind,
        mcast: cli.mcast,
    })?;
    info!(port = cli.port, bind = %cli.bind, "EDI/UDP input ready");

    let mut extractor = AfPacketExtractor::new();
    let mut events = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => {
                let datagram = match received {
                    Ok(Some(datagram)) => datagram.to_vec(),
                    Ok(None) => continue, // receive timeout
                    Err(e) => {
                        debug!(error = %e, "UDP receive error");
                        continue;
                    }
                };

                for edi_packet in deframer.process(&datagram) {
                    extractor.push_bytes(&edi_packet, &mut events);
                }
                for event in events.drain(..) {
                    match event {
                        Ok(extracted) => {
                            let afpacket = Bytes::from(extracted.afpacket);
                            for server in &servers {
                                server.write(&afpacket);
                            }
                            num_frames.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => debug!(error = %e, "EDI packet rejected"),
                    }
                }
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("shutdown complete");
    Ok(())
}
