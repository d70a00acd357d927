//! edi-tcp-bridge: buffer, merge or switch EDI/TCP inputs and re-emit
//! them over UDP (with FEC), TCP and optionally ZMQ.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edibridge::control::{ControlPlane, Mode, DEFAULT_SWITCH_DELAY};
use edibridge::rc::RcContext;
use edibridge::stats::StatsContext;
use edibridge::{logging, rc, signals};
use edibridge_scheduler::{Scheduler, SchedulerSettings};
use edibridge_sinks::zmq::ZmqEtiOutput;
use edibridge_sinks::{
    DestinationConfig, Sender, SenderConfig, UdpDestinationConfig, DEFAULT_SPREADING_FACTOR,
    DEFAULT_TAGPACKET_ALIGNMENT,
};
use edibridge_sources::{Receiver, SourceConfig, SourceShared, MAX_SOURCES};

/// Bridge EDI/TCP sources to EDI/UDP, EDI/TCP and ZMQ outputs.
#[derive(Parser, Debug)]
#[command(name = "edi-tcp-bridge", version)]
struct Cli {
    /// Add an enabled input, host:port (repeatable)
    #[arg(short = 'c', value_name = "host:port")]
    connect: Vec<String>,

    /// Add a disabled input, host:port (repeatable)
    #[arg(short = 'F', value_name = "host:port")]
    fallback: Vec<String>,

    /// Input coordination: merge or switch
    #[arg(short = 'm', default_value = "merge")]
    mode: Mode,

    /// Delay after an input interruption before switching, in ms
    #[arg(long = "switch-delay", value_name = "ms")]
    switch_delay: Option<u64>,

    /// Keep every frame until TIST is this many ms after system time;
    /// negative values release ahead of the timestamp
    #[arg(short = 'w', value_name = "ms", allow_hyphen_values = true)]
    delay: Option<i64>,

    /// Transmit frames whose release instant already passed instead of
    /// dropping them
    #[arg(long = "no-drop-late")]
    no_drop_late: bool,

    /// Milliseconds of output silence after an interruption
    #[arg(short = 'b', value_name = "ms", default_value_t = 5000)]
    backoff: u64,

    /// Run this script first and only start if it returns 0 (e.g. an NTP
    /// synchronisation check)
    #[arg(short = 'C', value_name = "script")]
    startup_check: Option<String>,

    /// Enable the UNIX DGRAM remote control socket at this path
    #[arg(short = 'r', value_name = "socket_path")]
    rc_socket: Option<PathBuf>,

    /// PFT FEC setting, 0 disables protection
    #[arg(short = 'f', value_name = "fec", default_value_t = 0)]
    fec: u8,

    /// Interleave percentage: 0 sends all fragments at once, 100 spreads
    /// them over 24 ms, more interleaves further
    #[arg(short = 'i', value_name = "percent")]
    interleave: Option<i32>,

    /// Dump the emitted EDI to edi.debug
    #[arg(short = 'D')]
    dump: bool,

    /// Increase verbosity (can be given more than once)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Alignment of the TAG packets
    #[arg(long = "align", default_value_t = DEFAULT_TAGPACKET_ALIGNMENT)]
    align: usize,

    /// Force all outputs to send AF packets
    #[arg(long = "without-pft", conflicts_with = "with_pft")]
    without_pft: bool,

    /// Force all outputs to send PF packets
    #[arg(long = "with-pft")]
    with_pft: bool,

    /// Send one live-statistics datagram per frame to 127.0.0.1:port
    #[arg(long = "live-stats-port", default_value_t = 0)]
    live_stats_port: u16,

    /// UDP destination ip (repeatable, one per destination)
    #[arg(short = 'd', value_name = "ip")]
    dest_ip: Vec<Ipv4Addr>,

    /// UDP destination port (repeatable, paired with -d by position)
    #[arg(short = 'p', value_name = "port")]
    dest_port: Vec<u16>,

    /// UDP source port (all destinations or none)
    #[arg(short = 's', value_name = "port")]
    source_port: Vec<u16>,

    /// UDP source ip, selects the multicast egress interface
    #[arg(short = 'S', value_name = "ip")]
    source_ip: Vec<Ipv4Addr>,

    /// Packet TTL (all destinations or none)
    #[arg(short = 't', value_name = "ttl")]
    ttl: Vec<u32>,

    /// Add an EDI/TCP listener on this port (repeatable)
    #[arg(short = 'T', value_name = "port")]
    tcp_listen: Vec<u16>,

    /// ZMQ PUB endpoint for the reconstructed ETI, e.g. *:8001
    #[arg(short = 'z', value_name = "intf:port")]
    zmq: Option<String>,
}

fn parse_host_port(spec: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("source {spec:?} does not contain host:port"))?;
    if host.is_empty() {
        bail!("source {spec:?} does not contain host:port");
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {spec:?}"))?;
    Ok((host.to_string(), port))
}

/// Pair the positional -d/-p/-s/-S/-t flag lists into destination blocks.
fn udp_destinations(cli: &Cli) -> anyhow::Result<Vec<UdpDestinationConfig>> {
    if cli.dest_ip.len() != cli.dest_port.len() {
        bail!("-d and -p must be given once per UDP destination");
    }
    for (flag, len) in [
        ("-s", cli.source_port.len()),
        ("-S", cli.source_ip.len()),
        ("-t", cli.ttl.len()),
    ] {
        if len != 0 && len != cli.dest_ip.len() {
            bail!("{flag} must be given for all UDP destinations or none");
        }
    }

    Ok(cli
        .dest_ip
        .iter()
        .enumerate()
        .map(|(i, ip)| UdpDestinationConfig {
            dest_addr: *ip,
            dest_port: cli.dest_port[i],
            source_addr: cli.source_ip.get(i).copied(),
            source_port: cli.source_port.get(i).copied(),
            ttl: cli.ttl.get(i).copied(),
        })
        .collect())
}

fn run_startup_check(script: &str) -> anyhow::Result<()> {
    info!(script, "running startup check");
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .status()
        .context("startup check could not run")?;
    if !status.success() {
        bail!("startup check failed, returned {status}");
    }
    info!("startup check ok");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = logging::init(cli.verbose);

    eprintln!(
        "edi-tcp-bridge {} starting up",
        env!("CARGO_PKG_VERSION")
    );

    if let Some(script) = &cli.startup_check {
        run_startup_check(script)?;
    }

    // inputs
    let mut source_configs = Vec::new();
    for (spec, enabled) in cli
        .connect
        .iter()
        .map(|s| (s, true))
        .chain(cli.fallback.iter().map(|s| (s, false)))
    {
        let (hostname, port) = parse_host_port(spec)?;
        source_configs.push(SourceConfig {
            hostname,
            port,
            enabled,
        });
    }
    if source_configs.is_empty() {
        bail!("no sources given");
    }
    if source_configs.len() > MAX_SOURCES {
        bail!("max {MAX_SOURCES} sources supported");
    }
    if !source_configs.iter().any(|s| s.enabled) {
        warn!("starting up with zero enabled sources, did you forget a -c option?");
    }

    // outputs
    let mut destinations: Vec<DestinationConfig> = udp_destinations(&cli)?
        .into_iter()
        .map(DestinationConfig::Udp)
        .collect();
    let num_udp = destinations.len();
    for port in &cli.tcp_listen {
        destinations.push(DestinationConfig::TcpServer { listen_port: *port });
    }
    let num_tcp = cli.tcp_listen.len();

    if destinations.is_empty() && cli.zmq.is_none() {
        bail!("no destinations set");
    }

    let enable_pft = if cli.with_pft {
        true
    } else if cli.without_pft {
        false
    } else if num_udp > 0 && num_tcp > 0 {
        bail!("both EDI/UDP and EDI/TCP outputs configured, specify --with-pft or --without-pft");
    } else {
        num_udp > 0
    };

    let fragment_spreading_factor = match cli.interleave {
        Some(percent) if percent < 0 => bail!("negative interleave value is invalid"),
        Some(percent) => f64::from(percent) / 100.0,
        None => DEFAULT_SPREADING_FACTOR,
    };

    let settings = SchedulerSettings {
        delay_ms: cli.delay,
        drop_late: !cli.no_drop_late,
        backoff: Duration::from_millis(cli.backoff),
        live_stats_port: cli.live_stats_port,
    };
    match settings.delay_ms {
        Some(delay) => info!(delay_ms = delay, "setting up bridge with delay"),
        None => info!("setting up bridge without delay"),
    }

    let cancel = CancellationToken::new();
    signals::install(cancel.clone());

    // first fatal error wins; everything else shuts down cooperatively
    let fatal: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let report_fatal = {
        let fatal = Arc::clone(&fatal);
        let cancel = cancel.clone();
        move |error: anyhow::Error| {
            fatal.lock().get_or_insert(error);
            cancel.cancel();
        }
    };

    let scheduler = Arc::new(Scheduler::new(settings));

    // ZMQ ETI output
    let eti_tx = match &cli.zmq {
        Some(endpoint) => {
            let output = ZmqEtiOutput::new(endpoint);
            info!(endpoint = %output.endpoint(), "ZMQ output enabled");
            let (tx, rx) = mpsc::channel(16);
            let cancel = cancel.clone();
            let report_fatal = report_fatal.clone();
            tokio::spawn(async move {
                if let Err(e) = output.run(rx, cancel).await {
                    report_fatal(anyhow::Error::new(e).context("ZMQ output failed"));
                }
            });
            Some(tx)
        }
        None => {
            info!("ZMQ output disabled");
            None
        }
    };

    // sender
    let sender = Sender::open(
        SenderConfig {
            destinations,
            enable_pft,
            fec: cli.fec,
            fragment_spreading_factor,
            tagpacket_alignment: cli.align,
            dump: cli.dump,
        },
        cancel.clone(),
    )
    .await?;
    let sender_stats = sender.stats_handle();
    sender.print_configuration();

    let (frames_tx, frames_rx) = mpsc::channel(64);
    tokio::spawn(Arc::clone(&scheduler).run(frames_tx, cancel.clone()));
    tokio::spawn(sender.run(frames_rx, cancel.clone()));

    // inputs and arbitration
    let sources: Vec<Arc<SourceShared>> = source_configs
        .iter()
        .map(|config| Arc::new(SourceShared::new(config)))
        .collect();
    info!("EDI inputs");
    for source in &sources {
        info!(
            "  {} {}",
            source.label(),
            if source.is_enabled() { "enabled" } else { "disabled" }
        );
    }

    let switch_delay = cli
        .switch_delay
        .map_or(DEFAULT_SWITCH_DELAY, Duration::from_millis);
    let control = Arc::new(ControlPlane::new(
        cli.mode,
        switch_delay,
        sources.clone(),
        Arc::clone(&scheduler),
    ));
    tokio::spawn(Arc::clone(&control).run(cancel.clone()));

    for source in &sources {
        let receiver = Receiver::new(
            Arc::clone(source),
            Arc::clone(&scheduler),
            eti_tx.clone(),
        );
        let cancel = cancel.clone();
        let report_fatal = report_fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = receiver.run(cancel).await {
                report_fatal(anyhow::Error::new(e).context("receiver failed"));
            }
        });
    }

    // remote control
    let stats_ctx = Arc::new(StatsContext::new(
        Arc::clone(&scheduler),
        Arc::clone(&control),
        sender_stats,
        std::env::args().collect::<Vec<_>>().join(" "),
    ));
    if let Some(path) = cli.rc_socket.clone() {
        let ctx = RcContext {
            stats: Arc::clone(&stats_ctx),
            log: log.clone(),
        };
        let cancel = cancel.clone();
        let report_fatal = report_fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = rc::run(path, ctx, cancel).await {
                report_fatal(anyhow::Error::new(e).context("RC socket failed"));
            }
        });
    }

    cancel.cancelled().await;

    // let the last log lines reach stderr
    tokio::time::sleep(Duration::from_millis(300)).await;

    if let Some(error) = fatal.lock().take() {
        return Err(error);
    }
    info!("shutdown complete");
    Ok(())
}
