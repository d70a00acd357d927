//! Per-source EDI/TCP receiver
//!
//! One task per source runs the state machine:
//!
//! ```text
//!  Disabled ──enable──► Disconnected ──connect ok──► Connected
//!     ▲                    │  ▲                        │
//!     │                    │  │ backoff elapsed        │  recv error / EOF / disable
//!     │                    └──┘                        │
//!     └────────────────── disable ────────────────────┘
//! ```
//!
//! A connection counts as established on its first received byte, not on
//! the TCP handshake; that is what `num_connects` and the uptime track.
//! Protocol errors fail only the frame being assembled.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use edibridge_protocol::eti::{reconstruct, EtiFrame, EtiParts};
use edibridge_protocol::tag::{FcData, ReceivedTagPacket, SubchannelData};
use edibridge_protocol::{DataCollector, ProtocolError, StreamDecoder, TagPacket};
use edibridge_scheduler::Scheduler;

use crate::error::SourceError;
use crate::source::SourceShared;

/// Wait between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(480);

/// TCP keepalive: idle time before probes, probe interval, probe count.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const KEEPALIVE_RETRIES: u32 = 3;

/// One receive batch.
const RECV_CHUNK: usize = 32;

/// How often a quiet connection re-checks the active flag.
const ACTIVITY_POLL: Duration = Duration::from_millis(100);

/// Per-source receiver task.
pub struct Receiver {
    source: Arc<SourceShared>,
    scheduler: Arc<Scheduler>,
    eti_tx: Option<mpsc::Sender<EtiFrame>>,
}

impl Receiver {
    pub fn new(
        source: Arc<SourceShared>,
        scheduler: Arc<Scheduler>,
        eti_tx: Option<mpsc::Sender<EtiFrame>>,
    ) -> Self {
        Self {
            source,
            scheduler,
            eti_tx,
        }
    }

    /// Run until cancelled. Returns early only on a fatal decoder error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if !self.source.is_active() {
                tokio::select! {
                    _ = tokio::time::sleep(ACTIVITY_POLL) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
                continue;
            }

            match self.connect().await {
                Ok(stream) => {
                    tracing::info!(source = %self.source.label(), "connected");
                    self.serve_connection(stream, &cancel).await?;
                    self.source.set_disconnected();
                }
                Err(e) => {
                    tracing::debug!(source = %self.source.label(), error = %e, "connect failed");
                    self.source.record_connect_error(e.to_string());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream =
            TcpStream::connect((self.source.hostname.as_str(), self.source.port)).await?;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(source = %self.source.label(), error = %e, "keepalive setup failed");
        }

        Ok(stream)
    }

    /// Read until EOF, error, disable or cancellation. Ok(()) means the
    /// connection ended and a reconnect may follow.
    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let mut decoder = StreamDecoder::new();
        let mut collector = FrameCollector::new(
            Arc::clone(&self.source),
            Arc::clone(&self.scheduler),
            self.eti_tx.clone(),
        );
        let mut buf = [0u8; RECV_CHUNK];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                _ = tokio::time::sleep(ACTIVITY_POLL) => {
                    if !self.source.is_active() {
                        tracing::info!(source = %self.source.label(), "disconnecting, no longer active");
                        return Ok(());
                    }
                }

                read = stream.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(source = %self.source.label(), "remote closed connection");
                        return Ok(());
                    }
                    Ok(n) => {
                        decoder.push_bytes(&buf[..n], &mut collector);
                        if let Some(fatal) = collector.take_fatal() {
                            return Err(SourceError::Fatal {
                                source_label: self.source.label(),
                                source: fatal,
                            });
                        }
                        self.source.record_rx();
                        if !self.source.is_active() {
                            tracing::info!(source = %self.source.label(), "disconnecting, no longer active");
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                        // same handling as a disconnect
                        tracing::debug!(source = %self.source.label(), "connection refused");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::error!(source = %self.source.label(), error = %e, "receive error");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Decoder event sink for one connection.
///
/// Accumulates the per-frame state (frame characterisation, FIC,
/// sub-channels) and turns each completed frame into a [`TagPacket`] for
/// the scheduler, plus an [`EtiFrame`] when the ZMQ output is active.
struct FrameCollector {
    source: Arc<SourceShared>,
    scheduler: Arc<Scheduler>,
    eti_tx: Option<mpsc::Sender<EtiFrame>>,

    proto_valid: bool,
    fc: Option<FcData>,
    fic: Vec<u8>,
    subchannels: Vec<SubchannelData>,
    err: u8,
    mnsc: u16,
    rfu: u16,

    fatal: Option<ProtocolError>,
}

impl FrameCollector {
    fn new(
        source: Arc<SourceShared>,
        scheduler: Arc<Scheduler>,
        eti_tx: Option<mpsc::Sender<EtiFrame>>,
    ) -> Self {
        Self {
            source,
            scheduler,
            eti_tx,
            proto_valid: false,
            fc: None,
            fic: Vec::new(),
            subchannels: Vec::new(),
            err: 0,
            mnsc: 0xffff,
            rfu: 0xffff,
            fatal: None,
        }
    }

    fn reset_frame(&mut self) {
        self.fc = None;
        self.fic.clear();
        self.subchannels.clear();
        self.err = 0;
        self.mnsc = 0xffff;
        self.rfu = 0xffff;
    }

    fn take_fatal(&mut self) -> Option<ProtocolError> {
        self.fatal.take()
    }
}

impl DataCollector for FrameCollector {
    fn update_protocol(
        &mut self,
        proto: &str,
        major: u16,
        minor: u16,
    ) -> edibridge_protocol::Result<()> {
        if proto != "DETI" || major != 0 || minor != 0 {
            return Err(ProtocolError::UnsupportedProtocol {
                proto: proto.to_string(),
                major,
                minor,
            });
        }
        self.proto_valid = true;
        Ok(())
    }

    fn update_fc_data(&mut self, fc: FcData) -> edibridge_protocol::Result<()> {
        if !self.proto_valid {
            return Err(ProtocolError::MissingProtocol("deti"));
        }
        self.fc = Some(fc);
        Ok(())
    }

    fn update_fic(&mut self, fic: Vec<u8>) -> edibridge_protocol::Result<()> {
        self.fic = fic;
        Ok(())
    }

    fn update_err(&mut self, err: u8) {
        self.err = err;
    }

    fn update_edi_time(&mut self, _utco: u8, _seconds: u32) {}

    fn update_mnsc(&mut self, mnsc: u16) {
        self.mnsc = mnsc;
    }

    fn update_rfu(&mut self, rfu: u16) {
        self.rfu = rfu;
    }

    fn add_subchannel(&mut self, stc: SubchannelData) -> edibridge_protocol::Result<()> {
        if !self.proto_valid {
            return Err(ProtocolError::MissingProtocol("est"));
        }
        self.subchannels.push(stc);
        Ok(())
    }

    fn assemble(&mut self, tag: ReceivedTagPacket) {
        let Some(fc) = self.fc else {
            // decoder only assembles frames that carried deti
            return;
        };

        let margin = tag.timestamp.margin_ms(SystemTime::now());
        self.source.margins.push(margin as f64);

        if let Some(eti_tx) = &self.eti_tx {
            let parts = EtiParts {
                fc,
                err: self.err,
                fic: std::mem::take(&mut self.fic),
                subchannels: std::mem::take(&mut self.subchannels),
                mnsc: self.mnsc,
                rfu: self.rfu,
                timestamp: tag.timestamp,
            };
            match reconstruct(&parts) {
                Ok(frame) => {
                    if eti_tx.try_send(frame).is_err() {
                        tracing::debug!(source = %self.source.label(), "ETI channel full, frame dropped");
                    }
                }
                Err(e @ ProtocolError::EtiOverflow(_)) => {
                    self.fatal = Some(e);
                    return;
                }
                Err(e) => {
                    tracing::debug!(source = %self.source.label(), error = %e, "ETI reconstruction failed");
                }
            }
        }

        let tp = TagPacket {
            origins: vec![self.source.label()],
            seq: tag.seq,
            dlfc: fc.dlfc,
            timestamp: tag.timestamp,
            afpacket: tag.tagpacket,
            received_at: Instant::now(),
        };
        let outcome = self.scheduler.push_tagpacket(tp);
        if outcome.is_late() {
            self.source.record_late();
        }

        self.reset_frame();
    }

    fn frame_failed(&mut self, error: &ProtocolError) {
        tracing::debug!(source = %self.source.label(), error = %error, "frame failed, resetting state");
        self.reset_frame();
    }
}

#[cfg(test)]
#[path = "receiver_test.rs"]
mod tests;
