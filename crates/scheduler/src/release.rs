//! The release worker: pop, sleep, transmit

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use edibridge_protocol::{TagPacket, DLFC_MODULO};

use crate::scheduler::Scheduler;

/// What the sender receives: the frame exactly as scheduled.
pub type ReleasedFrame = TagPacket;

/// Idle poll interval when the buffer is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Buffering statistics are logged once per this many frames (≈ 6 s).
const STATS_WINDOW: u16 = 250;

#[derive(Debug, Clone, Copy)]
struct BufferingStat {
    buffering_time_us: u64,
    late: bool,
    inhibited: bool,
}

/// Best-effort JSON firehose towards a local listener.
struct LiveStats {
    socket: Option<UdpSocket>,
}

impl LiveStats {
    fn new() -> Self {
        Self { socket: None }
    }

    fn send(&mut self, port: u16, payload: &serde_json::Value) {
        if self.socket.is_none() {
            self.socket = UdpSocket::bind("127.0.0.1:0").ok();
        }
        if let Some(socket) = &self.socket {
            let _ = socket.send_to(payload.to_string().as_bytes(), ("127.0.0.1", port));
        }
    }
}

impl Scheduler {
    /// Release loop. Pops the buffer head, waits for its release instant,
    /// and hands it to `tx`. Runs until cancelled or the sender side goes
    /// away.
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<ReleasedFrame>, cancel: CancellationToken) {
        let mut window: Vec<BufferingStat> = Vec::with_capacity(usize::from(STATS_WINDOW));
        let mut live_stats = LiveStats::new();
        let mut in_backoff = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let popped = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_first() {
                    Some((timestamp, tp)) => {
                        inner.most_recent_timestamp = Some(timestamp);
                        Some(tp)
                    }
                    None => None,
                }
            };

            let Some(tp) = popped else {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            };

            let settings = self.settings();
            let dlfc = tp.dlfc;
            let timestamp = tp.timestamp;
            let origins = tp.origins.clone();

            // Delayed release: wait until TIST + delay if that is still
            // ahead of us.
            let mut late = false;
            if let Some(delay) = settings.delay_ms {
                if timestamp.valid() {
                    let t_release = Self::release_time(timestamp, delay);
                    match t_release.duration_since(SystemTime::now()) {
                        Ok(wait) if !wait.is_zero() => {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = cancel.cancelled() => break,
                            }
                        }
                        _ => late = true,
                    }
                } else {
                    late = true;
                }
            }

            let inhibited = !self.backoff_remaining().is_zero();
            window.push(BufferingStat {
                buffering_time_us: tp.received_at.elapsed().as_micros() as u64,
                late,
                inhibited,
            });

            let mut transmitted = false;
            if late && settings.drop_late {
                self.counters.num_dropped.fetch_add(1, Ordering::Relaxed);
            } else if inhibited {
                self.counters.num_dropped.fetch_add(1, Ordering::Relaxed);
                in_backoff = true;
            } else {
                if in_backoff {
                    tracing::info!("backoff ended");
                    in_backoff = false;
                }

                self.counters.num_frames.fetch_add(1, Ordering::Relaxed);
                if tx.send(tp).await.is_err() {
                    tracing::debug!("output channel closed, release loop exiting");
                    break;
                }
                transmitted = true;

                let discontinuity = {
                    let mut inner = self.inner.lock();
                    let gap = matches!(
                        inner.prev_dlfc,
                        Some(prev) if prev.wrapping_add(1) % DLFC_MODULO != dlfc
                    );
                    inner.prev_dlfc = Some(dlfc);
                    gap
                };
                if discontinuity {
                    self.counters
                        .num_dlfc_discontinuities
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(dlfc, "DLFC discontinuity, backing off");
                    self.inhibit();
                }
            }

            if settings.live_stats_port != 0 {
                live_stats.send(
                    settings.live_stats_port,
                    &serde_json::json!({
                        "dlfc": dlfc,
                        "seconds": timestamp.seconds,
                        "tsta": timestamp.tsta,
                        "transmitted": transmitted,
                        "late": late,
                        "inhibited": inhibited,
                        "buffered": self.buffered(),
                        "origins": origins,
                    }),
                );
            }

            if dlfc % STATS_WINDOW == 0 && !window.is_empty() {
                log_buffering_stats(&window, timestamp.tsta);
                window.clear();
            }
        }
    }
}

fn log_buffering_stats(window: &[BufferingStat], tsta: u32) {
    let n = window.len() as f64;
    let times_ms: Vec<f64> = window
        .iter()
        .map(|s| s.buffering_time_us as f64 / 1000.0)
        .collect();
    let min = times_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = times_ms.iter().sum::<f64>() / n;
    let variance = times_ms.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / n;

    let num_late = window.iter().filter(|s| s.late).count();
    let num_inhibited = window.iter().filter(|s| s.inhibited).count();

    tracing::info!(
        min_ms = min,
        max_ms = max,
        mean_ms = mean,
        stdev_ms = variance.sqrt(),
        late = num_late,
        late_pct = num_late as f64 * 100.0 / n,
        inhibited = num_inhibited,
        inhibited_pct = num_inhibited as f64 * 100.0 / n,
        frame0_ts = tsta as f64 / 16384.0,
        "buffering time statistics"
    );
}

#[cfg(test)]
#[path = "release_test.rs"]
mod tests;
