//! The stats document
//!
//! One JSON shape serves both the remote control `stats` command and the
//! HTTP endpoint. Snapshots are taken per request; no lock is held while
//! serialising.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use edibridge_scheduler::Scheduler;
use edibridge_sinks::SenderStatsHandle;
use edibridge_sources::{SourceShared, SourceSnapshot};

use crate::control::ControlPlane;

/// Everything the stats document and the RC need to see.
pub struct StatsContext {
    pub scheduler: Arc<Scheduler>,
    pub control: Arc<ControlPlane>,
    pub sender_stats: SenderStatsHandle,
    pub startup: Instant,
    /// The full command line, served at `/`.
    pub command_line: String,
}

impl StatsContext {
    pub fn new(
        scheduler: Arc<Scheduler>,
        control: Arc<ControlPlane>,
        sender_stats: SenderStatsHandle,
        command_line: String,
    ) -> Self {
        Self {
            scheduler,
            control,
            sender_stats,
            startup: Instant::now(),
            command_line,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsDocument {
    pub inputs: Vec<InputDocument>,
    pub main: MainDocument,
    pub output: OutputDocument,
}

#[derive(Debug, Serialize)]
pub struct InputDocument {
    pub hostname: String,
    pub port: u16,
    pub last_packet_received_at: String,
    pub connection_uptime: u64,
    pub connected: bool,
    pub active: bool,
    pub enabled: bool,
    pub stats: InputCounters,
}

#[derive(Debug, Serialize)]
pub struct InputCounters {
    pub margin: MarginDocument,
    pub num_late_frames: u64,
    pub num_connects: u64,
    pub most_recent_connect_error: String,
    pub most_recent_connect_error_timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct MarginDocument {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub mean_to_delivery: Option<f64>,
    pub min_to_delivery: Option<f64>,
    pub max_to_delivery: Option<f64>,
    pub stdev: f64,
    pub num_measurements: usize,
}

#[derive(Debug, Serialize)]
pub struct MainDocument {
    pub poll_timeouts: u64,
    pub process_uptime: u64,
}

#[derive(Debug, Serialize)]
pub struct OutputDocument {
    pub num_frames: u64,
    pub late_score: u32,
    pub num_dlfc_discontinuities: u64,
    pub num_queue_overruns: u64,
    pub num_dropped_frames: u64,
    pub backoff_remain_ms: u64,
    pub in_backoff: bool,
    pub tcp_stats: Vec<TcpDocument>,
}

#[derive(Debug, Serialize)]
pub struct TcpDocument {
    pub listen_port: u16,
    pub num_connections: usize,
}

/// `YYYY-MM-DDTHH:MM:SSZ`, or empty like the zero time_t.
fn format_wallclock(at: Option<SystemTime>) -> String {
    match at {
        Some(at) => DateTime::<Utc>::from(at)
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string(),
        None => String::new(),
    }
}

fn input_document(snapshot: SourceSnapshot, delay_ms: Option<i64>) -> InputDocument {
    let margin = snapshot.margin;
    let to_delivery = |m: f64| delay_ms.map(|d| m + d as f64);

    InputDocument {
        hostname: snapshot.hostname,
        port: snapshot.port,
        last_packet_received_at: format_wallclock(snapshot.last_packet_wall),
        connection_uptime: snapshot
            .connection_uptime
            .map_or(0, |d| d.as_millis() as u64),
        connected: snapshot.connected,
        active: snapshot.active,
        enabled: snapshot.enabled,
        stats: InputCounters {
            margin: MarginDocument {
                mean: margin.mean,
                min: margin.min,
                max: margin.max,
                mean_to_delivery: to_delivery(margin.mean),
                min_to_delivery: to_delivery(margin.min),
                max_to_delivery: to_delivery(margin.max),
                stdev: margin.stdev,
                num_measurements: margin.num_measurements,
            },
            num_late_frames: snapshot.num_late,
            num_connects: snapshot.num_connects,
            most_recent_connect_error: snapshot
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
            most_recent_connect_error_timestamp: format_wallclock(
                snapshot.last_error.map(|e| e.timestamp),
            ),
        },
    }
}

/// Assemble the full document from fresh snapshots.
pub fn build(ctx: &StatsContext) -> StatsDocument {
    let delay_ms = ctx.scheduler.settings().delay_ms;
    let output = ctx.scheduler.snapshot();

    StatsDocument {
        inputs: ctx
            .control
            .sources
            .iter()
            .map(|s: &Arc<SourceShared>| input_document(s.snapshot(), delay_ms))
            .collect(),
        main: MainDocument {
            poll_timeouts: ctx.control.poll_timeouts(),
            process_uptime: ctx.startup.elapsed().as_millis() as u64,
        },
        output: OutputDocument {
            num_frames: output.num_frames,
            late_score: output.late_score,
            num_dlfc_discontinuities: output.num_dlfc_discontinuities,
            num_queue_overruns: output.num_queue_overruns,
            num_dropped_frames: output.num_dropped_frames,
            backoff_remain_ms: output.backoff_remain_ms,
            in_backoff: output.in_backoff,
            tcp_stats: ctx
                .sender_stats
                .tcp_stats()
                .into_iter()
                .map(|t| TcpDocument {
                    listen_port: t.listen_port,
                    num_connections: t.num_connections,
                })
                .collect(),
        },
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod tests;
