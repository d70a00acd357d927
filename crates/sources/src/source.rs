//! Per-source configuration and live state
//!
//! [`SourceShared`] is the state every party reads: the receiver task
//! mutates it, the control plane arbitrates on it, the remote control
//! toggles `enabled`, and the stats document snapshots it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use crate::margin::{MarginStats, MarginWindow};

/// Static configuration of one input.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub hostname: String,
    pub port: u16,
    /// User intent at startup; -c gives enabled, -F disabled inputs.
    pub enabled: bool,
}

/// The most recent connect failure, kept for the stats document.
#[derive(Debug, Clone)]
pub struct ConnectError {
    pub message: String,
    pub timestamp: SystemTime,
}

/// Live state of one source, shared between tasks.
#[derive(Debug)]
pub struct SourceShared {
    pub hostname: String,
    pub port: u16,

    /// User intent, toggled through the remote control.
    enabled: AtomicBool,
    /// Scheduler intent: whether this source should be connected. In
    /// merging mode it follows `enabled`; in switching mode exactly one
    /// source is active.
    active: AtomicBool,
    connected: AtomicBool,

    num_connects: AtomicU64,
    num_late: AtomicU64,

    last_rx: Mutex<Option<Instant>>,
    last_rx_wall: Mutex<Option<SystemTime>>,
    reconnected_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<ConnectError>>,

    pub margins: MarginWindow,
}

/// Point-in-time view for the stats document.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub hostname: String,
    pub port: u16,
    pub enabled: bool,
    pub active: bool,
    pub connected: bool,
    pub num_connects: u64,
    pub num_late: u64,
    pub last_packet_wall: Option<SystemTime>,
    pub connection_uptime: Option<Duration>,
    pub last_error: Option<ConnectError>,
    pub margin: MarginStats,
}

impl SourceShared {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            port: config.port,
            enabled: AtomicBool::new(config.enabled),
            active: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            num_connects: AtomicU64::new(0),
            num_late: AtomicU64::new(0),
            last_rx: Mutex::new(None),
            last_rx_wall: Mutex::new(None),
            reconnected_at: Mutex::new(None),
            last_error: Mutex::new(None),
            margins: MarginWindow::new(),
        }
    }

    /// `host:port`, the label used in origins, logs and RC commands.
    pub fn label(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn num_late(&self) -> u64 {
        self.num_late.load(Ordering::Relaxed)
    }

    pub fn record_late(&self) {
        self.num_late.fetch_add(1, Ordering::Relaxed);
    }

    /// Note a successful receive; the first one after a connect marks the
    /// connection established.
    pub fn record_rx(&self) {
        let now = Instant::now();
        *self.last_rx.lock() = Some(now);
        *self.last_rx_wall.lock() = Some(SystemTime::now());
        if !self.connected.swap(true, Ordering::Relaxed) {
            self.num_connects.fetch_add(1, Ordering::Relaxed);
            *self.reconnected_at.lock() = Some(now);
        }
    }

    pub fn record_connect_error(&self, message: String) {
        *self.last_error.lock() = Some(ConnectError {
            message,
            timestamp: SystemTime::now(),
        });
    }

    /// Age of the most recent packet; `None` before the first one.
    pub fn time_since_last_packet(&self) -> Option<Duration> {
        self.last_rx.lock().map(|at| at.elapsed())
    }

    pub fn reset_counters(&self) {
        self.num_late.store(0, Ordering::Relaxed);
        self.num_connects.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            hostname: self.hostname.clone(),
            port: self.port,
            enabled: self.is_enabled(),
            active: self.is_active(),
            connected: self.is_connected(),
            num_connects: self.num_connects.load(Ordering::Relaxed),
            num_late: self.num_late(),
            last_packet_wall: *self.last_rx_wall.lock(),
            connection_uptime: self
                .is_connected()
                .then(|| self.reconnected_at.lock().map(|at| at.elapsed()))
                .flatten(),
            last_error: self.last_error.lock().clone(),
            margin: self.margins.stats(),
        }
    }
}
