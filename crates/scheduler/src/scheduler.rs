//! The ordering buffer and its insertion ladder

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use edibridge_protocol::{FrameTimestamp, TagPacket};

use crate::{DEFAULT_BACKOFF_MS, LATE_SCORE_INCREASE, LATE_SCORE_MAX, LATE_SCORE_THRESHOLD, MAX_PENDING};

/// Runtime-adjustable scheduler settings.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Release target relative to TIST, may be negative. `None` releases
    /// immediately in arrival order.
    pub delay_ms: Option<i64>,
    /// Drop frames that would be released after their release instant.
    pub drop_late: bool,
    /// Output silence after an incident.
    pub backoff: Duration,
    /// When non-zero, one JSON datagram per released frame goes to
    /// 127.0.0.1:port.
    pub live_stats_port: u16,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            delay_ms: None,
            drop_late: true,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            live_stats_port: 0,
        }
    }
}

/// Classification of one arrival, in decision order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Entered the buffer as a new frame.
    Inserted,
    /// Mirror copy of a buffered frame; origins were merged.
    Merged {
        /// The mirrors disagreed on DLFC.
        dlfc_mismatch: bool,
    },
    /// At or behind the most recently released timestamp.
    DuplicateLate,
    /// The output is inside its backoff window.
    Inhibited,
    /// Release instant already passed on arrival.
    Late,
}

impl PushOutcome {
    /// Whether the origin source should count this arrival as late.
    pub fn is_late(&self) -> bool {
        matches!(self, PushOutcome::Late | PushOutcome::DuplicateLate)
    }
}

/// Point-in-time counters for the stats document.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OutputSnapshot {
    pub num_frames: u64,
    pub late_score: u32,
    pub num_dlfc_discontinuities: u64,
    pub num_queue_overruns: u64,
    pub num_dropped_frames: u64,
    pub backoff_remain_ms: u64,
    pub in_backoff: bool,
    pub buffered_frames: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub num_frames: AtomicU64,
    pub num_dropped: AtomicU64,
    pub num_queue_overruns: AtomicU64,
    pub num_dlfc_discontinuities: AtomicU64,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub pending: BTreeMap<FrameTimestamp, TagPacket>,
    pub most_recent_timestamp: Option<FrameTimestamp>,
    pub inhibit_until: Option<Instant>,
    pub late_score: u32,
    /// DLFC of the last transmitted frame; cleared by `inhibit` so the
    /// first frame after a backoff does not retrigger it.
    pub prev_dlfc: Option<u16>,
}

/// The timestamp-ordered merge queue and its release policy state.
#[derive(Debug)]
pub struct Scheduler {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) settings: RwLock<SchedulerSettings>,
    pub(crate) counters: Counters,
    /// Mirror of `Inner::late_score` for lock-free health reads.
    late_score: AtomicU32,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings: RwLock::new(settings),
            counters: Counters::default(),
            late_score: AtomicU32::new(0),
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        *self.settings.read()
    }

    pub fn update_settings(&self, settings: SchedulerSettings) {
        *self.settings.write() = settings;
    }

    /// Wall-clock instant at which a frame should leave the output.
    pub(crate) fn release_time(timestamp: FrameTimestamp, delay_ms: i64) -> SystemTime {
        let nominal = timestamp.to_system_time();
        if delay_ms >= 0 {
            nominal + Duration::from_millis(delay_ms as u64)
        } else {
            nominal - Duration::from_millis(delay_ms.unsigned_abs())
        }
    }

    /// Insert one arrival. The caller attributes per-source late counts
    /// from the returned outcome.
    pub fn push_tagpacket(&self, tp: TagPacket) -> PushOutcome {
        let settings = self.settings();

        let late = match settings.delay_ms {
            // No valid scheduling time counts as late when delaying.
            Some(_) if !tp.timestamp.valid() => true,
            Some(delay) => Self::release_time(tp.timestamp, delay) < SystemTime::now(),
            None => false,
        };

        let mut inner = self.inner.lock();

        if let Some(most_recent) = inner.most_recent_timestamp {
            if most_recent.valid() && most_recent >= tp.timestamp {
                tracing::debug!(
                    dlfc = tp.dlfc,
                    origins = ?tp.origins,
                    "dup&late tagpacket dropped"
                );
                self.counters.num_dropped.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::DuplicateLate;
            }
        }

        if let Some(until) = inner.inhibit_until {
            if Instant::now() < until {
                self.counters.num_dropped.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Inhibited;
            }
        }

        if late {
            inner.late_score = (inner.late_score + LATE_SCORE_INCREASE).min(LATE_SCORE_MAX);
            self.late_score.store(inner.late_score, Ordering::Relaxed);
            tracing::debug!(
                dlfc = tp.dlfc,
                score = inner.late_score,
                origins = ?tp.origins,
                "late tagpacket dropped"
            );
            return PushOutcome::Late;
        }

        let outcome = match inner.pending.entry(tp.timestamp) {
            std::collections::btree_map::Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                let dlfc_mismatch = existing.dlfc != tp.dlfc;
                if dlfc_mismatch {
                    tracing::warn!(
                        buffered = existing.dlfc,
                        arrived = tp.dlfc,
                        origins = ?tp.origins,
                        "dlfc err: mirrored frames disagree"
                    );
                } else {
                    tracing::debug!(dlfc = tp.dlfc, origins = ?tp.origins, "dup merged");
                }
                existing.merge_origins(&tp);
                PushOutcome::Merged { dlfc_mismatch }
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(tp);
                PushOutcome::Inserted
            }
        };

        // Every on-time frame walks the health score back down.
        if inner.late_score > 0 {
            inner.late_score -= 1;
            self.late_score.store(inner.late_score, Ordering::Relaxed);
        }

        if inner.pending.len() > MAX_PENDING {
            inner.pending.pop_first();
            self.counters
                .num_queue_overruns
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!("ordering buffer overrun, dropped oldest frame");
        }

        outcome
    }

    /// Recovery action after loss of lock: silence the output for the
    /// backoff duration, flush the buffer, forget the health score.
    pub fn inhibit(&self) {
        let backoff = self.settings().backoff;
        let mut inner = self.inner.lock();
        inner.inhibit_until = Some(Instant::now() + backoff);
        inner.pending.clear();
        inner.late_score = 0;
        inner.prev_dlfc = None;
        self.late_score.store(0, Ordering::Relaxed);
        tracing::info!(backoff_ms = backoff.as_millis() as u64, "output inhibited");
    }

    /// Health check consulted by the switching control plane.
    pub fn is_running_ok(&self) -> bool {
        self.late_score.load(Ordering::Relaxed) < LATE_SCORE_THRESHOLD
    }

    pub fn late_score(&self) -> u32 {
        self.late_score.load(Ordering::Relaxed)
    }

    /// Remaining backoff, zero when the output is live.
    pub fn backoff_remaining(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.inhibit_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        let backoff_remain = self.backoff_remaining();
        OutputSnapshot {
            num_frames: self.counters.num_frames.load(Ordering::Relaxed),
            late_score: self.late_score(),
            num_dlfc_discontinuities: self
                .counters
                .num_dlfc_discontinuities
                .load(Ordering::Relaxed),
            num_queue_overruns: self.counters.num_queue_overruns.load(Ordering::Relaxed),
            num_dropped_frames: self.counters.num_dropped.load(Ordering::Relaxed),
            backoff_remain_ms: backoff_remain.as_millis() as u64,
            in_backoff: !backoff_remain.is_zero(),
            buffered_frames: self.inner.lock().pending.len(),
        }
    }

    pub fn reset_counters(&self) {
        self.counters.num_frames.store(0, Ordering::Relaxed);
        self.counters.num_dropped.store(0, Ordering::Relaxed);
        self.counters.num_queue_overruns.store(0, Ordering::Relaxed);
        self.counters
            .num_dlfc_discontinuities
            .store(0, Ordering::Relaxed);
    }

    /// Number of buffered frames, for tests and stats.
    pub fn buffered(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;
