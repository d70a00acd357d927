//! Merge/switch control plane
//!
//! In merging mode every enabled source is active and the scheduler
//! deduplicates their frames. In switching mode exactly one source is
//! active; the arbitration tick rotates to the next enabled source when
//! the active one goes silent, is disabled by the operator, or the
//! output reports itself unhappy. At most one rotation happens per tick.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use edibridge_scheduler::Scheduler;
use edibridge_sources::SourceShared;

/// Arbitration period: ten frame durations, like the poll horizon of the
/// receive loop.
pub const ARBITRATION_TICK: Duration = Duration::from_millis(240);

/// Silence on the active source before switching away from it.
pub const DEFAULT_SWITCH_DELAY: Duration = Duration::from_millis(2000);

/// Input coordination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Merging,
    Switching,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Mode::Merging),
            "switch" => Ok(Mode::Switching),
            other => Err(format!("invalid mode {other:?}, expected merge or switch")),
        }
    }
}

impl Mode {
    /// Name used in the `get settings` reply.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Merging => "merging",
            Mode::Switching => "switching",
        }
    }
}

/// Owns source activation. Sources stay for the process lifetime.
pub struct ControlPlane {
    pub mode: Mode,
    pub switch_delay: Duration,
    pub sources: Vec<Arc<SourceShared>>,
    scheduler: Arc<Scheduler>,
    poll_timeouts: AtomicU64,
}

impl ControlPlane {
    pub fn new(
        mode: Mode,
        switch_delay: Duration,
        sources: Vec<Arc<SourceShared>>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let plane = Self {
            mode,
            switch_delay,
            sources,
            scheduler,
            poll_timeouts: AtomicU64::new(0),
        };
        if plane.mode == Mode::Switching {
            plane.ensure_one_active();
        } else {
            plane.arbitrate();
        }
        plane
    }

    pub fn poll_timeouts(&self) -> u64 {
        self.poll_timeouts.load(Ordering::Relaxed)
    }

    pub fn reset_poll_timeouts(&self) {
        self.poll_timeouts.store(0, Ordering::Relaxed);
    }

    /// Activate the first enabled source if none is active.
    pub fn ensure_one_active(&self) {
        if self.sources.iter().any(|s| s.is_active()) {
            return;
        }
        if let Some(source) = self.sources.iter().find(|s| s.is_enabled()) {
            tracing::info!(source = %source.label(), "activating first input");
            source.set_active(true);
        }
    }

    /// One arbitration pass.
    pub fn arbitrate(&self) {
        match self.mode {
            Mode::Merging => {
                for source in &self.sources {
                    source.set_active(source.is_enabled());
                }
            }
            Mode::Switching => self.arbitrate_switching(),
        }
    }

    fn arbitrate_switching(&self) {
        let num_active = self.sources.iter().filter(|s| s.is_active()).count();
        if num_active > 1 {
            tracing::error!("switching error: more than one input active");
        }

        let Some(active_idx) = self.sources.iter().position(|s| s.is_active()) else {
            self.ensure_one_active();
            return;
        };
        let active = &self.sources[active_idx];

        let mut force_switch = false;
        if !active.is_enabled() {
            tracing::info!(source = %active.label(), "unset active, disabled by operator");
            active.set_active(false);
            force_switch = true;
        }

        let silent = match active.time_since_last_packet() {
            Some(age) => age > self.switch_delay,
            None => true,
        };
        let output_unhappy = !self.scheduler.is_running_ok();

        if !(force_switch || silent || output_unhappy) {
            return;
        }

        // rotate through the sources in declaration order
        let mut switched = false;
        for offset in 1..self.sources.len() {
            let candidate = &self.sources[(active_idx + offset) % self.sources.len()];
            if candidate.is_enabled() {
                active.set_active(false);
                candidate.set_active(true);
                switched = true;
                tracing::warn!(
                    from = %active.label(),
                    to = %candidate.label(),
                    "switching inputs because of lack of data"
                );
                break;
            }
        }

        if !switched {
            self.ensure_one_active();
        }
    }

    /// Arbitration loop plus liveness accounting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ARBITRATION_TICK) => {}
            }

            self.arbitrate();

            let any_data = self.sources.iter().any(|s| {
                matches!(s.time_since_last_packet(), Some(age) if age <= ARBITRATION_TICK)
            });
            if !any_data {
                self.poll_timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
#[path = "control_test.rs"]
mod tests;
