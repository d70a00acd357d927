//! Timestamped frame scheduler with redundant-input coordination
//!
//! The heart of the bridge. Frames from one or several concurrent sources
//! are merged into a single buffer ordered strictly by their in-band
//! transmit timestamp, deduplicated against mirrored arrivals, and
//! released to the output at a wall-clock instant derived from that
//! timestamp.
//!
//! # Flow
//!
//! ```text
//! receiver tasks ──► push_tagpacket ──► ordered buffer ──► release task ──► sender
//!                      (classify)         (BTreeMap)        (sleep_until)
//! ```
//!
//! [`Scheduler::push_tagpacket`] classifies each arrival (inserted,
//! merged with a mirror copy, late, duplicate-and-late, or inhibited) and
//! the caller attributes per-source late counts from the returned
//! [`PushOutcome`]. The release loop in [`Scheduler::run`] pops the head,
//! sleeps until its release instant, and hands it to the output channel.
//!
//! # Locking
//!
//! One mutex guards the buffer and its scalar companions
//! (`most_recent_timestamp`, the inhibit deadline, the health score). It
//! is held only for map edits and scalar updates, never across sleeps,
//! sends or serialisation.

mod release;
mod scheduler;

pub use release::ReleasedFrame;
pub use scheduler::{OutputSnapshot, PushOutcome, Scheduler, SchedulerSettings};

/// Hard bound on buffered frames; overflow drops the oldest entry.
pub const MAX_PENDING: usize = 1000;

/// Health score bump per late frame.
pub const LATE_SCORE_INCREASE: u32 = 10;

/// Health score ceiling.
pub const LATE_SCORE_MAX: u32 = 200;

/// At or above this score the output reports itself unhappy.
pub const LATE_SCORE_THRESHOLD: u32 = 100;

/// Default post-incident output silence.
pub const DEFAULT_BACKOFF_MS: u64 = 5000;
