//! End-to-end scheduler scenarios: ordering, merge, gaps, backoff

use super::*;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::scheduler::{PushOutcome, Scheduler, SchedulerSettings};
use edibridge_protocol::{FrameTimestamp, TagPacket};

/// Timestamp `offset_ms` away from the current wall clock.
fn ts_from_now(offset_ms: i64) -> FrameTimestamp {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    let edi_nanos = since_epoch.as_nanos() as i128 - 946_684_800i128 * 1_000_000_000;
    let units = edi_nanos * 16384 / 1_000_000_000 + i128::from(offset_ms) * 16384 / 1000;
    let units = units.max(0) as u64;
    FrameTimestamp::new((units / 16384) as u32, (units % 16384) as u32)
}

fn tp(origin: &str, dlfc: u16, timestamp: FrameTimestamp) -> TagPacket {
    TagPacket {
        origins: vec![origin.to_string()],
        seq: Default::default(),
        dlfc,
        timestamp,
        afpacket: vec![0xab; 32],
        received_at: Instant::now(),
    }
}

struct Harness {
    scheduler: Arc<Scheduler>,
    rx: mpsc::Receiver<ReleasedFrame>,
    cancel: CancellationToken,
}

fn start(settings: SchedulerSettings) -> Harness {
    let scheduler = Arc::new(Scheduler::new(settings));
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&scheduler).run(tx, cancel.clone()));
    Harness {
        scheduler,
        rx,
        cancel,
    }
}

async fn recv_n(rx: &mut mpsc::Receiver<ReleasedFrame>, n: usize) -> Vec<ReleasedFrame> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for released frame")
            .expect("channel closed early");
        out.push(frame);
    }
    out
}

/// Single source, timestamps in order, nothing late.
#[tokio::test(flavor = "multi_thread")]
async fn single_source_ideal() {
    let mut h = start(SchedulerSettings {
        delay_ms: Some(0),
        drop_late: true,
        ..Default::default()
    });

    // ~1 ms frame spacing keeps the test fast; ordering is what matters
    for i in 0..250u16 {
        let outcome = h
            .scheduler
            .push_tagpacket(tp("a", i, ts_from_now(200 + i64::from(i))));
        assert_eq!(outcome, PushOutcome::Inserted);
    }

    let frames = recv_n(&mut h.rx, 250).await;
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.dlfc, i as u16);
    }
    for pair in frames.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp, "ordering violated");
    }

    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.num_frames, 250);
    assert_eq!(snapshot.num_dropped_frames, 0);
    assert_eq!(snapshot.late_score, 0);
    h.cancel.cancel();
}

/// Burst arrival in reverse order; transmissions emerge
/// timestamp-ascending.
#[tokio::test(flavor = "multi_thread")]
async fn reversed_burst_is_reordered() {
    let mut h = start(SchedulerSettings {
        delay_ms: Some(1000),
        drop_late: true,
        ..Default::default()
    });

    for i in (0..250u16).rev() {
        let outcome = h
            .scheduler
            .push_tagpacket(tp("a", i, ts_from_now(-500 + i64::from(i))));
        assert_eq!(outcome, PushOutcome::Inserted);
    }

    let frames = recv_n(&mut h.rx, 250).await;
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.dlfc, i as u16);
    }
    for pair in frames.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    assert_eq!(h.scheduler.snapshot().num_dropped_frames, 0);
    h.cancel.cancel();
}

/// Two mirrored sources; exactly one copy out,
/// origins record both labels.
#[tokio::test(flavor = "multi_thread")]
async fn mirrored_sources_merge() {
    let mut h = start(SchedulerSettings {
        delay_ms: Some(1000),
        drop_late: true,
        ..Default::default()
    });

    let stamps: Vec<FrameTimestamp> = (0..250).map(|i| ts_from_now(-500 + i)).collect();
    for (i, stamp) in stamps.iter().enumerate() {
        assert_eq!(
            h.scheduler.push_tagpacket(tp("a:9001", i as u16, *stamp)),
            PushOutcome::Inserted
        );
    }
    for (i, stamp) in stamps.iter().enumerate() {
        assert_eq!(
            h.scheduler.push_tagpacket(tp("b:9001", i as u16, *stamp)),
            PushOutcome::Merged {
                dlfc_mismatch: false
            }
        );
    }

    let frames = recv_n(&mut h.rx, 250).await;
    for frame in &frames {
        assert_eq!(frame.origins.len(), 2);
        assert!(frame.origins.contains(&"a:9001".to_string()));
        assert!(frame.origins.contains(&"b:9001".to_string()));
    }
    assert_eq!(h.scheduler.snapshot().num_frames, 250);
    h.cancel.cancel();
}

/// A mirror with disagreeing DLFC still transmits once per
/// timestamp.
#[tokio::test(flavor = "multi_thread")]
async fn mirrored_sources_with_dlfc_mismatch() {
    let mut h = start(SchedulerSettings {
        delay_ms: Some(1000),
        drop_late: true,
        ..Default::default()
    });

    let stamps: Vec<FrameTimestamp> = (0..50).map(|i| ts_from_now(-500 + i)).collect();
    for (i, stamp) in stamps.iter().enumerate() {
        h.scheduler.push_tagpacket(tp("a:9001", i as u16, *stamp));
    }
    for (i, stamp) in stamps.iter().enumerate() {
        assert_eq!(
            h.scheduler
                .push_tagpacket(tp("b:9001", i as u16 + 1, *stamp)),
            PushOutcome::Merged {
                dlfc_mismatch: true
            }
        );
    }

    let frames = recv_n(&mut h.rx, 50).await;
    assert_eq!(frames.len(), 50);
    h.cancel.cancel();
}

/// A DLFC gap triggers exactly one discontinuity and a
/// backoff window; transmissions resume afterwards.
#[tokio::test(flavor = "multi_thread")]
async fn dlfc_gap_backs_off_then_resumes() {
    let mut h = start(SchedulerSettings {
        delay_ms: Some(30),
        drop_late: false,
        backoff: Duration::from_millis(150),
        ..Default::default()
    });

    // live pushes, 10 ms apart, with a jump from dlfc 9 to 15
    let mut received = Vec::new();
    let mut pushed = 0u32;
    for i in 0..40u16 {
        let dlfc = if i < 10 { i } else { i + 5 };
        h.scheduler.push_tagpacket(tp("a", dlfc, ts_from_now(0)));
        pushed += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
        while let Ok(frame) = h.rx.try_recv() {
            received.push(frame.dlfc);
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(frame) = h.rx.try_recv() {
        received.push(frame.dlfc);
    }
    assert_eq!(pushed, 40);

    let snapshot = h.scheduler.snapshot();
    assert_eq!(snapshot.num_dlfc_discontinuities, 1);
    assert!(snapshot.num_dropped_frames > 0, "backoff dropped nothing");

    // frames before the gap, the frame that exposed it, and a consecutive
    // run after the backoff
    assert!(received.starts_with(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 15]));
    let after_gap = &received[11..];
    assert!(!after_gap.is_empty(), "no frames after backoff");
    for pair in after_gap.windows(2) {
        assert_eq!(pair[0] + 1, pair[1], "post-backoff run not contiguous");
    }
    h.cancel.cancel();
}

/// A frame at or behind the release point is never transmitted and
/// counts once into num_dropped.
#[tokio::test(flavor = "multi_thread")]
async fn frame_behind_release_point_never_transmits() {
    let mut h = start(SchedulerSettings::default());

    let stamp = ts_from_now(0);
    h.scheduler.push_tagpacket(tp("a", 1, stamp));
    let first = recv_n(&mut h.rx, 1).await;
    assert_eq!(first[0].dlfc, 1);

    assert_eq!(
        h.scheduler.push_tagpacket(tp("b", 1, stamp)),
        PushOutcome::DuplicateLate
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.rx.try_recv().is_err());
    assert_eq!(h.scheduler.snapshot().num_dropped_frames, 1);
    h.cancel.cancel();
}

/// A frame that is late at release time is dropped under drop_late
/// and transmitted otherwise. A frame becomes release-late when the
/// operator shrinks the delay while it sits in the buffer, so the loop is
/// started only after the settings change.
#[tokio::test(flavor = "multi_thread")]
async fn release_time_lateness_honours_drop_late() {
    for drop_late in [true, false] {
        let scheduler = Arc::new(Scheduler::new(SchedulerSettings {
            delay_ms: Some(500),
            drop_late,
            ..Default::default()
        }));

        // on time under the 500 ms delay...
        assert_eq!(
            scheduler.push_tagpacket(tp("a", 2, ts_from_now(-100))),
            PushOutcome::Inserted
        );
        // ...but late once the delay is gone
        scheduler.update_settings(SchedulerSettings {
            delay_ms: Some(0),
            drop_late,
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&scheduler).run(tx, cancel.clone()));

        if drop_late {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(rx.try_recv().is_err());
            assert_eq!(scheduler.snapshot().num_dropped_frames, 1);
        } else {
            let frame = recv_n(&mut rx, 1).await.remove(0);
            assert_eq!(frame.dlfc, 2);
            assert_eq!(scheduler.snapshot().num_dropped_frames, 0);
        }
        cancel.cancel();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_the_loop() {
    let h = start(SchedulerSettings::default());
    h.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // a push after cancellation stays buffered forever; just ensure no
    // panic and the scheduler is still usable for snapshots
    h.scheduler.push_tagpacket(tp("a", 1, ts_from_now(1000)));
    let _ = h.scheduler.snapshot();
}
