//! Loopback tests for the TCP receiver

use super::*;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use edibridge_protocol::tagbuild::{DetiFields, TagPacketBuilder};
use edibridge_protocol::{af, FrameTimestamp};
use edibridge_scheduler::SchedulerSettings;

use crate::source::SourceConfig;

fn frame_bytes(dlfc: u16, seconds: u32) -> Vec<u8> {
    let tagpacket = TagPacketBuilder::new()
        .ptr("DETI", 0, 0)
        .deti(&DetiFields {
            fc: FcData {
                dlfc,
                fct: (dlfc % 250) as u8,
                fp: (dlfc % 8) as u8,
                mid: 1,
                ficf: false,
                tsta: 0,
            },
            time: Some((32, FrameTimestamp::new(seconds, 0))),
            ..Default::default()
        })
        .build();
    af::encode(dlfc, &tagpacket)
}

fn harness(addr: SocketAddr) -> (Arc<SourceShared>, Arc<Scheduler>, Receiver) {
    let source = Arc::new(SourceShared::new(&SourceConfig {
        hostname: addr.ip().to_string(),
        port: addr.port(),
        enabled: true,
    }));
    source.set_active(true);
    let scheduler = Arc::new(Scheduler::new(SchedulerSettings::default()));
    let receiver = Receiver::new(Arc::clone(&source), Arc::clone(&scheduler), None);
    (source, scheduler, receiver)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3 s");
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_flow_into_the_scheduler() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for i in 0..5u16 {
            stream.write_all(&frame_bytes(i, 1000 + u32::from(i))).await.unwrap();
        }
        // hold the connection open
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (source, scheduler, receiver) = harness(addr);
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    wait_until(|| scheduler.buffered() == 5).await;

    let snapshot = source.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.num_connects, 1);
    assert_eq!(snapshot.margin.num_measurements, 5);
    assert!(snapshot.connection_uptime.is_some());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn inactive_source_stays_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (source, _scheduler, receiver) = harness(addr);
    source.set_active(false);
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    let accepted =
        tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accepted.is_err(), "inactive source must not connect");
    assert!(!source.is_connected());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_remote_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for round in 0..2u16 {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&frame_bytes(round, 2000 + u32::from(round))).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(stream);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (source, _scheduler, receiver) = harness(addr);
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    wait_until(|| source.snapshot().num_connects == 2).await;
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_before_protocol_announcement_are_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // deti without a preceding *ptr
        let tagpacket = TagPacketBuilder::new()
            .deti(&DetiFields {
                fc: FcData {
                    dlfc: 1,
                    ..Default::default()
                },
                time: Some((32, FrameTimestamp::new(3000, 0))),
                ..Default::default()
            })
            .build();
        stream.write_all(&af::encode(1, &tagpacket)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (source, scheduler, receiver) = harness(addr);
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    wait_until(|| source.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // the frame failed locally; connection survives, nothing buffered
    assert_eq!(scheduler.buffered(), 0);
    assert!(source.is_connected());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn deactivation_disconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&frame_bytes(0, 4000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (source, _scheduler, receiver) = harness(addr);
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    wait_until(|| source.is_connected()).await;
    source.set_active(false);
    wait_until(|| !source.is_connected()).await;
    cancel.cancel();
}
