//! Tests for the stats document shape

use super::*;
use std::time::Duration;

use edibridge_scheduler::SchedulerSettings;
use edibridge_sources::SourceConfig;

use crate::control::{ControlPlane, Mode, DEFAULT_SWITCH_DELAY};

fn context(delay_ms: Option<i64>) -> StatsContext {
    let scheduler = Arc::new(Scheduler::new(SchedulerSettings {
        delay_ms,
        ..Default::default()
    }));
    let sources = vec![Arc::new(SourceShared::new(&SourceConfig {
        hostname: "edi.example.com".into(),
        port: 9201,
        enabled: true,
    }))];
    let control = Arc::new(ControlPlane::new(
        Mode::Merging,
        DEFAULT_SWITCH_DELAY,
        sources,
        Arc::clone(&scheduler),
    ));
    StatsContext::new(
        scheduler,
        control,
        SenderStatsHandle::default(),
        "edi-tcp-bridge -c edi.example.com:9201".into(),
    )
}

#[test]
fn document_serialises_with_expected_fields() {
    let ctx = context(Some(500));
    ctx.control.sources[0].margins.push(120.0);
    ctx.control.sources[0].record_rx();

    let doc = build(&ctx);
    let json = serde_json::to_value(&doc).unwrap();

    let input = &json["inputs"][0];
    assert_eq!(input["hostname"], "edi.example.com");
    assert_eq!(input["port"], 9201);
    assert_eq!(input["connected"], true);
    assert_eq!(input["active"], true);
    assert_eq!(input["enabled"], true);
    assert_eq!(input["stats"]["num_connects"], 1);
    assert_eq!(input["stats"]["margin"]["num_measurements"], 1);
    assert_eq!(input["stats"]["margin"]["mean"], 120.0);
    // margin + delay
    assert_eq!(input["stats"]["margin"]["mean_to_delivery"], 620.0);

    let stamp = input["last_packet_received_at"].as_str().unwrap();
    assert!(stamp.ends_with('Z') && stamp.contains('T'), "got {stamp}");

    assert!(json["main"]["process_uptime"].is_u64());
    assert_eq!(json["output"]["num_frames"], 0);
    assert_eq!(json["output"]["in_backoff"], false);
    assert!(json["output"]["tcp_stats"].as_array().unwrap().is_empty());
}

#[test]
fn no_delay_leaves_delivery_margins_null() {
    let ctx = context(None);
    ctx.control.sources[0].margins.push(50.0);

    let json = serde_json::to_value(build(&ctx)).unwrap();
    assert!(json["inputs"][0]["stats"]["margin"]["mean_to_delivery"].is_null());
    // never connected: empty timestamp, zero uptime
    assert_eq!(json["inputs"][0]["last_packet_received_at"], "");
    assert_eq!(json["inputs"][0]["connection_uptime"], 0);
}

#[test]
fn backoff_is_reflected() {
    let ctx = context(None);
    ctx.scheduler.inhibit();
    std::thread::sleep(Duration::from_millis(5));

    let json = serde_json::to_value(build(&ctx)).unwrap();
    assert_eq!(json["output"]["in_backoff"], true);
    assert!(json["output"]["backoff_remain_ms"].as_u64().unwrap() > 0);
}
