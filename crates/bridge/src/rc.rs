//! UNIX-datagram remote control
//!
//! ASCII commands in, one JSON envelope per reply:
//! `{"status": "ok", "cmd": ..., "response": ...}` or
//! `{"status": "error", "cmd": ..., "message": ...}`.
//!
//! Commands: `get settings`, `stats`, `set input enable|disable
//! <host:port>`, `set delay <ms|null>`, `set backoff <ms>`,
//! `set live_stats_port <port>`, `set verbose 0..3`, `reset counters`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixDatagram;
use tokio_util::sync::CancellationToken;

use crate::logging::LogHandle;
use crate::stats::{self, StatsContext};

/// What the command handlers operate on.
pub struct RcContext {
    pub stats: Arc<StatsContext>,
    pub log: LogHandle,
}

/// Execute one command. `Ok(None)` means success without a response body.
pub fn handle_command(
    ctx: &RcContext,
    cmd: &str,
) -> Result<Option<serde_json::Value>, String> {
    let scheduler = &ctx.stats.scheduler;

    if cmd.starts_with("get settings") {
        let settings = scheduler.settings();
        return Ok(Some(serde_json::json!({
            "delay": settings.delay_ms,
            "backoff": settings.backoff.as_millis() as u64,
            "live_stats_port": settings.live_stats_port,
            "verbosity": ctx.log.verbosity(),
            "mode": ctx.stats.control.mode.as_str(),
        })));
    }

    if cmd.starts_with("stats") {
        let doc = stats::build(&ctx.stats);
        return serde_json::to_value(doc)
            .map(Some)
            .map_err(|e| e.to_string());
    }

    if let Some(input) = cmd.strip_prefix("set input enable ") {
        return set_input_enabled(ctx, input.trim(), true).map(|_| None);
    }
    if let Some(input) = cmd.strip_prefix("set input disable ") {
        return set_input_enabled(ctx, input.trim(), false).map(|_| None);
    }

    if let Some(value) = cmd.strip_prefix("set delay ") {
        let value = value.trim();
        let mut settings = scheduler.settings();
        if value == "null" {
            settings.delay_ms = None;
            tracing::info!("RC disabling delay");
        } else {
            let delay: i64 = value.parse().map_err(|_| "cannot parse delay")?;
            if !(-100_000..=100_000).contains(&delay) {
                return Err("delay value out of bounds +/- 100s".into());
            }
            settings.delay_ms = Some(delay);
            tracing::info!(delay, "RC setting delay");
        }
        scheduler.update_settings(settings);
        return Ok(None);
    }

    if let Some(value) = cmd.strip_prefix("set backoff ") {
        let backoff: i64 = value.trim().parse().map_err(|_| "cannot parse backoff")?;
        if !(0..=100_000).contains(&backoff) {
            return Err("backoff value out of bounds 0 to 100s".into());
        }
        let mut settings = scheduler.settings();
        settings.backoff = Duration::from_millis(backoff as u64);
        scheduler.update_settings(settings);
        tracing::info!(backoff, "RC setting backoff");
        return Ok(None);
    }

    if let Some(value) = cmd.strip_prefix("set live_stats_port ") {
        let port: i64 = value.trim().parse().map_err(|_| "cannot parse port")?;
        if !(0..=65_535).contains(&port) {
            return Err("live_stats_port value out of bounds".into());
        }
        let mut settings = scheduler.settings();
        settings.live_stats_port = port as u16;
        scheduler.update_settings(settings);
        tracing::info!(port, "RC setting live_stats_port");
        return Ok(None);
    }

    if let Some(value) = cmd.strip_prefix("set verbose ") {
        let verbosity: i64 = value.trim().parse().map_err(|_| "cannot parse verbosity")?;
        if !(0..=3).contains(&verbosity) {
            return Err("verbosity value out of bounds 0 to 3".into());
        }
        ctx.log.set_verbosity(verbosity as u8)?;
        tracing::info!(verbosity, "RC setting verbosity");
        return Ok(None);
    }

    if cmd.starts_with("reset counters") {
        ctx.stats.control.reset_poll_timeouts();
        for source in &ctx.stats.control.sources {
            source.reset_counters();
        }
        scheduler.reset_counters();
        tracing::info!("RC resetting all counters");
        return Ok(None);
    }

    Err("Unknown command".into())
}

fn set_input_enabled(ctx: &RcContext, label: &str, enabled: bool) -> Result<(), String> {
    match ctx
        .stats
        .control
        .sources
        .iter()
        .find(|s| s.label() == label)
    {
        Some(source) => {
            source.set_enabled(enabled);
            tracing::info!(input = label, enabled, "RC toggling input");
            Ok(())
        }
        None => Err("Cannot find specified input".into()),
    }
}

fn envelope(cmd: &str, result: Result<Option<serde_json::Value>, String>) -> String {
    let value = match result {
        Ok(Some(response)) => serde_json::json!({
            "status": "ok",
            "cmd": cmd,
            "response": response,
        }),
        Ok(None) => serde_json::json!({
            "status": "ok",
            "cmd": cmd,
        }),
        Err(message) => serde_json::json!({
            "status": "error",
            "cmd": cmd,
            "message": message,
        }),
    };
    value.to_string()
}

/// Bind the socket and serve requests until cancelled.
pub async fn run(
    socket_path: PathBuf,
    ctx: RcContext,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let socket = UnixDatagram::bind(&socket_path)?;
    // operators in the same group may control the process
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o664))?;
    tracing::info!(path = %socket_path.display(), "remote control listening");

    let mut buf = vec![0u8; 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        tracing::warn!(error = %e, "RC receive failed");
                        continue;
                    }
                };
                let cmd = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                let response = envelope(&cmd, handle_command(&ctx, &cmd));

                let Some(peer_path) = peer.as_pathname().map(Path::to_path_buf) else {
                    tracing::warn!("RC client without bound path, cannot reply");
                    continue;
                };
                if let Err(e) = socket.send_to(response.as_bytes(), &peer_path).await {
                    tracing::warn!(error = %e, "could not send RC response");
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(test)]
#[path = "rc_test.rs"]
mod tests;
