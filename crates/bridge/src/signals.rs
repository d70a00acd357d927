//! Signal handling
//!
//! SIGTERM exits immediately with status 0; SIGHUP, SIGINT and SIGQUIT
//! request a cooperative shutdown through the cancellation token.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub fn install(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        term.recv().await;
        eprintln!("Received SIGTERM");
        std::process::exit(0);
    });

    for kind in [
        SignalKind::hangup(),
        SignalKind::interrupt(),
        SignalKind::quit(),
    ] {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "cannot install signal handler");
                    return;
                }
            };
            if stream.recv().await.is_some() {
                tracing::info!("shutdown requested by signal");
                cancel.cancel();
            }
        });
    }
}
