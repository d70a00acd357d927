//! Logging setup with runtime-adjustable verbosity
//!
//! Verbosity follows the repeatable `-v` flag and can be changed through
//! the remote control (`set verbose 0..3`), so the filter sits behind a
//! reload handle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Changes the active log filter after initialisation.
#[derive(Clone)]
pub struct LogHandle {
    /// Absent when no subscriber is installed (tests).
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    verbosity: Arc<AtomicU8>,
}

fn filter_for(verbosity: u8) -> EnvFilter {
    let directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v when set
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Install the global subscriber. Call once per process.
pub fn init(verbosity: u8) -> LogHandle {
    let (filter, handle) = reload::Layer::new(filter_for(verbosity));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();

    LogHandle {
        reload: Some(handle),
        verbosity: Arc::new(AtomicU8::new(verbosity)),
    }
}

impl LogHandle {
    /// A handle not wired to any subscriber; tracks verbosity only.
    pub fn detached(verbosity: u8) -> Self {
        Self {
            reload: None,
            verbosity: Arc::new(AtomicU8::new(verbosity)),
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    pub fn set_verbosity(&self, verbosity: u8) -> Result<(), String> {
        if let Some(reload) = &self.reload {
            reload
                .reload(filter_for(verbosity))
                .map_err(|e| e.to_string())?;
        }
        self.verbosity.store(verbosity, Ordering::Relaxed);
        Ok(())
    }
}
